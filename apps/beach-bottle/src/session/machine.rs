use crate::error::{BottleError, Result};
use crate::transport::TransportStatus;
use crate::transport::webrtc::descriptor::DescriptorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

impl PeerRole {
    /// The only descriptor kind this role may produce locally.
    pub fn local_kind(self) -> DescriptorKind {
        match self {
            PeerRole::Initiator => DescriptorKind::Offer,
            PeerRole::Responder => DescriptorKind::Answer,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    LocalDescriptorReady,
    RemoteDescriptorApplied,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }
}

/// Role assignment and lifecycle bookkeeping for one session.
///
/// Holds no I/O. Validation (`check_*`) never mutates; every mutating call
/// reports the states it entered so the owner can emit them in order.
#[derive(Debug)]
pub struct SessionMachine {
    role: Option<PeerRole>,
    state: SessionState,
    local_produced: bool,
    local_exported: bool,
    remote_applied: bool,
    // Channel opened before the remote descriptor was recorded.
    connected_early: bool,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            role: None,
            state: SessionState::New,
            local_produced: false,
            local_exported: false,
            remote_applied: false,
            connected_early: false,
        }
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn check_initiator(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("start as initiator"));
        }
        match self.role {
            None if self.state == SessionState::New => Ok(()),
            Some(PeerRole::Initiator) => Err(BottleError::RoleConflict(
                "session already started as initiator".into(),
            )),
            Some(PeerRole::Responder) => Err(BottleError::RoleConflict(
                "session already answered a remote offer".into(),
            )),
            None => Err(self.invalid("start as initiator")),
        }
    }

    pub fn begin_initiator(&mut self) -> Result<()> {
        self.check_initiator()?;
        self.role = Some(PeerRole::Initiator);
        tracing::debug!(target = "beach_bottle::session", role = ?PeerRole::Initiator, "role assigned");
        Ok(())
    }

    /// Validates an inbound descriptor and returns the role this side holds
    /// once it is applied.
    pub fn check_remote(&self, kind: DescriptorKind) -> Result<PeerRole> {
        if self.state.is_terminal() {
            return Err(self.invalid("apply a remote descriptor"));
        }
        if self.remote_applied {
            return Err(BottleError::RoleConflict(
                "a remote descriptor was already applied to this session".into(),
            ));
        }
        match (self.role, kind) {
            (None, DescriptorKind::Offer) => Ok(PeerRole::Responder),
            (None, DescriptorKind::Answer) => Err(BottleError::RoleConflict(
                "received an answer but this side never offered".into(),
            )),
            (Some(PeerRole::Initiator), DescriptorKind::Offer) => Err(BottleError::RoleConflict(
                "both sides produced an offer".into(),
            )),
            (Some(PeerRole::Initiator), DescriptorKind::Answer) => {
                if self.local_exported {
                    Ok(PeerRole::Initiator)
                } else {
                    Err(self.invalid("apply an answer before the offer is exported"))
                }
            }
            // A responder only ever consumes the single offer that made it one.
            (Some(PeerRole::Responder), _) => Err(BottleError::RoleConflict(
                "responder cannot accept another descriptor".into(),
            )),
        }
    }

    pub fn apply_remote(&mut self, kind: DescriptorKind) -> Result<Vec<SessionState>> {
        let role = self.check_remote(kind)?;
        if self.role.is_none() {
            self.role = Some(role);
            tracing::debug!(target = "beach_bottle::session", ?role, "role assigned");
        }
        self.remote_applied = true;
        let mut entered = vec![self.enter(SessionState::RemoteDescriptorApplied)];
        if role == PeerRole::Initiator {
            entered.push(self.enter(SessionState::Connecting));
        }
        if self.connected_early {
            entered.push(self.enter(SessionState::Connected));
        }
        Ok(entered)
    }

    pub fn check_local(&self, kind: DescriptorKind) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("create a local descriptor"));
        }
        let role = self
            .role
            .ok_or_else(|| self.invalid("create a local descriptor without a role"))?;
        if self.local_produced {
            return Err(BottleError::RoleConflict(
                "this side already produced its descriptor".into(),
            ));
        }
        if role.local_kind() != kind {
            return Err(BottleError::RoleConflict(format!(
                "{role:?} cannot produce an {}",
                kind.as_str()
            )));
        }
        if role == PeerRole::Responder && !self.remote_applied {
            return Err(self.invalid("answer before the offer is applied"));
        }
        Ok(())
    }

    pub fn local_descriptor_created(&mut self, kind: DescriptorKind) -> Result<SessionState> {
        self.check_local(kind)?;
        self.local_produced = true;
        Ok(self.enter(SessionState::LocalDescriptorReady))
    }

    /// Called once the gathering gate resolved and the descriptor was handed
    /// to the caller.
    pub fn local_descriptor_exported(&mut self) -> Result<Option<SessionState>> {
        if !self.local_produced || self.local_exported || self.state.is_terminal() {
            return Err(self.invalid("export the local descriptor"));
        }
        self.local_exported = true;
        // The transport may already have moved on while the gate was pending.
        match (self.role, self.state) {
            (Some(PeerRole::Responder), SessionState::LocalDescriptorReady) => {
                Ok(Some(self.enter(SessionState::Connecting)))
            }
            _ => Ok(None),
        }
    }

    /// Folds a transport notification into the lifecycle. Returns the new
    /// state when it changed; terminal states swallow everything after them.
    pub fn on_transport(&mut self, status: TransportStatus) -> Option<SessionState> {
        if self.state == SessionState::New || self.state.is_terminal() {
            tracing::trace!(
                target = "beach_bottle::session",
                state = ?self.state,
                ?status,
                "ignoring transport status"
            );
            return None;
        }
        let next = match status {
            TransportStatus::Connecting if !self.remote_applied => return None,
            TransportStatus::Connecting => match self.state {
                SessionState::LocalDescriptorReady | SessionState::RemoteDescriptorApplied => {
                    SessionState::Connecting
                }
                _ => return None,
            },
            TransportStatus::Connected if !self.remote_applied => {
                self.connected_early = true;
                return None;
            }
            TransportStatus::Connected => SessionState::Connected,
            TransportStatus::Disconnected => SessionState::Disconnected,
            TransportStatus::Failed => SessionState::Failed,
        };
        if next == self.state {
            return None;
        }
        Some(self.enter(next))
    }

    /// A local setup step failed after this side took its role. The peer
    /// connection is unusable from here on, so the session goes to `Failed`
    /// even from `New`. Returns `None` once already terminal.
    pub fn abort(&mut self) -> Option<SessionState> {
        if self.state.is_terminal() {
            return None;
        }
        Some(self.enter(SessionState::Failed))
    }

    fn enter(&mut self, next: SessionState) -> SessionState {
        tracing::debug!(
            target = "beach_bottle::session",
            from = ?self.state,
            to = ?next,
            role = ?self.role,
            "session state transition"
        );
        self.state = next;
        next
    }

    fn invalid(&self, operation: &'static str) -> BottleError {
        BottleError::InvalidState {
            operation,
            state: self.state,
        }
    }
}
