//! The collaborator-facing chat session.
//!
//! A [`ChatSession`] owns one peer connection, its role, its shared key and
//! its chat channel. WebRTC callbacks land on webrtc-rs tasks; they only ever
//! touch session state through the single [`SessionMachine`] mutex, and every
//! transition is emitted on the [`SessionEvents`] stream while that lock is
//! held so observers see transitions in the order they happened.
//!
//! Terminal states are final. The session neither reconnects nor tears the
//! peer connection down by itself; callers drop it (or call
//! [`ChatSession::close`]) and build a new one.

pub mod machine;

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::config::Config;
use crate::crypto::{KeyMaterial, SharedKey};
use crate::error::{BottleError, Result};
use crate::protocol::{self, ChatMessage};
use crate::transport::webrtc::descriptor::{self, CandidateEntry, ConnectionDescriptor, DescriptorKind};
use crate::transport::webrtc::gather::GatheringGate;
use crate::transport::webrtc::{chat_channel_init, new_peer_connection, status_from_peer_state};
use crate::transport::{TransportError, TransportStatus, to_setup_error};

pub use machine::{PeerRole, SessionMachine, SessionState};

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Message(ChatMessage),
    /// An inbound frame was dropped; the session keeps running.
    DecryptError(BottleError),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

struct Shared {
    id: Uuid,
    machine: Mutex<SessionMachine>,
    key: OnceLock<SharedKey>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    candidates: Mutex<Vec<CandidateEntry>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(target = "beach_bottle::session", session_id = %self.id, "event receiver dropped");
        }
    }

    fn transport(&self, status: TransportStatus) {
        let mut machine = self.machine.lock();
        if let Some(state) = machine.on_transport(status) {
            tracing::info!(target = "beach_bottle::session", session_id = %self.id, ?state, "connection state changed");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let Some(key) = self.key.get() else {
            tracing::warn!(target = "beach_bottle::session", session_id = %self.id, "frame arrived before key import");
            self.emit(SessionEvent::DecryptError(BottleError::KeyImport(
                "no key imported for this session".into(),
            )));
            return;
        };
        match protocol::open(key, frame) {
            Ok(message) => {
                tracing::debug!(
                    target = "beach_bottle::session",
                    session_id = %self.id,
                    frame_len = frame.len(),
                    nickname = %message.nickname,
                    "received chat message"
                );
                self.emit(SessionEvent::Message(message));
            }
            Err(err) => {
                tracing::warn!(
                    target = "beach_bottle::session",
                    session_id = %self.id,
                    frame_len = frame.len(),
                    error = %err,
                    "dropping inbound frame"
                );
                self.emit(SessionEvent::DecryptError(err));
            }
        }
    }
}

pub struct ChatSession {
    config: Config,
    pc: Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
    // Serializes start/accept so validation and mutation cannot interleave.
    operation: AsyncMutex<()>,
}

impl ChatSession {
    pub async fn new(config: Config) -> Result<(Self, SessionEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            machine: Mutex::new(SessionMachine::new()),
            key: OnceLock::new(),
            channel: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            events: events_tx,
        });
        let pc = new_peer_connection(&config).await?;
        register_peer_handlers(&pc, &shared);
        tracing::debug!(target = "beach_bottle::session", session_id = %shared.id, "session created");
        Ok((
            Self {
                config,
                pc,
                shared,
                operation: AsyncMutex::new(()),
            },
            events_rx,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.machine.lock().state()
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.shared.machine.lock().role()
    }

    /// Takes the initiator role, opens the chat channel and returns the
    /// offer as a transport string once candidate gathering completed.
    pub async fn start_as_initiator(&self, key: &KeyMaterial) -> Result<String> {
        let _guard = self.operation.lock().await;
        let key = key.import_async().await?;
        self.check_key(&key)?;
        self.shared.machine.lock().check_initiator()?;
        self.install_key(key)?;
        self.shared.machine.lock().begin_initiator()?;

        self.open_channel_and_offer()
            .await
            .inspect_err(|err| self.abort(err))
    }

    /// Applies a pasted descriptor. A fresh session becomes the responder and
    /// gets back its answer; an initiator completes the exchange and gets
    /// `None`.
    pub async fn accept_remote(&self, remote: &str, key: &KeyMaterial) -> Result<Option<String>> {
        let _guard = self.operation.lock().await;
        let key = key.import_async().await?;
        self.check_key(&key)?;
        let descriptor = descriptor::decode(remote)?;
        let role = self.shared.machine.lock().check_remote(descriptor.kind)?;
        let session_description = descriptor.to_session_description()?;
        self.install_key(key)?;

        tracing::debug!(
            target = "beach_bottle::session",
            session_id = %self.shared.id,
            kind = descriptor.kind.as_str(),
            ?role,
            bundled_candidates = descriptor.candidates.len(),
            "applying remote descriptor"
        );
        self.pc
            .set_remote_description(session_description)
            .await
            .map_err(to_setup_error)?;
        for entry in descriptor.missing_candidates() {
            if let Err(err) = self.pc.add_ice_candidate(entry.to_init()).await {
                tracing::warn!(
                    target = "beach_bottle::session",
                    session_id = %self.shared.id,
                    candidate = %entry.candidate,
                    error = %err,
                    "failed to add bundled candidate"
                );
            }
        }
        {
            let mut machine = self.shared.machine.lock();
            for state in machine.apply_remote(descriptor.kind)? {
                self.shared.emit(SessionEvent::StateChanged(state));
            }
        }

        match role {
            PeerRole::Initiator => Ok(None),
            PeerRole::Responder => self
                .export_local(DescriptorKind::Answer)
                .await
                .map(Some)
                .inspect_err(|err| self.abort(err)),
        }
    }

    /// Encrypts and sends one chat message, returning it as sent.
    pub async fn send(&self, text: &str, nickname: &str) -> Result<ChatMessage> {
        if self.state() != SessionState::Connected {
            return Err(BottleError::NotConnected);
        }
        let key = self.shared.key.get().ok_or(BottleError::NotConnected)?;
        let channel = self
            .shared
            .channel
            .lock()
            .clone()
            .ok_or(BottleError::NotConnected)?;

        let message = ChatMessage::now(text, nickname);
        let frame = protocol::seal(key, &message)?;
        let frame_len = frame.len();
        channel.send_text(frame).await.map_err(|err| {
            tracing::warn!(
                target = "beach_bottle::session",
                session_id = %self.shared.id,
                error = %err,
                "chat channel send failed"
            );
            TransportError::ChannelClosed
        })?;
        tracing::debug!(target = "beach_bottle::session", session_id = %self.shared.id, frame_len, "sent chat message");
        Ok(message)
    }

    /// Explicit teardown of the peer connection.
    pub async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(to_setup_error)?;
        Ok(())
    }

    async fn open_channel_and_offer(&self) -> Result<String> {
        let channel = self
            .pc
            .create_data_channel(&self.config.data_channel_label, Some(chat_channel_init()))
            .await
            .map_err(to_setup_error)?;
        tracing::debug!(
            target = "beach_bottle::session",
            session_id = %self.shared.id,
            label = %channel.label(),
            "created chat channel"
        );
        bind_channel(&self.shared, channel);
        self.export_local(DescriptorKind::Offer).await
    }

    async fn export_local(&self, kind: DescriptorKind) -> Result<String> {
        self.shared.machine.lock().check_local(kind)?;

        let gate = GatheringGate::attach(&self.pc).await;
        let description = match kind {
            DescriptorKind::Offer => self.pc.create_offer(None).await,
            DescriptorKind::Answer => self.pc.create_answer(None).await,
        }
        .map_err(to_setup_error)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)?;
        {
            let mut machine = self.shared.machine.lock();
            let state = machine.local_descriptor_created(kind)?;
            self.shared.emit(SessionEvent::StateChanged(state));
        }

        tracing::trace!(
            target = "beach_bottle::session",
            session_id = %self.shared.id,
            await = "gather.wait",
            state = "start"
        );
        gate.wait_with(self.config.gather_timeout).await?;
        tracing::trace!(
            target = "beach_bottle::session",
            session_id = %self.shared.id,
            await = "gather.wait",
            state = "end"
        );

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
        let candidates = self.shared.candidates.lock().clone();
        let descriptor = ConnectionDescriptor::from_session_description(&local, candidates)?;
        let encoded = descriptor::encode(&descriptor)?;
        {
            let mut machine = self.shared.machine.lock();
            if let Some(state) = machine.local_descriptor_exported()? {
                self.shared.emit(SessionEvent::StateChanged(state));
            }
        }
        tracing::info!(
            target = "beach_bottle::session",
            session_id = %self.shared.id,
            kind = kind.as_str(),
            candidates = descriptor.candidates.len(),
            encoded_len = encoded.len(),
            "local descriptor ready"
        );
        Ok(encoded)
    }

    // Past this point the peer connection has committed to a role, so a
    // failed local step cannot be retried on the same session.
    fn abort(&self, err: &BottleError) {
        let mut machine = self.shared.machine.lock();
        if let Some(state) = machine.abort() {
            tracing::warn!(
                target = "beach_bottle::session",
                session_id = %self.shared.id,
                error = %err,
                "local setup failed"
            );
            self.shared.emit(SessionEvent::StateChanged(state));
        }
    }

    fn check_key(&self, key: &SharedKey) -> Result<()> {
        match self.shared.key.get() {
            Some(existing) if existing != key => Err(BottleError::KeyImport(
                "key differs from the one this session started with".into(),
            )),
            _ => Ok(()),
        }
    }

    fn install_key(&self, key: SharedKey) -> Result<()> {
        if self.shared.key.get().is_some() {
            return self.check_key(&key);
        }
        let _ = self.shared.key.set(key);
        Ok(())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        let pc = Arc::clone(&self.pc);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}

fn register_peer_handlers(pc: &Arc<RTCPeerConnection>, shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            tracing::debug!(target = "beach_bottle::session", session_id = %shared.id, ?state, "peer connection state changed");
            if let Some(status) = status_from_peer_state(state) {
                shared.transport(status);
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let weak = weak.clone();
        Box::pin(async move {
            let (Some(shared), Some(candidate)) = (weak.upgrade(), candidate) else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    tracing::trace!(target = "beach_bottle::session", session_id = %shared.id, candidate = %init.candidate, "gathered candidate");
                    shared.candidates.lock().push(CandidateEntry::from_init(init));
                }
                Err(err) => {
                    tracing::warn!(target = "beach_bottle::session", session_id = %shared.id, error = %err, "failed to serialize candidate");
                }
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            let role = shared.machine.lock().role();
            if role != Some(PeerRole::Responder) || shared.channel.lock().is_some() {
                tracing::warn!(
                    target = "beach_bottle::session",
                    session_id = %shared.id,
                    label = %channel.label(),
                    ?role,
                    "ignoring unexpected inbound data channel"
                );
                return;
            }
            tracing::debug!(target = "beach_bottle::session", session_id = %shared.id, label = %channel.label(), "inbound chat channel");
            bind_channel(&shared, channel);
        })
    }));
}

fn bind_channel(shared: &Arc<Shared>, channel: Arc<RTCDataChannel>) {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let open_weak = weak.clone();
    channel.on_open(Box::new(move || {
        let weak = open_weak.clone();
        Box::pin(async move {
            if let Some(shared) = weak.upgrade() {
                tracing::debug!(target = "beach_bottle::session", session_id = %shared.id, "chat channel open");
                shared.transport(TransportStatus::Connected);
            }
        })
    }));

    let close_weak = weak.clone();
    channel.on_close(Box::new(move || {
        let weak = close_weak.clone();
        Box::pin(async move {
            if let Some(shared) = weak.upgrade() {
                tracing::debug!(target = "beach_bottle::session", session_id = %shared.id, "chat channel closed");
                shared.transport(TransportStatus::Disconnected);
            }
        })
    }));

    let error_weak = weak.clone();
    channel.on_error(Box::new(move |err| {
        let weak = error_weak.clone();
        Box::pin(async move {
            if let Some(shared) = weak.upgrade() {
                tracing::warn!(target = "beach_bottle::session", session_id = %shared.id, error = %err, "chat channel error");
            }
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(shared) = weak.upgrade() {
                shared.handle_frame(&msg.data);
            }
        })
    }));

    let already_open = channel.ready_state() == RTCDataChannelState::Open;
    *shared.channel.lock() = Some(channel);
    if already_open {
        shared.transport(TransportStatus::Connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session() -> Option<(ChatSession, SessionEvents)> {
        match ChatSession::new(Config::localhost()).await {
            Ok(pair) => Some(pair),
            Err(err) => {
                tracing::trace!(target = "beach_bottle::session", error = %err, "skipping: peer connection unavailable");
                None
            }
        }
    }

    fn drain_states(events: &mut SessionEvents) -> Vec<SessionState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn empty_key_is_rejected_before_any_transport_action() {
        let Some((session, mut events)) = session().await else { return };
        for key in [KeyMaterial::Encoded(String::new()), KeyMaterial::Passphrase("  ".into())] {
            let err = session.accept_remote("ignored", &key).await.unwrap_err();
            assert!(matches!(err, BottleError::KeyImport(_)));
            let err = session.start_as_initiator(&key).await.unwrap_err();
            assert!(matches!(err, BottleError::KeyImport(_)));
        }
        assert_eq!(session.state(), SessionState::New);
        assert_eq!(session.role(), None);
        assert!(session.pc.local_description().await.is_none());
        assert!(drain_states(&mut events).is_empty());
    }

    #[tokio::test]
    async fn malformed_descriptor_leaves_session_untouched() {
        let Some((session, mut events)) = session().await else { return };
        let key = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        let err = session.accept_remote("definitely not a descriptor", &key).await.unwrap_err();
        assert!(matches!(err, BottleError::DescriptorFormat(_)));
        assert_eq!(session.state(), SessionState::New);
        assert_eq!(session.role(), None);
        assert!(drain_states(&mut events).is_empty());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let Some((session, _events)) = session().await else { return };
        assert!(matches!(
            session.send("hi", "Alice").await,
            Err(BottleError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn initiator_rejects_its_own_offer() {
        let Some((session, mut events)) = session().await else { return };
        let key = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        let offer = match tokio::time::timeout(
            std::time::Duration::from_secs(20),
            session.start_as_initiator(&key),
        )
        .await
        {
            Ok(result) => result.expect("offer"),
            Err(_) => panic!("gathering never completed"),
        };
        assert_eq!(session.role(), Some(PeerRole::Initiator));
        assert_eq!(drain_states(&mut events), vec![SessionState::LocalDescriptorReady]);

        let err = session.accept_remote(&offer, &key).await.unwrap_err();
        assert!(matches!(err, BottleError::RoleConflict(_)));
        assert_eq!(session.state(), SessionState::LocalDescriptorReady);
        assert!(drain_states(&mut events).is_empty());

        let err = session.start_as_initiator(&key).await.unwrap_err();
        assert!(matches!(err, BottleError::RoleConflict(_)));
    }

    #[tokio::test]
    async fn key_cannot_change_mid_session() {
        let Some((session, _events)) = session().await else { return };
        let key = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        tokio::time::timeout(
            std::time::Duration::from_secs(20),
            session.start_as_initiator(&key),
        )
        .await
        .expect("gathering never completed")
        .expect("offer");

        let other = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        let err = session.accept_remote("irrelevant", &other).await.unwrap_err();
        assert!(matches!(err, BottleError::KeyImport(_)));
    }

    #[tokio::test]
    async fn gather_timeout_fails_the_session_once() {
        let config = Config::localhost()
            .with_ice_servers(vec!["stun:10.255.255.1:3478".to_string()])
            .with_gather_timeout(Some(std::time::Duration::from_millis(200)));
        let (session, mut events) = match ChatSession::new(config).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::trace!(target = "beach_bottle::session", error = %err, "skipping: peer connection unavailable");
                return;
            }
        };
        let key = KeyMaterial::Encoded(SharedKey::generate().to_base64());
        match session.start_as_initiator(&key).await {
            Err(BottleError::Transport(TransportError::Timeout)) => {}
            Ok(_) => {
                // Gathering finished inside the deadline; nothing to fail.
                return;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(
            drain_states(&mut events),
            vec![SessionState::LocalDescriptorReady, SessionState::Failed]
        );

        let err = session.start_as_initiator(&key).await.unwrap_err();
        assert!(matches!(
            err,
            BottleError::InvalidState {
                state: SessionState::Failed,
                ..
            }
        ));
        assert!(drain_states(&mut events).is_empty());
    }
}
