use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use webrtc::peer_connection::RTCPeerConnection;

use crate::transport::TransportError;

/// Creates a connected signal/gate pair. The gate resolves once the signal
/// reports completion, or immediately if it already has.
pub fn gate() -> (GatheringSignal, GatheringGate) {
    let (tx, rx) = watch::channel(false);
    (GatheringSignal { tx }, GatheringGate { rx })
}

#[derive(Debug)]
pub struct GatheringSignal {
    tx: watch::Sender<bool>,
}

impl GatheringSignal {
    pub fn complete(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone, Debug)]
pub struct GatheringGate {
    rx: watch::Receiver<bool>,
}

impl GatheringGate {
    /// Hooks a gate onto the peer connection's ICE gatherer. The promise handed
    /// out by webrtc closes right away when gathering already finished, so
    /// attaching late cannot miss the completion.
    pub async fn attach(pc: &Arc<RTCPeerConnection>) -> GatheringGate {
        let (signal, gate) = gate();
        let mut promise = pc.gathering_complete_promise().await;
        tokio::spawn(async move {
            let _ = promise.recv().await;
            tracing::debug!(target = "beach_bottle::transport::webrtc", "ice gathering complete");
            signal.complete();
        });
        gate
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits without a deadline.
    pub async fn wait(&self) -> Result<(), TransportError> {
        let mut rx = self.rx.clone();
        rx.wait_for(|complete| *complete)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn wait_with(&self, limit: Option<Duration>) -> Result<(), TransportError> {
        match limit {
            None => self.wait().await,
            Some(limit) => timeout(limit, self.wait())
                .await
                .map_err(|_| TransportError::Timeout)?,
        }
    }
}
