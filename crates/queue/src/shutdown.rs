//! Blocking stop handshake for background loops.
//!
//! The caller sends a stop request carrying an acknowledgement channel and
//! waits on it. The loop observes the request at its next scheduling point,
//! finishes its teardown, acknowledges, and only then exits. When `stop`
//! returns, the loop does no further work.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Caller side of the handshake.
#[derive(Debug, Clone)]
pub struct Stopper {
    component: &'static str,
    requests: mpsc::Sender<StopAck>,
}

/// Loop side of the handshake.
#[derive(Debug)]
pub struct StopSignal {
    requests: mpsc::Receiver<StopAck>,
}

/// Token the loop completes once it has quiesced.
#[derive(Debug)]
pub struct StopAck(oneshot::Sender<()>);

/// Create a connected stopper and signal for the loop named `component`.
#[must_use]
pub fn stop_channel(component: &'static str) -> (Stopper, StopSignal) {
    let (requests, receiver) = mpsc::channel(1);
    (
        Stopper {
            component,
            requests,
        },
        StopSignal { requests: receiver },
    )
}

impl Stopper {
    /// Request a stop and wait until the loop acknowledges it.
    ///
    /// Returns immediately if the loop has already exited.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.requests.send(StopAck(ack)).await.is_err() {
            debug!(component = self.component, "Loop already exited");
            return;
        }
        // A dropped ack means the loop ended without completing teardown.
        if done.await.is_err() {
            debug!(component = self.component, "Loop exited without acknowledging stop");
        }
        debug!(component = self.component, "Loop stopped");
    }
}

impl StopSignal {
    /// Wait for a stop request. `None` once every stopper has been dropped,
    /// which loops treat as a stop with nobody waiting.
    pub async fn requested(&mut self) -> Option<StopAck> {
        self.requests.recv().await
    }
}

impl StopAck {
    /// Complete the handshake, releasing the waiting caller.
    pub fn acknowledge(self) {
        // The caller may have given up waiting; nothing left to notify then.
        let _ = self.0.send(());
    }
}
