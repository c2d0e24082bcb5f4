//! Session Bootstrap and Command Delivery
//!
//! Everything that talks to an already-established link: the one-time
//! bootstrap sequence that takes a fresh connection to a usable session,
//! and the ordered writer used for steady-state motor frames.

use crate::domain::models::CharacteristicHandles;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{HubTransport, TransportError, WriteMode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Failures that end a session. Recovery is always a full reconnect.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Discovery completed without the control characteristic.
    #[error("control characteristic missing after discovery")]
    ProtocolMismatch,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Timing bounds for the bootstrap sequence.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapConfig {
    /// Bound on each acknowledged write.
    pub write_timeout: Duration,
    /// Bound on waiting for the program's ready sentinel.
    pub ready_timeout: Duration,
}

/// Acknowledged write with a bounded wait. A timeout is reported with
/// transport-error severity, like any other write failure.
pub async fn write_acked(
    transport: &dyn HubTransport,
    handle: u16,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    match tokio::time::timeout(timeout, transport.write(handle, payload, WriteMode::WithResponse))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

/// One-time post-connect sequence. Runs on its own worker, never on the
/// event-delivery path, because step 3 blocks on a notification that the
/// event path must remain free to deliver.
///
/// `ready` fires when the decoder sees the program's ready sentinel.
pub async fn run_bootstrap(
    transport: Arc<dyn HubTransport>,
    handles: CharacteristicHandles,
    ready: oneshot::Receiver<()>,
    config: BootstrapConfig,
) -> Result<(), SessionError> {
    // Step 1: enable notifications. Losing hub feedback is survivable, so
    // a failure here degrades the session instead of ending it.
    let subscribed = write_acked(
        &*transport,
        handles.notify_config,
        &protocol::ENABLE_NOTIFICATIONS,
        config.write_timeout,
    )
    .await;
    if let Err(e) = subscribed {
        warn!(error = %e, "notification subscribe failed, starting without hub feedback");
    }

    // Step 2: start the pre-installed program. Without it the hub ignores
    // stdin, so a failure aborts the session; the retry is a reconnect.
    write_acked(
        &*transport,
        handles.command_value,
        &protocol::start_program_frame(),
        config.write_timeout,
    )
    .await?;
    info!("start-program command acknowledged");

    // Step 3: wait for the ready sentinel, bounded. Timing out is a soft
    // condition; the program is usually up even when the sentinel is lost.
    match tokio::time::timeout(config.ready_timeout, ready).await {
        Ok(Ok(())) => info!("hub program reported ready"),
        Ok(Err(_)) => debug!("ready signal abandoned, session is being torn down"),
        Err(_) => warn!(
            timeout = ?config.ready_timeout,
            "no ready sentinel within bound, proceeding optimistically"
        ),
    }

    Ok(())
}

struct OutboundFrame {
    handle: u16,
    payload: Vec<u8>,
}

/// Ordered fire-and-forget writer for steady-state motor frames.
///
/// Frames are queued from the controller task and written sequentially by a
/// dedicated worker, so consecutive commands reach the hub in request order
/// while the controller's event loop never waits on the radio.
pub struct CommandChannel {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn HubTransport>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let written = transport
                    .write(frame.handle, &frame.payload, WriteMode::WithoutResponse)
                    .await;
                if let Err(e) = written {
                    // Dropped motor frames are superseded by the next user
                    // input; the link manager handles the disconnect.
                    warn!(error = %e, "motor frame write failed");
                }
            }
        });
        Self { tx }
    }

    /// Queue a frame for ordered fire-and-forget delivery.
    pub fn send_unacked(&self, handle: u16, payload: Vec<u8>) {
        let _ = self.tx.send(OutboundFrame { handle, payload });
    }
}
