//! hublink: BLE control plane for a Pybricks-powered LEGO train hub.
//!
//! This crate owns the hardest part of the train controller: the BLE
//! connection lifecycle and the hub command protocol. It scans for the hub
//! among all advertisers, connects, resolves the control characteristic,
//! starts the pre-installed hub program, and then relays single-byte motor
//! commands while self-healing across disconnects and power cycles.
//!
//! Collaborators (in the deployed system, an HTTP endpoint with a video
//! stream alongside) consume two entry points on [`HubController`]:
//! a quick, concurrency-safe command send and a state query.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hublink::{BtleplugTransport, ControllerConfig, HubController, LogicalCommand};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
//! let transport = Arc::new(
//!     BtleplugTransport::new(hublink::protocol::COMMAND_CHAR_UUID, event_tx).await?,
//! );
//! let controller = HubController::spawn(transport, event_rx, ControllerConfig::default());
//!
//! let outcome = controller.send_command(LogicalCommand::Forward).await;
//! println!("{} ({})", outcome.name(), controller.state_name());
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    AdvertisingRecord, CharacteristicHandles, ConnectionState, HubHandle, LogicalCommand,
    SendOutcome,
};
pub use domain::settings::{LogSettings, Settings, SettingsService};
pub use infrastructure::bluetooth::protocol;
pub use infrastructure::bluetooth::scanner::HubMatcher;
pub use infrastructure::bluetooth::service::{ControllerConfig, HubController};
pub use infrastructure::bluetooth::transport::{
    BtleplugTransport, HubTransport, TransportError, TransportEvent, WriteMode,
};
pub use infrastructure::logging;
