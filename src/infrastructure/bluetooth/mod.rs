//! Bluetooth Module
//!
//! BLE central for the hub: discovery, connection lifecycle, session
//! bootstrap, and command delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     HubController                       │
//! │   (actor owning the connection state machine; public    │
//! │    send/state API for collaborators)                    │
//! └─────────┬──────────────┬──────────────┬─────────────────┘
//!           │              │              │
//!           ▼              ▼              ▼
//!   ┌────────────┐  ┌────────────┐  ┌────────────┐
//!   │  Scanner   │  │ Connection │  │  Protocol  │
//!   │            │  │            │  │            │
//!   │ - advert   │  │ - session  │  │ - UUIDs    │
//!   │   matching │  │   bootstrap│  │ - framing  │
//!   │            │  │ - ordered  │  │ - event    │
//!   │            │  │   writer   │  │   decoding │
//!   └────────────┘  └────────────┘  └────────────┘
//!           │              │              │
//!           └──────────────┴──────────────┘
//!                          ▼
//!                  ┌──────────────┐
//!                  │  Transport   │
//!                  │ (HubTransport│
//!                  │  + btleplug) │
//!                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - hub wire constants, command framing, event decoding
//! - [`scanner`] - advertisement filtering
//! - [`transport`] - the BLE transport seam and its btleplug backend
//! - [`connection`] - session bootstrap and the ordered command writer
//! - [`service`] - the controller state machine and public handle

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

// Re-export the public surface for convenience
pub use service::{ControllerConfig, HubController};
