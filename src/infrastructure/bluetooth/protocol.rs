//! Pybricks Hub Protocol
//!
//! Wire constants and frame codecs for the hub's command/event
//! characteristic. Commands are a one-byte opcode followed by an optional
//! payload; events arrive as notifications whose first byte is the frame
//! type.

use crate::domain::models::LogicalCommand;
use tracing::debug;
use uuid::{uuid, Uuid};

/// Pybricks GATT service UUID advertised by the hub.
pub const SERVICE_UUID: Uuid = uuid!("c5f50001-8280-46da-89f4-6d8051e4aeef");

/// Command/event characteristic: commands are written here, events arrive
/// as notifications on the same attribute.
pub const COMMAND_CHAR_UUID: Uuid = uuid!("c5f50002-8280-46da-89f4-6d8051e4aeef");

/// Command opcode: start the user program stored on the hub.
pub const CMD_START_USER_PROGRAM: u8 = 0x01;

/// Command opcode: write the remaining bytes to the running program's stdin.
pub const CMD_WRITE_STDIN: u8 = 0x06;

/// Event frame type: hub status report.
pub const EVENT_STATUS_REPORT: u8 = 0x00;

/// Event frame type: output written by the running program.
pub const EVENT_WRITE_STDOUT: u8 = 0x01;

/// Substring the hub program prints once its motor is initialized.
pub const READY_SENTINEL: &str = "RDY";

/// CCCD value enabling notification delivery.
pub const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Status flag: remote interpreter active.
pub const STATUS_FLAG_REPL_ACTIVE: u8 = 0x20;

/// Status flag: user program running.
pub const STATUS_FLAG_PROGRAM_RUNNING: u8 = 0x40;

/// Notifications beyond this length are truncated before decoding.
pub const MAX_EVENT_PAYLOAD: usize = 64;

/// Hub state bits carried by a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStatus {
    pub repl_active: bool,
    pub program_running: bool,
}

/// A decoded hub-originated event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Status(HubStatus),
    /// Text the running program wrote to stdout.
    Output(String),
    /// Frame type this controller does not interpret.
    Unknown(u8),
}

/// Build the stdin-write frame for a motor command: opcode + one ASCII byte.
pub fn stdin_frame(cmd: LogicalCommand) -> [u8; 2] {
    [CMD_WRITE_STDIN, cmd.wire_byte()]
}

/// The single-byte start-program frame.
pub fn start_program_frame() -> [u8; 1] {
    [CMD_START_USER_PROGRAM]
}

/// Decode one notification payload. Returns `None` for an empty frame.
///
/// Oversized frames are truncated, never faulted: the hub's own output is
/// short, and a runaway payload must not take the decoder down with it.
pub fn decode_event(payload: &[u8]) -> Option<HubEvent> {
    let payload = if payload.len() > MAX_EVENT_PAYLOAD {
        debug!(
            len = payload.len(),
            "truncating oversized event frame to {} bytes", MAX_EVENT_PAYLOAD
        );
        &payload[..MAX_EVENT_PAYLOAD]
    } else {
        payload
    };

    let (&frame_type, rest) = payload.split_first()?;
    match frame_type {
        EVENT_STATUS_REPORT => {
            let flags = rest.first().copied().unwrap_or(0);
            Some(HubEvent::Status(HubStatus {
                repl_active: flags & STATUS_FLAG_REPL_ACTIVE != 0,
                program_running: flags & STATUS_FLAG_PROGRAM_RUNNING != 0,
            }))
        }
        EVENT_WRITE_STDOUT => Some(HubEvent::Output(
            String::from_utf8_lossy(rest).into_owned(),
        )),
        other => Some(HubEvent::Unknown(other)),
    }
}
