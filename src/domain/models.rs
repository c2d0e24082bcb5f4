//! Core domain types shared between the controller and its collaborators.

/// Connection lifecycle of the single hub link.
///
/// Exactly one instance exists, owned by the controller task. Commands
/// transmit to the hub only in [`ConnectionState::Ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Discovering,
    Initializing,
    Ready,
}

impl ConnectionState {
    /// Lowercase state label exposed to status consumers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
        }
    }
}

/// Motor commands accepted at the public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalCommand {
    Forward,
    Backward,
    Stop,
}

impl LogicalCommand {
    /// The single ASCII byte the hub program reads from its stdin.
    pub fn wire_byte(&self) -> u8 {
        match self {
            Self::Forward => b'F',
            Self::Backward => b'B',
            Self::Stop => b'S',
        }
    }

    /// Parse an external request string. Anything but the three known
    /// commands is rejected before it can reach the radio.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "forward" => Some(Self::Forward),
            "backward" => Some(Self::Backward),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::Stop => "stop",
        }
    }
}

/// Result of a command-send request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted to the hub (fire-and-forget).
    Sent,
    /// Link not ready; retained as the pending command.
    Queued,
    /// Not a known command, or the controller is gone. Nothing transmitted.
    Rejected,
}

impl SendOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sent => "ok",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
        }
    }
}

/// One BLE advertising report, as delivered by the transport.
#[derive(Debug, Clone)]
pub struct AdvertisingRecord {
    /// Transport-specific peripheral address, used to connect.
    pub address: String,
    pub local_name: Option<String>,
    pub service_uuids: Vec<uuid::Uuid>,
}

/// Identifier of the active link, valid between connect and disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubHandle(pub String);

impl std::fmt::Display for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute handles resolved once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandles {
    /// Value handle of the Pybricks command/event characteristic.
    pub command_value: u16,
    /// Client characteristic configuration descriptor, by GATT layout the
    /// attribute after the value.
    pub notify_config: u16,
}

impl CharacteristicHandles {
    pub fn from_value_handle(command_value: u16) -> Self {
        Self {
            command_value,
            notify_config: command_value + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        assert_eq!(LogicalCommand::parse("forward"), Some(LogicalCommand::Forward));
        assert_eq!(LogicalCommand::parse("backward"), Some(LogicalCommand::Backward));
        assert_eq!(LogicalCommand::parse("stop"), Some(LogicalCommand::Stop));
        assert_eq!(LogicalCommand::parse("faster"), None);
        assert_eq!(LogicalCommand::parse("FORWARD"), None);
        assert_eq!(LogicalCommand::parse(""), None);
    }

    #[test]
    fn test_notify_config_follows_value_handle() {
        let handles = CharacteristicHandles::from_value_handle(0x000c);
        assert_eq!(handles.command_value, 0x000c);
        assert_eq!(handles.notify_config, 0x000d);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Disconnected.name(), "disconnected");
        assert_eq!(ConnectionState::Ready.name(), "ready");
    }
}
