//! BLE Scanner Module
//!
//! Classifies advertising reports: is this the hub we are looking for?

use crate::domain::models::AdvertisingRecord;
use crate::infrastructure::bluetooth::protocol;
use uuid::Uuid;

/// Name substrings that identify the hub when the size-limited advertising
/// payload omits the service UUID.
pub const HUB_NAME_HINTS: &[&str] = &["Pybricks", "City Hub", "LEGO", "train"];

/// Advertisement filter for the hub.
///
/// A report matches if it advertises the hub service UUID, or if its local
/// name contains one of the configured substrings. The name fallback exists
/// because small advertising payloads frequently drop the 128-bit UUID.
#[derive(Debug, Clone)]
pub struct HubMatcher {
    service_uuid: Uuid,
    name_hints: Vec<String>,
}

impl HubMatcher {
    pub fn new(service_uuid: Uuid, name_hints: Vec<String>) -> Self {
        Self {
            service_uuid,
            name_hints,
        }
    }

    /// Matcher with the built-in service UUID and name hints.
    pub fn with_defaults() -> Self {
        Self::new(
            protocol::SERVICE_UUID,
            HUB_NAME_HINTS.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn matches(&self, record: &AdvertisingRecord) -> bool {
        if record.service_uuids.iter().any(|u| *u == self.service_uuid) {
            return true;
        }

        match &record.local_name {
            Some(name) => self.name_hints.iter().any(|hint| name.contains(hint)),
            None => false,
        }
    }
}
