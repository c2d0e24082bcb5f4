//! BLE Transport Module
//!
//! The controller consumes the radio through the [`HubTransport`] trait:
//! request/response operations (scan control, connect, discovery, attribute
//! writes) plus an asynchronous event stream (advertisements, disconnects,
//! notifications) delivered over an mpsc channel supplied at construction.
//!
//! [`BtleplugTransport`] is the production backend. bluez and its peers
//! address attributes by UUID rather than ATT handle, so the resolver
//! reports a fixed handle pair and the backend maps the command-value
//! handle to the control characteristic; a write of the enable value to the
//! notify-config handle is realized as a subscribe (CCCD semantics).

use crate::domain::models::{AdvertisingRecord, CharacteristicHandles};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol;

/// Synthesized value handle reported for the control characteristic.
const CONTROL_VALUE_HANDLE: u16 = 0x000c;

/// Radio-level failures. All of these are non-fatal to the controller,
/// which answers them with reset-and-backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bluetooth backend: {0}")]
    Backend(#[from] btleplug::Error),
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("hub link is not established")]
    NotConnected,
    #[error("peripheral {0} is not known to the adapter")]
    UnknownPeripheral(String),
    #[error("unknown attribute handle {0:#06x}")]
    UnknownHandle(u16),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivery mode for an attribute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write; the call resolves when the peer confirms.
    WithResponse,
    /// Fire-and-forget write command.
    WithoutResponse,
}

/// Asynchronous events pushed by the transport to the controller.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Advertisement(AdvertisingRecord),
    Disconnected { reason: String },
    Notification { payload: Vec<u8> },
}

/// The BLE operations the controller consumes.
#[async_trait]
pub trait HubTransport: Send + Sync + 'static {
    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Connect to a previously advertised peripheral, bounded by `timeout`.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Tear the link down. A no-op without an established link.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Full-range characteristic discovery filtered to the control UUID.
    /// `Ok(None)` means discovery completed without finding it.
    async fn discover_control_characteristic(
        &self,
    ) -> Result<Option<CharacteristicHandles>, TransportError>;

    /// Write `payload` to the attribute at `handle`.
    async fn write(
        &self,
        handle: u16,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;
}

#[derive(Default)]
struct Link {
    peripheral: Option<Peripheral>,
    control: Option<Characteristic>,
}

/// Production transport over the platform BLE stack.
pub struct BtleplugTransport {
    adapter: Adapter,
    control_uuid: Uuid,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Arc<Mutex<Link>>,
}

impl BtleplugTransport {
    /// Open the first adapter and start pumping central events into
    /// `events`. The returned transport is idle until `start_scan`.
    pub async fn new(
        control_uuid: Uuid,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        let link = Arc::new(Mutex::new(Link::default()));
        let central_events = adapter.events().await?;
        tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            events.clone(),
            link.clone(),
        ));

        Ok(Self {
            adapter,
            control_uuid,
            events,
            link,
        })
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn pump_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Arc<Mutex<Link>>,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Some(record) = advertising_record(&adapter, &id).await {
                    if events.send(TransportEvent::Advertisement(record)).is_err() {
                        return;
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let was_current = {
                    let mut link = link.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    match &link.peripheral {
                        Some(peripheral) if peripheral.id() == id => {
                            link.peripheral = None;
                            link.control = None;
                            true
                        }
                        _ => false,
                    }
                };
                if was_current {
                    let dropped = events.send(TransportEvent::Disconnected {
                        reason: "link lost".to_string(),
                    });
                    if dropped.is_err() {
                        return;
                    }
                }
            }
            _ => {}
        }
    }
    debug!("central event stream ended");
}

async fn advertising_record(adapter: &Adapter, id: &PeripheralId) -> Option<AdvertisingRecord> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(AdvertisingRecord {
        address: id.to_string(),
        local_name: properties.local_name,
        service_uuids: properties.services,
    })
}

#[async_trait]
impl HubTransport for BtleplugTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        // Unfiltered: small advertising payloads may omit the service UUID,
        // and the name fallback needs to see those reports too.
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), TransportError> {
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| TransportError::UnknownPeripheral(address.to_string()))?;

        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(timeout)),
        }
        info!(address, "link established");

        {
            let mut link = self.lock_link();
            link.peripheral = Some(peripheral.clone());
            link.control = None;
        }

        let notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let control_uuid = self.control_uuid;
        tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(notification) = notifications.next().await {
                if notification.uuid != control_uuid {
                    continue;
                }
                let sent = events.send(TransportEvent::Notification {
                    payload: notification.value,
                });
                if sent.is_err() {
                    return;
                }
            }
            debug!("notification stream ended");
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Link bookkeeping is cleared by the central-event pump when the
        // DeviceDisconnected event arrives.
        let peripheral = self.lock_link().peripheral.clone();
        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_control_characteristic(
        &self,
    ) -> Result<Option<CharacteristicHandles>, TransportError> {
        let peripheral = self
            .lock_link()
            .peripheral
            .clone()
            .ok_or(TransportError::NotConnected)?;

        peripheral.discover_services().await?;
        let control = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.control_uuid);

        match control {
            Some(characteristic) => {
                self.lock_link().control = Some(characteristic);
                Ok(Some(CharacteristicHandles::from_value_handle(
                    CONTROL_VALUE_HANDLE,
                )))
            }
            None => {
                warn!(uuid = %self.control_uuid, "control characteristic not found");
                Ok(None)
            }
        }
    }

    async fn write(
        &self,
        handle: u16,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (peripheral, control) = {
            let link = self.lock_link();
            (link.peripheral.clone(), link.control.clone())
        };
        let peripheral = peripheral.ok_or(TransportError::NotConnected)?;
        let control = control.ok_or(TransportError::NotConnected)?;

        let handles = CharacteristicHandles::from_value_handle(CONTROL_VALUE_HANDLE);
        if handle == handles.command_value {
            let write_type = match mode {
                WriteMode::WithResponse => WriteType::WithResponse,
                WriteMode::WithoutResponse => WriteType::WithoutResponse,
            };
            peripheral.write(&control, payload, write_type).await?;
            Ok(())
        } else if handle == handles.notify_config {
            if payload == protocol::ENABLE_NOTIFICATIONS.as_slice() {
                peripheral.subscribe(&control).await?;
            } else {
                peripheral.unsubscribe(&control).await?;
            }
            Ok(())
        } else {
            Err(TransportError::UnknownHandle(handle))
        }
    }
}
