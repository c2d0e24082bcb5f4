//! Hub Controller Service
//!
//! The single authoritative connection state machine. One actor task owns
//! `ConnectionState` and every connection-scoped entity, and is the only
//! code that mutates them; external callers and the transport reach it
//! through message channels. Connect attempts, discovery, and the session
//! bootstrap run in spawned workers that report back as internal messages
//! tagged with the connection epoch, so completions from a torn-down cycle
//! are recognized and dropped.

use crate::domain::models::{
    AdvertisingRecord, CharacteristicHandles, ConnectionState, HubHandle, LogicalCommand,
    SendOutcome,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{
    self, BootstrapConfig, CommandChannel, SessionError,
};
use crate::infrastructure::bluetooth::protocol::{self, HubEvent};
use crate::infrastructure::bluetooth::scanner::HubMatcher;
use crate::infrastructure::bluetooth::transport::{HubTransport, TransportError, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timing bounds and matching rules for the connection lifecycle.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Length of one discovery window.
    pub scan_window: Duration,
    /// Delay before re-arming the scan after an empty window.
    pub scan_restart_delay: Duration,
    /// Delay before re-arming the scan after a disconnect or failed connect.
    pub reconnect_delay: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Bound on each acknowledged write.
    pub write_timeout: Duration,
    /// Bound on waiting for the program's ready sentinel.
    pub ready_timeout: Duration,
    pub matcher: HubMatcher,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(30),
            scan_restart_delay: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(5),
            matcher: HubMatcher::with_defaults(),
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let service_uuid = Uuid::parse_str(&settings.ble_service_uuid)?;
        Ok(Self {
            scan_window: Duration::from_secs(settings.scan_window_secs),
            scan_restart_delay: Duration::from_secs(settings.scan_restart_delay_secs),
            reconnect_delay: Duration::from_secs(settings.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            ready_timeout: Duration::from_secs(settings.ready_timeout_secs),
            matcher: HubMatcher::new(service_uuid, settings.hub_name_hints.clone()),
        })
    }
}

enum Request {
    Send {
        cmd: LogicalCommand,
        reply: oneshot::Sender<SendOutcome>,
    },
}

enum Internal {
    ScanWindowElapsed {
        epoch: u64,
    },
    ScanRestartDue {
        epoch: u64,
    },
    ConnectFinished {
        epoch: u64,
        address: String,
        result: Result<(), TransportError>,
    },
    DiscoveryFinished {
        epoch: u64,
        result: Result<Option<CharacteristicHandles>, TransportError>,
    },
    SessionFinished {
        epoch: u64,
        result: Result<(), SessionError>,
    },
}

impl Internal {
    fn epoch(&self) -> u64 {
        match self {
            Self::ScanWindowElapsed { epoch }
            | Self::ScanRestartDue { epoch }
            | Self::ConnectFinished { epoch, .. }
            | Self::DiscoveryFinished { epoch, .. }
            | Self::SessionFinished { epoch, .. } => *epoch,
        }
    }
}

/// Handle to the controller task. Cheap to clone; callable from any task.
#[derive(Clone)]
pub struct HubController {
    requests: mpsc::UnboundedSender<Request>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl HubController {
    /// Spawn the controller actor. `transport_events` is the receiving end
    /// of the channel the transport was constructed with.
    pub fn spawn(
        transport: Arc<dyn HubTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        config: ControllerConfig,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let commands = CommandChannel::new(transport.clone());

        let service = HubService {
            transport,
            requests: request_rx,
            transport_events,
            transport_closed: false,
            internal_tx,
            internal_rx,
            state_tx,
            commands,
            config,
            state: ConnectionState::Disconnected,
            epoch: 0,
            link: None,
            handles: None,
            pending: None,
            ready_tx: None,
            hub_found: false,
        };
        tokio::spawn(service.run());

        Self {
            requests: request_tx,
            state_rx,
        }
    }

    /// Send a motor command. Never waits on the radio: a command in Ready
    /// state is handed to the ordered writer and reported `Sent`; before
    /// Ready it replaces any earlier pending command and reports `Queued`.
    pub async fn send_command(&self, cmd: LogicalCommand) -> SendOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.requests.send(Request::Send {
            cmd,
            reply: reply_tx,
        });
        if sent.is_err() {
            return SendOutcome::Rejected;
        }
        reply_rx.await.unwrap_or(SendOutcome::Rejected)
    }

    /// String boundary for external callers. Unknown command names are
    /// rejected without reaching the controller task.
    pub async fn send_named(&self, name: &str) -> SendOutcome {
        match LogicalCommand::parse(name) {
            Some(cmd) => self.send_command(cmd).await,
            None => {
                warn!(request = name, "rejecting unknown command");
                SendOutcome::Rejected
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_name(&self) -> &'static str {
        self.state().name()
    }

    /// Watch endpoint for callers that want transition notifications.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

struct HubService {
    transport: Arc<dyn HubTransport>,
    requests: mpsc::UnboundedReceiver<Request>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    transport_closed: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    state_tx: watch::Sender<ConnectionState>,
    commands: CommandChannel,
    config: ControllerConfig,

    state: ConnectionState,
    /// Bumped on every transition; outstanding timers and workers carry the
    /// epoch they were spawned under and are dropped on mismatch.
    epoch: u64,
    link: Option<HubHandle>,
    handles: Option<CharacteristicHandles>,
    pending: Option<LogicalCommand>,
    ready_tx: Option<oneshot::Sender<()>>,
    hub_found: bool,
}

impl HubService {
    async fn run(mut self) {
        info!("hub controller started");
        self.try_start_scan().await;

        loop {
            tokio::select! {
                maybe_request = self.requests.recv() => match maybe_request {
                    Some(request) => self.handle_request(request),
                    // Every controller handle is gone; nothing can reach us.
                    None => break,
                },
                maybe_event = self.transport_events.recv(), if !self.transport_closed => {
                    match maybe_event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            warn!("transport event stream closed");
                            self.transport_closed = true;
                        }
                    }
                }
                Some(message) = self.internal_rx.recv() => self.handle_internal(message).await,
            }
        }
        info!("hub controller stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Send { cmd, reply } => {
                let outcome = self.dispatch_command(cmd);
                let _ = reply.send(outcome);
            }
        }
    }

    fn dispatch_command(&mut self, cmd: LogicalCommand) -> SendOutcome {
        match (self.state, self.handles) {
            (ConnectionState::Ready, Some(handles)) => {
                debug!(command = cmd.name(), "transmitting motor command");
                self.commands
                    .send_unacked(handles.command_value, protocol::stdin_frame(cmd).to_vec());
                SendOutcome::Sent
            }
            _ => {
                if let Some(previous) = self.pending.replace(cmd) {
                    debug!(
                        dropped = previous.name(),
                        queued = cmd.name(),
                        "pending command overwritten"
                    );
                } else {
                    debug!(queued = cmd.name(), "command queued until ready");
                }
                SendOutcome::Queued
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(record) => self.on_advertisement(record).await,
            TransportEvent::Disconnected { reason } => self.on_disconnect(&reason),
            TransportEvent::Notification { payload } => self.on_notification(&payload),
        }
    }

    async fn on_advertisement(&mut self, record: AdvertisingRecord) {
        if self.state != ConnectionState::Scanning || self.hub_found {
            return;
        }
        if !self.config.matcher.matches(&record) {
            return;
        }

        // First match wins; stop scanning before connecting so a second
        // report cannot race us into a double connect.
        self.hub_found = true;
        info!(
            address = %record.address,
            name = record.local_name.as_deref().unwrap_or("(unnamed)"),
            "hub found, connecting"
        );
        if let Err(e) = self.transport.stop_scan().await {
            warn!(error = %e, "failed to stop scan cleanly");
        }
        self.set_state(ConnectionState::Connecting);

        let transport = self.transport.clone();
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        let timeout = self.config.connect_timeout;
        let address = record.address;
        tokio::spawn(async move {
            let result = transport.connect(&address, timeout).await;
            let _ = internal.send(Internal::ConnectFinished {
                epoch,
                address,
                result,
            });
        });
    }

    fn on_disconnect(&mut self, reason: &str) {
        info!(reason, state = self.state.name(), "hub link down");
        let was_active = self.state != ConnectionState::Disconnected;
        self.reset_connection();
        if was_active {
            self.schedule_scan_restart(self.config.reconnect_delay);
        }
    }

    fn on_notification(&mut self, payload: &[u8]) {
        match protocol::decode_event(payload) {
            Some(HubEvent::Status(status)) => {
                debug!(
                    repl_active = status.repl_active,
                    program_running = status.program_running,
                    "hub status report"
                );
            }
            Some(HubEvent::Output(text)) => {
                debug!(output = %text.trim_end(), "hub program output");
                if text.contains(protocol::READY_SENTINEL) {
                    // Taking the sender makes a repeated sentinel a no-op.
                    if let Some(ready) = self.ready_tx.take() {
                        let _ = ready.send(());
                    }
                }
            }
            Some(HubEvent::Unknown(frame_type)) => {
                debug!(frame_type, "ignoring unrecognized event frame");
            }
            None => debug!("ignoring empty notification"),
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        if message.epoch() != self.epoch {
            // A stale connect may still have established a link; close it.
            if let Internal::ConnectFinished { result: Ok(()), .. } = &message {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let _ = transport.disconnect().await;
                });
            }
            debug!("dropping completion from a previous connection cycle");
            return;
        }

        match message {
            Internal::ScanWindowElapsed { .. } => {
                info!("scan window expired without a match");
                if let Err(e) = self.transport.stop_scan().await {
                    warn!(error = %e, "failed to stop scan cleanly");
                }
                self.set_state(ConnectionState::Disconnected);
                self.schedule_scan_restart(self.config.scan_restart_delay);
            }
            Internal::ScanRestartDue { .. } => self.try_start_scan().await,
            Internal::ConnectFinished {
                address,
                result: Ok(()),
                ..
            } => {
                self.link = Some(HubHandle(address));
                self.set_state(ConnectionState::Discovering);

                let transport = self.transport.clone();
                let internal = self.internal_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    let result = transport.discover_control_characteristic().await;
                    let _ = internal.send(Internal::DiscoveryFinished { epoch, result });
                });
            }
            Internal::ConnectFinished {
                result: Err(e), ..
            } => {
                warn!(error = %e, "connect attempt failed");
                self.hub_found = false;
                self.set_state(ConnectionState::Disconnected);
                self.schedule_scan_restart(self.config.reconnect_delay);
            }
            Internal::DiscoveryFinished {
                result: Ok(Some(handles)),
                ..
            } => {
                info!(
                    command_value = handles.command_value,
                    "control characteristic resolved"
                );
                self.handles = Some(handles);
                self.set_state(ConnectionState::Initializing);

                let (ready_tx, ready_rx) = oneshot::channel();
                self.ready_tx = Some(ready_tx);

                let transport = self.transport.clone();
                let internal = self.internal_tx.clone();
                let epoch = self.epoch;
                let bootstrap = BootstrapConfig {
                    write_timeout: self.config.write_timeout,
                    ready_timeout: self.config.ready_timeout,
                };
                tokio::spawn(async move {
                    let result =
                        connection::run_bootstrap(transport, handles, ready_rx, bootstrap).await;
                    let _ = internal.send(Internal::SessionFinished { epoch, result });
                });
            }
            Internal::DiscoveryFinished {
                result: Ok(None), ..
            } => {
                // A half-discovered link must not linger.
                error!(error = %SessionError::ProtocolMismatch, "terminating connection");
                self.force_disconnect("protocol mismatch");
            }
            Internal::DiscoveryFinished {
                result: Err(e), ..
            } => {
                warn!(error = %e, "characteristic discovery failed");
                self.force_disconnect("discovery failure");
            }
            Internal::SessionFinished { result: Ok(()), .. } => {
                self.set_state(ConnectionState::Ready);
                info!(hub = %self.link.as_ref().map(|h| h.0.as_str()).unwrap_or("?"), "hub ready");
                if let Some(handles) = self.handles {
                    if let Some(cmd) = self.pending.take() {
                        info!(command = cmd.name(), "transmitting queued command");
                        self.commands
                            .send_unacked(handles.command_value, protocol::stdin_frame(cmd).to_vec());
                    }
                }
            }
            Internal::SessionFinished {
                result: Err(e), ..
            } => {
                warn!(error = %e, "session bootstrap failed, reconnecting");
                self.force_disconnect("bootstrap failure");
            }
        }
    }

    async fn try_start_scan(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        self.hub_found = false;
        if let Err(e) = self.transport.start_scan().await {
            warn!(error = %e, "scan start failed");
            self.schedule_scan_restart(self.config.scan_restart_delay);
            return;
        }
        info!(window = ?self.config.scan_window, "scanning for hub");
        self.set_state(ConnectionState::Scanning);

        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        let window = self.config.scan_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = internal.send(Internal::ScanWindowElapsed { epoch });
        });
    }

    /// Explicit termination: close the link and run the disconnect path now
    /// instead of waiting for the transport to notice.
    fn force_disconnect(&mut self, reason: &str) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let _ = transport.disconnect().await;
        });
        self.on_disconnect(reason);
    }

    /// Clear every connection-scoped entity. The pending command survives:
    /// it transmits on the next Ready.
    fn reset_connection(&mut self) {
        self.link = None;
        self.handles = None;
        self.ready_tx = None;
        self.hub_found = false;
        self.set_state(ConnectionState::Disconnected);
    }

    fn schedule_scan_restart(&self, delay: Duration) {
        debug!(?delay, "scan restart scheduled");
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ScanRestartDue { epoch });
        });
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = self.state.name(), to = next.name(), "state transition");
        self.state = next;
        self.epoch += 1;
        let _ = self.state_tx.send(next);
    }
}
