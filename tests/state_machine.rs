//! Connection state machine scenarios, driven end to end through a fake
//! transport. Time is paused so the scan-window/backoff/ready bounds run
//! without wall-clock waits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hublink::{
    protocol, AdvertisingRecord, CharacteristicHandles, ConnectionState, ControllerConfig,
    HubController, HubTransport, LogicalCommand, SendOutcome, TransportError, TransportEvent,
    WriteMode,
};

const CONTROL_HANDLE: u16 = 0x000c;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
    Discover,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct WriteRecord {
    handle: u16,
    payload: Vec<u8>,
    mode: WriteMode,
}

/// In-memory transport: records every call, acknowledges writes instantly,
/// and delivers whatever events the test injects.
struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    writes: Mutex<Vec<WriteRecord>>,
    has_control_char: bool,
    connect_succeeds: bool,
    fail_start_program: bool,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            has_control_char: true,
            connect_succeeds: true,
            fail_start_program: false,
        }
    }

    fn without_control_char() -> Self {
        Self {
            has_control_char: false,
            ..Self::new()
        }
    }

    fn with_failing_start_program() -> Self {
        Self {
            fail_start_program: true,
            ..Self::new()
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().unwrap().clone()
    }

    /// Stdin frames (opcode 0x06) in transmission order.
    fn stdin_writes(&self) -> Vec<WriteRecord> {
        self.writes()
            .into_iter()
            .filter(|w| w.payload.first() == Some(&protocol::CMD_WRITE_STDIN))
            .collect()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }
}

#[async_trait]
impl HubTransport for FakeTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), TransportError> {
        self.record(Call::Connect(address.to_string()));
        if self.connect_succeeds {
            Ok(())
        } else {
            Err(TransportError::Timeout(timeout))
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        Ok(())
    }

    async fn discover_control_characteristic(
        &self,
    ) -> Result<Option<CharacteristicHandles>, TransportError> {
        self.record(Call::Discover);
        Ok(self
            .has_control_char
            .then(|| CharacteristicHandles::from_value_handle(CONTROL_HANDLE)))
    }

    async fn write(
        &self,
        handle: u16,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        if self.fail_start_program
            && mode == WriteMode::WithResponse
            && handle == CONTROL_HANDLE
            && payload == [protocol::CMD_START_USER_PROGRAM].as_slice()
        {
            return Err(TransportError::NotConnected);
        }
        self.writes.lock().unwrap().push(WriteRecord {
            handle,
            payload: payload.to_vec(),
            mode,
        });
        Ok(())
    }
}

struct Harness {
    controller: HubController,
    transport: Arc<FakeTransport>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

fn setup(transport: FakeTransport) -> Harness {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(transport);
    let controller = HubController::spawn(
        transport.clone(),
        event_rx,
        ControllerConfig::default(),
    );
    Harness {
        controller,
        transport,
        events: event_tx,
    }
}

fn hub_advert() -> TransportEvent {
    // Name-only report: size-limited payloads often omit the service UUID.
    TransportEvent::Advertisement(AdvertisingRecord {
        address: "hci0/dev_90_84_2B_5A_7E_1F".to_string(),
        local_name: Some("City Hub".to_string()),
        service_uuids: vec![],
    })
}

fn uuid_advert() -> TransportEvent {
    TransportEvent::Advertisement(AdvertisingRecord {
        address: "hci0/dev_90_84_2B_5A_7E_1F".to_string(),
        local_name: None,
        service_uuids: vec![protocol::SERVICE_UUID],
    })
}

fn notification(payload: &[u8]) -> TransportEvent {
    TransportEvent::Notification {
        payload: payload.to_vec(),
    }
}

async fn wait_for_state(controller: &HubController, want: ConnectionState) {
    let mut rx = controller.state_changes();
    tokio::time::timeout(Duration::from_secs(300), async move {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("controller task ended");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {:?}", want));
}

/// Let the controller drain everything already queued without moving the
/// clock past any pending bound.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn scan_starts_on_spawn() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    assert_eq!(h.transport.count(&Call::StartScan), 1);
}

#[tokio::test(start_paused = true)]
async fn unrelated_advertisements_are_ignored() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    h.events
        .send(TransportEvent::Advertisement(AdvertisingRecord {
            address: "hci0/dev_00_11_22_33_44_55".to_string(),
            local_name: Some("JBL Flip".to_string()),
            service_uuids: vec![],
        }))
        .unwrap();
    h.events
        .send(TransportEvent::Advertisement(AdvertisingRecord {
            address: "hci0/dev_00_11_22_33_44_66".to_string(),
            local_name: None,
            service_uuids: vec![],
        }))
        .unwrap();
    settle().await;

    assert_eq!(h.controller.state(), ConnectionState::Scanning);
    assert!(!h
        .transport
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Connect(_))));
}

#[tokio::test(start_paused = true)]
async fn named_hub_without_uuid_reaches_ready_with_no_notifications() {
    let started = tokio::time::Instant::now();
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;

    // The ready wait ran its full 5 s bound (no sentinel ever arrived) and
    // the state still advanced.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(7), "elapsed {elapsed:?}");

    let calls = h.transport.calls();
    assert!(calls.contains(&Call::StopScan));
    assert!(calls.contains(&Call::Connect(
        "hci0/dev_90_84_2B_5A_7E_1F".to_string()
    )));
    assert!(calls.contains(&Call::Discover));

    // Bootstrap writes: notification enable on the CCCD, then the
    // acknowledged start-program command.
    let writes = h.transport.writes();
    assert_eq!(writes[0].handle, CONTROL_HANDLE + 1);
    assert_eq!(writes[0].payload, protocol::ENABLE_NOTIFICATIONS.to_vec());
    assert_eq!(writes[0].mode, WriteMode::WithResponse);
    assert_eq!(writes[1].handle, CONTROL_HANDLE);
    assert_eq!(writes[1].payload, vec![protocol::CMD_START_USER_PROGRAM]);
    assert_eq!(writes[1].mode, WriteMode::WithResponse);
}

#[tokio::test(start_paused = true)]
async fn uuid_advertisement_matches_too() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    h.events.send(uuid_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn ready_sentinel_short_circuits_the_wait() {
    let started = tokio::time::Instant::now();
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Initializing).await;

    // Delivered twice; the signal must fire exactly once and the duplicate
    // must be a no-op.
    h.events.send(notification(b"\x01RDY")).unwrap();
    h.events.send(notification(b"\x01RDY")).unwrap();

    wait_for_state(&h.controller, ConnectionState::Ready).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    // A sentinel arriving after the session is up changes nothing.
    h.events.send(notification(b"\x01RDY")).unwrap();
    settle().await;
    assert_eq!(h.controller.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn send_before_ready_queues_and_newest_wins() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    assert_eq!(
        h.controller.send_command(LogicalCommand::Forward).await,
        SendOutcome::Queued
    );
    assert_eq!(
        h.controller.send_command(LogicalCommand::Stop).await,
        SendOutcome::Queued
    );
    // Nothing has touched the radio yet.
    assert!(h.transport.stdin_writes().is_empty());

    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;
    settle().await;

    // Exactly one transmission: the overwriting command.
    let stdin = h.transport.stdin_writes();
    assert_eq!(stdin.len(), 1);
    assert_eq!(stdin[0].payload, vec![protocol::CMD_WRITE_STDIN, b'S']);
    assert_eq!(stdin[0].mode, WriteMode::WithoutResponse);
}

#[tokio::test(start_paused = true)]
async fn ready_commands_transmit_in_request_order() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;

    assert_eq!(
        h.controller.send_command(LogicalCommand::Forward).await,
        SendOutcome::Sent
    );
    assert_eq!(
        h.controller.send_command(LogicalCommand::Stop).await,
        SendOutcome::Sent
    );
    settle().await;

    let stdin = h.transport.stdin_writes();
    assert_eq!(stdin.len(), 2);
    assert_eq!(stdin[0].payload, vec![0x06, b'F']);
    assert_eq!(stdin[1].payload, vec![0x06, b'S']);
    assert_eq!(stdin[0].handle, CONTROL_HANDLE);
    assert!(stdin.iter().all(|w| w.mode == WriteMode::WithoutResponse));
}

#[tokio::test(start_paused = true)]
async fn unknown_command_names_are_rejected() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;

    assert_eq!(h.controller.send_named("faster").await, SendOutcome::Rejected);
    assert_eq!(h.controller.send_named("").await, SendOutcome::Rejected);
    settle().await;
    assert!(h.transport.stdin_writes().is_empty());

    assert_eq!(h.controller.send_named("forward").await, SendOutcome::Sent);
}

#[tokio::test(start_paused = true)]
async fn missing_characteristic_terminates_connection_and_rescans() {
    let h = setup(FakeTransport::without_control_char());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Disconnected).await;
    assert_eq!(h.transport.count(&Call::Disconnect), 1);

    // The reconnect delay re-arms scanning.
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    assert_eq!(h.transport.count(&Call::StartScan), 2);
    assert_ne!(h.controller.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn start_program_failure_aborts_session_and_reconnects() {
    let h = setup(FakeTransport::with_failing_start_program());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Disconnected).await;
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    assert!(h.transport.calls().contains(&Call::Disconnect));
    assert!(h.transport.stdin_writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_event_resets_connection_scoped_state() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;

    h.events
        .send(TransportEvent::Disconnected {
            reason: "link lost".to_string(),
        })
        .unwrap();
    wait_for_state(&h.controller, ConnectionState::Disconnected).await;

    // Handles are gone: a send now queues instead of transmitting.
    assert_eq!(
        h.controller.send_command(LogicalCommand::Stop).await,
        SendOutcome::Queued
    );

    // The self-healing loop scans, reconnects, and flushes the command
    // that was queued across the disconnect.
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;
    settle().await;

    let stdin = h.transport.stdin_writes();
    assert_eq!(stdin.len(), 1);
    assert_eq!(stdin[0].payload, vec![0x06, b'S']);
}

#[tokio::test(start_paused = true)]
async fn disconnect_from_scanning_still_resets_and_rescans() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    assert_eq!(
        h.controller.send_command(LogicalCommand::Forward).await,
        SendOutcome::Queued
    );
    h.events
        .send(TransportEvent::Disconnected {
            reason: "adapter reset".to_string(),
        })
        .unwrap();
    wait_for_state(&h.controller, ConnectionState::Disconnected).await;
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    // The pending command survived the reset.
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;
    settle().await;
    let stdin = h.transport.stdin_writes();
    assert_eq!(stdin.len(), 1);
    assert_eq!(stdin[0].payload, vec![0x06, b'F']);
}

#[tokio::test(start_paused = true)]
async fn empty_scan_window_backs_off_and_rescans() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    // No advertisements: the 30 s window expires, then the 5 s restart
    // delay elapses.
    wait_for_state(&h.controller, ConnectionState::Disconnected).await;
    assert!(h.transport.calls().contains(&Call::StopScan));

    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    assert_eq!(h.transport.count(&Call::StartScan), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_notifications_are_tolerated() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;

    h.events.send(notification(&[])).unwrap();
    h.events.send(notification(&[0xff, 0x01, 0x02])).unwrap();
    h.events.send(notification(&[0x00, 0x60])).unwrap();
    let oversized = vec![0x01; 600];
    h.events.send(notification(&oversized)).unwrap();
    settle().await;

    assert_eq!(h.controller.state(), ConnectionState::Ready);
    assert_eq!(
        h.controller.send_command(LogicalCommand::Stop).await,
        SendOutcome::Sent
    );
}

#[tokio::test(start_paused = true)]
async fn second_advertisement_does_not_double_connect() {
    let h = setup(FakeTransport::new());
    wait_for_state(&h.controller, ConnectionState::Scanning).await;

    h.events.send(hub_advert()).unwrap();
    h.events.send(hub_advert()).unwrap();
    wait_for_state(&h.controller, ConnectionState::Ready).await;

    let connects = h
        .transport
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Connect(_)))
        .count();
    assert_eq!(connects, 1);
}
