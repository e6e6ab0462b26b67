//! Lifecycle tests driving the supervisor through a scripted transport.
//!
//! Runs on the paused tokio clock so the reconnect delay costs nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::Uuid;
use futures_util::stream;
use obulink::{
    BleCharacteristic, BleDevice, BleTransport, CharacteristicConfig, ConnectionState, LinkConfig,
    LinkError, MessageSource, NotificationStream, ObuLink, StatusEvent,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

const SERVICE: Uuid = Uuid::from_u128(0x9bb78000_77eb_4ed9_b7d2_48ba9bb5304d);
const POSITION_CHARA: Uuid = Uuid::from_u128(0x9bb78050_77eb_4ed9_b7d2_48ba9bb5304d);
const ITS_CHARA: Uuid = Uuid::from_u128(0x9bb78051_77eb_4ed9_b7d2_48ba9bb5304d);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailStep {
    Connect,
    Discovery,
}

#[derive(Default)]
struct FakeState {
    fail: Option<FailStep>,
    connect_gate: Option<Arc<Notify>>,
    connects: usize,
    subscriptions: usize,
    notifiers: HashMap<Uuid, mpsc::UnboundedSender<Result<Vec<u8>, LinkError>>>,
}

/// A transport with one device offering a fixed set of characteristics.
/// Tests push notifications in by hand and trigger the disconnect watch
/// through `drop_link`.
#[derive(Clone)]
struct FakeTransport {
    characteristics: Vec<Uuid>,
    state: Arc<Mutex<FakeState>>,
    drop_signal: Arc<Notify>,
}

impl FakeTransport {
    fn new(characteristics: Vec<Uuid>) -> Self {
        Self {
            characteristics,
            state: Arc::new(Mutex::new(FakeState::default())),
            drop_signal: Arc::new(Notify::new()),
        }
    }

    fn fail_at(&self, step: FailStep) {
        self.state.lock().unwrap().fail = Some(step);
    }

    /// Make `connect` block until the returned handle is notified.
    fn gate_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().connect_gate = Some(gate.clone());
        gate
    }

    fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    fn notify(&self, characteristic: Uuid, item: Result<Vec<u8>, LinkError>) {
        self.state
            .lock()
            .unwrap()
            .notifiers
            .get(&characteristic)
            .expect("characteristic not subscribed")
            .send(item)
            .expect("notification stream dropped");
    }

    fn drop_link(&self) {
        // notify_one stores a permit, so the watch picks it up even if it
        // has not polled yet.
        self.drop_signal.notify_one();
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn available(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn find_device(
        &self,
        service: Uuid,
        _scan_timeout: Duration,
    ) -> Result<Box<dyn BleDevice>, LinkError> {
        assert_eq!(service, SERVICE);
        Ok(Box::new(FakeDevice {
            transport: self.clone(),
        }))
    }
}

struct FakeDevice {
    transport: FakeTransport,
}

#[async_trait]
impl BleDevice for FakeDevice {
    fn id(&self) -> String {
        "obu-under-test".into()
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let gate = self.transport.state.lock().unwrap().connect_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.transport.state.lock().unwrap();
        if state.fail == Some(FailStep::Connect) {
            return Err(LinkError::Connect("refused".into()));
        }
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        _service: Uuid,
    ) -> Result<Vec<Box<dyn BleCharacteristic>>, LinkError> {
        if self.transport.state.lock().unwrap().fail == Some(FailStep::Discovery) {
            return Err(LinkError::Discovery("gatt timed out".into()));
        }
        Ok(self
            .transport
            .characteristics
            .iter()
            .map(|&uuid| {
                Box::new(FakeCharacteristic {
                    uuid,
                    transport: self.transport.clone(),
                }) as Box<dyn BleCharacteristic>
            })
            .collect())
    }

    async fn disconnected(&self) {
        self.transport.drop_signal.notified().await;
    }
}

struct FakeCharacteristic {
    uuid: Uuid,
    transport: FakeTransport,
}

#[async_trait]
impl BleCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn notifications(&self) -> Result<NotificationStream, LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.transport.state.lock().unwrap();
        state.subscriptions += 1;
        state.notifiers.insert(self.uuid, tx);
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

fn test_config(characteristics: Vec<CharacteristicConfig>) -> LinkConfig {
    LinkConfig {
        service: SERVICE,
        characteristics,
        scan_timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(200),
        max_reconnect_attempts: None,
        max_message_len: 4096,
        event_capacity: 16,
    }
}

fn its_only() -> Vec<CharacteristicConfig> {
    vec![CharacteristicConfig {
        uuid: ITS_CHARA,
        source: MessageSource::ItsMessage,
    }]
}

async fn next_status(rx: &mut broadcast::Receiver<StatusEvent>) -> StatusEvent {
    timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for a status event")
        .expect("status stream closed")
}

async fn assert_quiet(rx: &mut broadcast::Receiver<StatusEvent>) {
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_connects_and_subscribes() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();

    link.connect();

    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Connected);
    assert_eq!(event.error, None);
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reports_one_error_and_no_subscriptions() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    transport.fail_at(FailStep::Connect);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();

    link.connect();

    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Disconnected);
    assert!(matches!(event.error, Some(LinkError::Connect(_))));
    assert_eq!(transport.subscriptions(), 0);
    // Failed initial connections are not retried.
    assert_quiet(&mut status).await;
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_fails_the_session() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    transport.fail_at(FailStep::Discovery);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();

    link.connect();

    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Disconnected);
    assert!(matches!(event.error, Some(LinkError::Discovery(_))));
    assert_eq!(transport.subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_unexpected_disconnect() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();

    link.connect();
    assert_eq!(next_status(&mut status).await, StatusEvent {
        state: ConnectionState::Connected,
        error: None,
    });

    transport.drop_link();

    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Disconnected);
    assert_eq!(event.error, Some(LinkError::UnexpectedDisconnect));

    // After the delay a fresh session comes up with fresh subscriptions.
    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Connected);
    assert_eq!(transport.connects(), 2);
    assert_eq!(transport.subscriptions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();

    link.connect();
    next_status(&mut status).await;

    transport.drop_link();
    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Disconnected);

    link.disconnect();

    // Well past the reconnect delay, nothing has reconnected.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.connects(), 1);
    assert_quiet(&mut status).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_silences_an_attempt_in_flight() {
    // The device lacks the position characteristic, so this attempt has a
    // setup error it would report if it were still current.
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let gate = transport.gate_connects();
    let config = test_config(vec![
        CharacteristicConfig {
            uuid: POSITION_CHARA,
            source: MessageSource::ObuPosition,
        },
        CharacteristicConfig {
            uuid: ITS_CHARA,
            source: MessageSource::ItsMessage,
        },
    ]);
    let link = ObuLink::new(config, transport.clone());
    let mut status = link.status();

    link.connect();
    // Let the attempt reach the gated connect, then cancel it before it
    // can finish.
    tokio::time::sleep(Duration::from_millis(10)).await;
    link.disconnect();
    gate.notify_one();

    // The attempt completes against a dead generation: no status events at
    // all, neither the connected event nor the setup error.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.connects(), 1);
    assert_quiet(&mut status).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempt_limit_is_honored() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let mut config = test_config(its_only());
    config.max_reconnect_attempts = Some(0);
    let link = ObuLink::new(config, transport.clone());
    let mut status = link.status();

    link.connect();
    next_status(&mut status).await;

    transport.drop_link();
    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_ignored() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();

    link.connect();
    link.connect();
    next_status(&mut status).await;
    link.connect();

    assert_quiet(&mut status).await;
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notifications_reassemble_onto_the_right_stream() {
    let transport = FakeTransport::new(vec![POSITION_CHARA, ITS_CHARA]);
    let config = test_config(vec![
        CharacteristicConfig {
            uuid: POSITION_CHARA,
            source: MessageSource::ObuPosition,
        },
        CharacteristicConfig {
            uuid: ITS_CHARA,
            source: MessageSource::ItsMessage,
        },
    ]);
    let link = ObuLink::new(config, transport.clone());
    let mut status = link.status();
    let mut positions = link.obu_position();
    let mut its = link.its_messages();

    link.connect();
    next_status(&mut status).await;

    transport.notify(ITS_CHARA, Ok(vec![0x02, 0x00, b'A', b'B']));
    transport.notify(ITS_CHARA, Ok(vec![0x01, 0x00, b'C', b'D']));
    transport.notify(ITS_CHARA, Ok(vec![0x00, 0x00, b'E', b'F']));
    transport.notify(POSITION_CHARA, Ok(vec![0x00, 0x00, 0x12, 0x34]));

    let message = timeout(Duration::from_secs(30), its.recv())
        .await
        .expect("timed out")
        .expect("message stream closed");
    assert_eq!(message.source, MessageSource::ItsMessage);
    assert_eq!(message.payload, b"ABCDEF");

    let message = timeout(Duration::from_secs(30), positions.recv())
        .await
        .expect("timed out")
        .expect("message stream closed");
    assert_eq!(message.source, MessageSource::ObuPosition);
    assert_eq!(message.payload, vec![0x12, 0x34]);
}

#[tokio::test(start_paused = true)]
async fn test_characteristics_fail_independently() {
    let transport = FakeTransport::new(vec![POSITION_CHARA, ITS_CHARA]);
    let config = test_config(vec![
        CharacteristicConfig {
            uuid: POSITION_CHARA,
            source: MessageSource::ObuPosition,
        },
        CharacteristicConfig {
            uuid: ITS_CHARA,
            source: MessageSource::ItsMessage,
        },
    ]);
    let link = ObuLink::new(config, transport.clone());
    let mut status = link.status();
    let mut its = link.its_messages();

    link.connect();
    next_status(&mut status).await;

    transport.notify(
        POSITION_CHARA,
        Err(LinkError::Notification {
            characteristic: POSITION_CHARA,
            message: "gatt error 133".into(),
        }),
    );

    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Connected);
    assert!(matches!(event.error, Some(LinkError::Notification { .. })));

    // The other characteristic keeps delivering.
    transport.notify(ITS_CHARA, Ok(vec![0x00, 0x00, 0x42]));
    let message = timeout(Duration::from_secs(30), its.recv())
        .await
        .expect("timed out")
        .expect("message stream closed");
    assert_eq!(message.payload, vec![0x42]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_is_reported_and_skipped() {
    // The device only has the ITS characteristic, but both are configured.
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let config = test_config(vec![
        CharacteristicConfig {
            uuid: POSITION_CHARA,
            source: MessageSource::ObuPosition,
        },
        CharacteristicConfig {
            uuid: ITS_CHARA,
            source: MessageSource::ItsMessage,
        },
    ]);
    let link = ObuLink::new(config, transport.clone());
    let mut status = link.status();

    link.connect();

    // The session comes up on the characteristic that exists; the missing
    // one is reported right after, against the now-live connection.
    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Connected);
    assert_eq!(event.error, None);
    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Connected);
    assert_eq!(
        event.error,
        Some(LinkError::CharacteristicNotFound(POSITION_CHARA))
    );
    assert_eq!(transport.subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reassembly_error_does_not_drop_the_connection() {
    let transport = FakeTransport::new(vec![ITS_CHARA]);
    let link = ObuLink::new(test_config(its_only()), transport.clone());
    let mut status = link.status();
    let mut its = link.its_messages();

    link.connect();
    next_status(&mut status).await;

    // Skips remaining count 1: sequence violation.
    transport.notify(ITS_CHARA, Ok(vec![0x02, 0x00, b'A', b'B']));
    transport.notify(ITS_CHARA, Ok(vec![0x00, 0x00, b'X', b'Y']));

    let event = next_status(&mut status).await;
    assert_eq!(event.state, ConnectionState::Connected);
    assert!(matches!(
        event.error,
        Some(LinkError::Reassembly(_))
    ));

    // The same subscription keeps working and the next message is clean.
    transport.notify(ITS_CHARA, Ok(vec![0x00, 0x00, b'Z']));
    let message = timeout(Duration::from_secs(30), its.recv())
        .await
        .expect("timed out")
        .expect("message stream closed");
    assert_eq!(message.payload, b"Z");
    assert_eq!(transport.connects(), 1);
}
