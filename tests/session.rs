//! Drives the session manager against a scripted in-memory radio.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use time::UtcOffset;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use esp32_companion::cli::watch;
use esp32_companion::config::types::{Config, ReconnectPolicy};
use esp32_companion::device::codec::{decode_text, encode_text, FramedValue, Payload, ReadingKey};
use esp32_companion::device::constants::{
    BUTTON1_CHARACTERISTIC_UUID, BUTTON2_CHARACTERISTIC_UUID, COMMAND_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use esp32_companion::device::manager::SessionManager;
use esp32_companion::device::transport::{BleTransport, EventStream, NotificationStream};
use esp32_companion::device::types::{DeviceEvent, DeviceId, GattService, Notification, SessionStatus, TransportEvent};
use esp32_companion::error::{CommandError, ScanError, TransportError, WriteError};

#[derive(Default)]
struct MockState {
    advertisements: Vec<(DeviceId, Option<String>)>,
    already_connected: Vec<DeviceId>,
    services: Vec<GattService>,
    fail_connect: bool,
    connect_delay: Option<Duration>,

    scanning: bool,
    scans_started: usize,
    connect_calls: Vec<DeviceId>,
    connected: HashSet<DeviceId>,
    subscribed: HashSet<(DeviceId, Uuid)>,
    writes: Vec<String>,

    event_senders: Vec<UnboundedSender<TransportEvent>>,
    notification_senders: Vec<UnboundedSender<Notification>>,
}

#[derive(Default)]
struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn broadcast(&self, event: TransportEvent) {
        self.state().event_senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
    }

    fn notify_framed(&self, characteristic: Uuid, value: FramedValue) {
        let notification = Notification { characteristic, value };
        self.state()
            .notification_senders
            .retain(|sender| sender.unbounded_send(notification.clone()).is_ok());
    }

    fn notify(&self, characteristic: Uuid, text: &str) {
        self.notify_framed(characteristic, encode_text(text));
    }

    fn drop_link(&self, device: &DeviceId) {
        {
            let mut state = self.state();
            state.connected.remove(device);
            state.subscribed.retain(|(id, _)| id != device);
        }
        self.broadcast(TransportEvent::Disconnected(device.clone()));
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn events(&self) -> Result<EventStream, TransportError> {
        let (sender, receiver) = unbounded();
        self.state().event_senders.push(sender);
        Ok(Box::pin(receiver))
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        let advertisements = {
            let mut state = self.state();
            state.scanning = true;
            state.scans_started += 1;
            state.advertisements.clone()
        };

        for (id, local_name) in advertisements {
            self.broadcast(TransportEvent::Advertisement { id, local_name });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().scanning = false;
        Ok(())
    }

    async fn connected_devices(&self, _service: Uuid) -> Result<Vec<DeviceId>, TransportError> {
        Ok(self.state().already_connected.clone())
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        let (delay, fail) = {
            let mut state = self.state();
            state.connect_calls.push(device.clone());
            (state.connect_delay, state.fail_connect)
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if fail {
            return Err(TransportError::Other("connection refused".to_string()));
        }

        self.state().connected.insert(device.clone());
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connected.remove(device);
        state.subscribed.retain(|(id, _)| id != device);
        Ok(())
    }

    async fn discover(&self, device: &DeviceId) -> Result<Vec<GattService>, TransportError> {
        let state = self.state();
        if !state.connected.contains(device) {
            return Err(TransportError::UnknownPeripheral(device.0.clone()));
        }
        Ok(state.services.clone())
    }

    async fn notifications(&self, _device: &DeviceId) -> Result<NotificationStream, TransportError> {
        let (sender, receiver) = unbounded();
        self.state().notification_senders.push(sender);
        Ok(Box::pin(receiver))
    }

    async fn subscribe(&self, device: &DeviceId, _service: Uuid, characteristic: Uuid) -> Result<(), TransportError> {
        self.state().subscribed.insert((device.clone(), characteristic));
        Ok(())
    }

    async fn unsubscribe(&self, device: &DeviceId, _service: Uuid, characteristic: Uuid) -> Result<(), TransportError> {
        self.state().subscribed.remove(&(device.clone(), characteristic));
        Ok(())
    }

    async fn write(&self, device: &DeviceId, _service: Uuid, characteristic: Uuid, value: &FramedValue) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected.contains(device) || characteristic != COMMAND_CHARACTERISTIC_UUID {
            return Err(TransportError::Other("write rejected".to_string()));
        }
        state.writes.push(decode_text(value).unwrap());
        Ok(())
    }
}

fn esp() -> DeviceId {
    DeviceId("24:6F:28:00:00:01".to_string())
}

fn firmware_services() -> Vec<GattService> {
    vec![
        GattService { uuid: Uuid::from_u128(0x1800), characteristics: vec![Uuid::from_u128(0x2a00)] },
        GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![COMMAND_CHARACTERISTIC_UUID, BUTTON1_CHARACTERISTIC_UUID, BUTTON2_CHARACTERISTIC_UUID],
        },
    ]
}

fn mock() -> Arc<MockTransport> {
    let transport = MockTransport::default();
    {
        let mut state = transport.state();
        state.advertisements = vec![
            (DeviceId("11:11:11:11:11:11".to_string()), Some("Headphones".to_string())),
            (DeviceId("22:22:22:22:22:22".to_string()), None),
            (esp(), Some("ESP32_BLE".to_string())),
            (DeviceId("33:33:33:33:33:33".to_string()), Some("ESP32_BLE_2".to_string())),
        ];
        state.services = firmware_services();
    }
    Arc::new(transport)
}

fn config(policy: ReconnectPolicy) -> Config {
    Config {
        reconnect_policy: policy,
        reconnect_delay_ms: 10,
        write_deadline_ms: 500,
        ..Config::default()
    }
}

fn session_manager(transport: &Arc<MockTransport>, policy: ReconnectPolicy) -> (SessionManager<MockTransport>, UnboundedReceiver<DeviceEvent>) {
    let manager = SessionManager::new(transport.clone(), config(policy), UtcOffset::UTC);
    let events = manager.subscribe();
    (manager, events)
}

async fn next_event(events: &mut UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
    timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for a device event")
        .expect("event stream closed")
}

async fn next_status(events: &mut UnboundedReceiver<DeviceEvent>) -> SessionStatus {
    loop {
        if let DeviceEvent::StateChange(status) = next_event(events).await {
            return status;
        }
    }
}

async fn expect_statuses(events: &mut UnboundedReceiver<DeviceEvent>, expected: &[SessionStatus]) {
    for status in expected {
        assert_eq!(next_status(events).await, *status);
    }
}

async fn next_reading(events: &mut UnboundedReceiver<DeviceEvent>) -> Payload {
    loop {
        if let DeviceEvent::Reading { payload, .. } = next_event(events).await {
            return payload;
        }
    }
}

async fn connected(policy: ReconnectPolicy) -> (Arc<MockTransport>, SessionManager<MockTransport>, UnboundedReceiver<DeviceEvent>) {
    let transport = mock();
    let (manager, mut events) = session_manager(&transport, policy);
    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Connected]).await;
    (transport, manager, events)
}

#[tokio::test]
async fn connects_to_the_only_matching_advertisement() {
    let (transport, manager, _events) = connected(ReconnectPolicy::Rescan).await;

    let state = transport.state();
    assert_eq!(state.connect_calls, vec![esp()]);
    assert!(!state.scanning);
    assert_eq!(state.subscribed.len(), 2);
    drop(state);

    assert_eq!(manager.device_id(), Some(esp()));
    assert!(manager.is_connected());
    let subscribed: Vec<Uuid> = manager.subscriptions().into_iter().map(|handle| handle.characteristic).collect();
    assert_eq!(subscribed, vec![BUTTON1_CHARACTERISTIC_UUID, BUTTON2_CHARACTERISTIC_UUID]);
}

#[tokio::test]
async fn adopts_an_already_connected_device_without_scanning() {
    let transport = mock();
    transport.state().already_connected = vec![esp()];
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Connected]).await;
    assert_eq!(transport.state().scans_started, 0);
}

#[tokio::test]
async fn scan_start_is_rejected_while_busy() {
    let transport = mock();
    transport.state().connect_delay = Some(Duration::from_millis(200));
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    assert!(matches!(manager.start_scan(), Err(ScanError::Busy(SessionStatus::Searching))));

    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting]).await;
    assert!(matches!(manager.start_scan(), Err(ScanError::Busy(SessionStatus::Connecting))));
    assert!(matches!(manager.start_scan(), Err(ScanError::Busy(SessionStatus::Connecting))));

    expect_statuses(&mut events, &[SessionStatus::Connected]).await;
    assert!(matches!(manager.start_scan(), Err(ScanError::Busy(SessionStatus::Connected))));
    assert_eq!(transport.state().connect_calls.len(), 1);
}

#[tokio::test]
async fn link_drop_restarts_discovery() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Rescan).await;
    transport.state().connect_delay = Some(Duration::from_millis(100));

    transport.drop_link(&esp());
    expect_statuses(&mut events, &[
        SessionStatus::Disconnected,
        SessionStatus::Reconnecting,
        SessionStatus::Searching,
        SessionStatus::Connecting,
    ]).await;
    assert_eq!(manager.device_id(), None);

    expect_statuses(&mut events, &[SessionStatus::Connected]).await;
    assert_eq!(manager.device_id(), Some(esp()));

    assert_eq!(transport.state().scans_started, 2);
    assert_eq!(transport.state().subscribed.len(), 2);
    assert_eq!(manager.subscriptions().len(), 2);
}

#[tokio::test]
async fn link_drop_reconnects_directly_when_configured() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Direct).await;

    transport.drop_link(&esp());
    expect_statuses(&mut events, &[
        SessionStatus::Disconnected,
        SessionStatus::Reconnecting,
        SessionStatus::Connecting,
        SessionStatus::Connected,
    ]).await;

    assert_eq!(transport.state().scans_started, 1);
    assert_eq!(transport.state().connect_calls, vec![esp(), esp()]);
    assert_eq!(manager.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn link_drop_alerts_when_reconnecting_is_manual() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Manual).await;

    transport.drop_link(&esp());
    expect_statuses(&mut events, &[SessionStatus::Disconnected]).await;
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Alert(_)));
    assert_eq!(manager.status(), SessionStatus::Disconnected);
    assert!(!manager.is_connected());
    assert!(manager.subscriptions().is_empty());

    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Connected]).await;
}

#[tokio::test]
async fn drop_of_an_unrelated_device_is_ignored() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Rescan).await;

    transport.broadcast(TransportEvent::Disconnected(DeviceId("11:11:11:11:11:11".to_string())));
    transport.notify(BUTTON1_CHARACTERISTIC_UUID, "volume/1");
    next_reading(&mut events).await;

    assert_eq!(manager.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn notifications_update_telemetry_and_garbage_is_ignored() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Rescan).await;

    transport.notify(BUTTON1_CHARACTERISTIC_UUID, "volume/57");
    assert_eq!(next_reading(&mut events).await, Payload::Reading { key: ReadingKey::Volume, value: 57 });
    assert_eq!(manager.telemetry().volume(), Some(57));

    transport.notify(BUTTON1_CHARACTERISTIC_UUID, "garbage");
    transport.notify_framed(BUTTON2_CHARACTERISTIC_UUID, FramedValue::from_framed("%%%"));
    transport.notify(BUTTON2_CHARACTERISTIC_UUID, "flowRate/3");
    assert_eq!(next_reading(&mut events).await, Payload::Reading { key: ReadingKey::FlowRate, value: 3 });

    let telemetry = manager.telemetry();
    assert_eq!(telemetry.volume(), Some(57));
    assert_eq!(telemetry.flow_rate(), Some(3));
    assert_eq!(manager.status(), SessionStatus::Connected);
}

#[tokio::test]
async fn timestamps_are_kept_for_display() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Rescan).await;

    for n in 0..35 {
        transport.notify(BUTTON2_CHARACTERISTIC_UUID, &(1_700_000_000 + n).to_string());
    }
    for _ in 0..35 {
        next_reading(&mut events).await;
    }

    let telemetry = manager.telemetry();
    let kept: Vec<i64> = telemetry.history().map(|entry| entry.epoch_seconds).collect();
    assert_eq!(kept, (5..35).map(|n| 1_700_000_000 + n).collect::<Vec<i64>>());
    assert_eq!(telemetry.history().next().unwrap().display, "2023-11-14 22:13:25");
}

#[tokio::test]
async fn send_without_channel_returns_write_error() {
    let transport = mock();
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    let result = manager.send("set/flowRate/42").await;
    assert!(matches!(result, Err(WriteError::NotConnected)));
    assert!(matches!(events.try_next(), Ok(Some(DeviceEvent::Alert(_)))));
    assert!(transport.state().writes.is_empty());
}

#[tokio::test]
async fn send_writes_framed_commands() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Rescan).await;

    manager.send("set/volume/7").await.unwrap();
    manager.send(" get/button1/1-30 ").await.unwrap();
    assert_eq!(transport.state().writes, vec!["set/volume/7".to_string(), "get/button1/1-30".to_string()]);

    assert!(matches!(manager.send("reboot").await, Err(WriteError::InvalidCommand { .. })));
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Alert(_)));

    let result = manager.send("set/flowRate/042").await;
    assert!(matches!(result, Err(WriteError::InvalidCommand { source: CommandError::NotCanonical { .. } })));
    assert_eq!(transport.state().writes.len(), 2);
}

#[tokio::test]
async fn rejected_write_is_reported() {
    let (transport, manager, _events) = connected(ReconnectPolicy::Manual).await;

    // the peripheral is gone but the drop has not been noticed yet
    transport.state().connected.clear();
    assert!(matches!(manager.send("set/stop").await, Err(WriteError::Transport { .. })));
}

#[tokio::test]
async fn missing_service_fails_and_retry_searches_again() {
    let transport = mock();
    transport.state().services = vec![GattService { uuid: Uuid::from_u128(0x1800), characteristics: vec![] }];
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Error]).await;
    assert!(matches!(next_event(&mut events).await, DeviceEvent::Alert(_)));
    assert!(manager.last_error().unwrap().contains(&SERVICE_UUID.to_string()));
    assert!(transport.state().connected.is_empty());
    assert!(!manager.is_connected());

    transport.state().services = firmware_services();
    manager.retry().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Connected]).await;
    assert_eq!(manager.last_error(), None);
}

#[tokio::test]
async fn missing_notify_characteristic_releases_partial_subscriptions() {
    let transport = mock();
    transport.state().services = vec![GattService {
        uuid: SERVICE_UUID,
        characteristics: vec![COMMAND_CHARACTERISTIC_UUID, BUTTON1_CHARACTERISTIC_UUID],
    }];
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Error]).await;
    assert!(transport.state().subscribed.is_empty());
    assert!(manager.subscriptions().is_empty());
}

#[tokio::test]
async fn connect_failure_lands_in_error() {
    let transport = mock();
    transport.state().fail_connect = true;
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching, SessionStatus::Connecting, SessionStatus::Error]).await;
    assert!(manager.last_error().unwrap().contains("connection refused"));
    assert!(matches!(manager.send("set/stop").await, Err(WriteError::NotConnected)));
}

#[tokio::test]
async fn shutdown_releases_every_subscription() {
    let (transport, manager, mut events) = connected(ReconnectPolicy::Rescan).await;

    manager.shutdown().await;
    expect_statuses(&mut events, &[SessionStatus::Disconnected]).await;

    let state = transport.state();
    assert!(state.subscribed.is_empty());
    assert!(state.connected.is_empty());
    drop(state);

    assert_eq!(manager.status(), SessionStatus::Disconnected);
    assert_eq!(manager.device_id(), None);
    assert!(manager.subscriptions().is_empty());

    // nothing is listening any more
    transport.notify(BUTTON1_CHARACTERISTIC_UUID, "volume/9");
    sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.telemetry().volume(), None);
}

#[tokio::test]
async fn shutdown_cancels_a_running_scan() {
    let transport = mock();
    transport.state().advertisements.retain(|(id, _)| *id != esp());
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    expect_statuses(&mut events, &[SessionStatus::Searching]).await;
    while !transport.state().scanning {
        sleep(Duration::from_millis(1)).await;
    }

    manager.shutdown().await;
    assert!(!transport.state().scanning);
    assert_eq!(manager.status(), SessionStatus::Disconnected);

    // the cancelled task must not connect to a device that shows up later
    transport.broadcast(TransportEvent::Advertisement { id: esp(), local_name: Some("ESP32_BLE".to_string()) });
    sleep(Duration::from_millis(20)).await;
    assert!(transport.state().connect_calls.is_empty());
}

#[tokio::test]
async fn watch_retries_failed_attempts() {
    let transport = mock();
    transport.state().fail_connect = true;
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    timeout(Duration::from_secs(5), watch(&manager, &mut events, sleep(Duration::from_millis(200)), false))
        .await
        .expect("watch did not stop when interrupted");

    assert!(transport.state().connect_calls.len() >= 2);
}

#[tokio::test]
async fn watch_stops_during_the_retry_delay() {
    let transport = mock();
    transport.state().fail_connect = true;
    let config = Config { reconnect_delay_ms: 60_000, ..config(ReconnectPolicy::Rescan) };
    let manager = SessionManager::new(transport.clone(), config, UtcOffset::UTC);
    let mut events = manager.subscribe();

    manager.start_scan().unwrap();
    timeout(Duration::from_secs(5), watch(&manager, &mut events, sleep(Duration::from_millis(200)), false))
        .await
        .expect("watch ignored the interrupt while waiting to retry");

    assert_eq!(manager.status(), SessionStatus::Error);
    assert_eq!(transport.state().connect_calls.len(), 1);
}

#[tokio::test]
async fn watch_requests_initial_data_once_connected() {
    let transport = mock();
    let (manager, mut events) = session_manager(&transport, ReconnectPolicy::Rescan);

    manager.start_scan().unwrap();
    timeout(Duration::from_secs(5), watch(&manager, &mut events, sleep(Duration::from_millis(100)), true))
        .await
        .expect("watch did not stop when interrupted");

    assert_eq!(transport.state().writes, vec!["get/initialData".to_string()]);
}
