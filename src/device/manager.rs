use std::sync::{Arc, Mutex, MutexGuard};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use time::UtcOffset;
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::{Config, ReconnectPolicy};
use crate::device::codec::decode_payload;
use crate::device::command::Command;
use crate::device::session::{CommandChannel, DeviceSession, Released, SessionToken, SubscriptionHandle};
use crate::device::telemetry::Telemetry;
use crate::device::transport::{BleTransport, EventStream, NotificationStream};
use crate::device::types::{DeviceEvent, DeviceId, GattService, Notification, SessionStatus, TransportEvent};
use crate::error::{ConnectError, DiscoveryError, ScanError, SessionError, TransportError, WriteError};

struct Link {
    events: EventStream,
    notifications: NotificationStream,
}

// One step of the connection task. Every step carries the token of the attempt it belongs to.
enum Step {
    Search(SessionToken),
    Connect(SessionToken, DeviceId),
    Monitor(SessionToken, DeviceId, Link),
    Recover(SessionToken, DeviceId),
    Stop,
}

struct Attempt {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner<T> {
    transport: Arc<T>,
    config: Config,
    session: Mutex<DeviceSession>,
    telemetry: Mutex<Telemetry>,
    senders: Mutex<Vec<UnboundedSender<DeviceEvent>>>,
    attempt: Mutex<Attempt>,
}

async fn open_link<T: BleTransport + ?Sized>(transport: &T, device: &DeviceId) -> Result<(), ConnectError> {
    info!("Connecting to peripheral {}...", device);
    transport.connect(device).await?;
    Ok(())
}

async fn enumerate<T: BleTransport + ?Sized>(transport: &T, device: &DeviceId) -> Result<Vec<GattService>, DiscoveryError> {
    info!("Connected; Discovering services...");
    Ok(transport.discover(device).await?)
}

fn locate_service(services: &[GattService], uuid: Uuid) -> Result<&GattService, DiscoveryError> {
    services
        .iter()
        .find(|service| service.uuid == uuid)
        .ok_or(DiscoveryError::MissingService(uuid))
}

fn locate_command_channel(device: &DeviceId, service: &GattService, uuid: Uuid) -> Result<CommandChannel, DiscoveryError> {
    if !service.characteristics.contains(&uuid) {
        return Err(DiscoveryError::MissingCharacteristic { service: service.uuid, characteristic: uuid });
    }

    Ok(CommandChannel {
        device: device.clone(),
        service: service.uuid,
        characteristic: uuid,
    })
}

async fn unsubscribe_all<T: BleTransport + ?Sized>(transport: &T, handles: &[SubscriptionHandle]) {
    for handle in handles {
        if let Err(err) = transport.unsubscribe(&handle.device, handle.service, handle.characteristic).await {
            debug!("Failed to unsubscribe from {}: {}", handle.characteristic, err);
        }
    }
}

async fn subscribe_notifications<T: BleTransport + ?Sized>(
    transport: &T,
    device: &DeviceId,
    service: &GattService,
    characteristics: &[Uuid],
) -> Result<Vec<SubscriptionHandle>, SessionError> {
    let mut handles: Vec<SubscriptionHandle> = Vec::with_capacity(characteristics.len());

    for characteristic in characteristics.iter().copied() {
        let result = if service.characteristics.contains(&characteristic) {
            transport
                .subscribe(device, service.uuid, characteristic)
                .await
                .map_err(|source| SessionError::Subscribe { characteristic, source })
        } else {
            Err(DiscoveryError::MissingCharacteristic { service: service.uuid, characteristic }.into())
        };

        if let Err(err) = result {
            unsubscribe_all(transport, &handles).await;
            return Err(err);
        }

        handles.push(SubscriptionHandle {
            device: device.clone(),
            service: service.uuid,
            characteristic,
        });
    }

    Ok(handles)
}

impl<T: BleTransport + 'static> Inner<T> {
    fn session(&self) -> MutexGuard<'_, DeviceSession> {
        self.session.lock().expect("Failed to lock device session")
    }

    fn emit(&self, event: DeviceEvent) {
        let mut senders = self.senders.lock().expect("Failed to lock event senders");
        senders.retain(|sender| sender.unbounded_send(event.clone()).is_ok());
    }

    fn enter(&self, token: SessionToken, status: SessionStatus) -> Option<Released> {
        let released = self.session().transition(token, status)?;
        self.emit(DeviceEvent::StateChange(status));
        Some(released)
    }

    async fn release(&self, released: Released) {
        unsubscribe_all(self.transport.as_ref(), &released.subscriptions).await;

        if let Some(device) = released.device {
            if let Err(err) = self.transport.disconnect(&device).await {
                debug!("Failed to disconnect {}: {}", device, err);
            }
        }
    }

    async fn fail(&self, token: SessionToken, error: SessionError) -> Step {
        warn!("Connection attempt failed: {}", error);
        let message = error.to_string();
        let released = self.session().fail(token, message.clone());

        if let Some(released) = released {
            self.release(released).await;
            self.emit(DeviceEvent::StateChange(SessionStatus::Error));
            self.emit(DeviceEvent::Alert(message));
        }

        Step::Stop
    }

    fn begin_connect(&self, token: SessionToken, device: DeviceId) -> Step {
        let accepted = self.session().connecting(token, &device).is_some();
        if !accepted {
            return Step::Stop;
        }

        self.emit(DeviceEvent::StateChange(SessionStatus::Connecting));
        Step::Connect(token, device)
    }

    async fn advance(&self, step: Step) -> Step {
        match step {
            Step::Search(token) => self.search(token).await,
            Step::Connect(token, device) => self.connect(token, device).await,
            Step::Monitor(token, device, link) => self.monitor(token, device, link).await,
            Step::Recover(token, device) => self.recover(token, device).await,
            Step::Stop => Step::Stop,
        }
    }

    async fn search(&self, token: SessionToken) -> Step {
        match self.transport.connected_devices(self.config.service_uuid).await {
            Ok(devices) => {
                if let Some(device) = devices.into_iter().next() {
                    info!("Using already connected peripheral {}", device);
                    return self.begin_connect(token, device);
                }
            },
            Err(err) => debug!("Could not list connected peripherals: {}", err),
        }

        let mut events = match self.transport.events().await {
            Ok(events) => events,
            Err(err) => return self.fail(token, ScanError::from(err).into()).await,
        };

        if let Err(err) = self.transport.start_scan().await {
            return self.fail(token, ScanError::from(err).into()).await;
        }

        while let Some(event) = events.next().await {
            let TransportEvent::Advertisement { id, local_name } = event else {
                continue;
            };

            if local_name.as_deref() != Some(self.config.device_name.as_str()) {
                trace!("Ignoring peripheral {} {:?}", id, local_name);
                continue;
            }

            info!("Found {} ({})", self.config.device_name, id);
            if let Err(err) = self.transport.stop_scan().await {
                warn!("Failed to stop scanning: {}", err);
            }
            return self.begin_connect(token, id);
        }

        let err = TransportError::Other("The adapter stopped reporting scan results".to_string());
        self.fail(token, ScanError::from(err).into()).await
    }

    async fn establish(&self, device: &DeviceId) -> Result<(CommandChannel, Vec<SubscriptionHandle>, NotificationStream), SessionError> {
        let transport = self.transport.as_ref();

        open_link(transport, device).await?;
        let services = enumerate(transport, device).await?;
        let service = locate_service(&services, self.config.service_uuid)?;
        let channel = locate_command_channel(device, service, self.config.command_characteristic_uuid)?;

        let notifications = transport.notifications(device).await.map_err(ConnectError::from)?;
        let subscriptions = subscribe_notifications(
            transport,
            device,
            service,
            &self.config.notify_characteristic_uuids,
        ).await?;

        Ok((channel, subscriptions, notifications))
    }

    async fn connect(&self, token: SessionToken, device: DeviceId) -> Step {
        // listen before connecting so that an early drop is not missed
        let events = match self.transport.events().await {
            Ok(events) => events,
            Err(err) => return self.fail(token, ConnectError::from(err).into()).await,
        };

        let (channel, subscriptions, notifications) = match self.establish(&device).await {
            Ok(established) => established,
            Err(err) => return self.fail(token, err).await,
        };

        let handles = subscriptions.clone();
        let established = self.session().establish(token, channel, subscriptions);
        if !established {
            debug!("Attempt {} was superseded while connecting", token.generation());
            self.release(Released { device: Some(device), subscriptions: handles }).await;
            return Step::Stop;
        }

        info!("Peripheral ready");
        self.emit(DeviceEvent::StateChange(SessionStatus::Connected));
        Step::Monitor(token, device, Link { events, notifications })
    }

    fn handle_notification(&self, notification: Notification) {
        let payload = match decode_payload(&notification.value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Ignoring notification from {}: {}", notification.characteristic, err);
                return;
            },
        };

        let applied = self.telemetry.lock().expect("Failed to lock telemetry").apply(&payload);
        if let Err(err) = applied {
            warn!("Ignoring notification from {}: {}", notification.characteristic, err);
            return;
        }

        debug!("Notification from {}: {:?}", notification.characteristic, payload);
        self.emit(DeviceEvent::Reading { characteristic: notification.characteristic, payload });
    }

    async fn monitor(&self, token: SessionToken, device: DeviceId, mut link: Link) -> Step {
        loop {
            tokio::select! {
                notification = link.notifications.next() => match notification {
                    Some(notification) => self.handle_notification(notification),
                    None => {
                        warn!("Notification stream of {} ended", device);
                        break;
                    },
                },
                event = link.events.next() => match event {
                    Some(TransportEvent::Disconnected(id)) if id == device => {
                        warn!("{}", SessionError::Disconnected);
                        break;
                    },
                    Some(_) => {},
                    None => {
                        warn!("Adapter event stream ended");
                        break;
                    },
                },
            }
        }

        let released = self.session().link_dropped(token, &device);
        let Some(released) = released else {
            return Step::Stop;
        };

        self.emit(DeviceEvent::StateChange(SessionStatus::Disconnected));
        self.release(released).await;

        match self.config.reconnect_policy {
            ReconnectPolicy::Manual => {
                self.emit(DeviceEvent::Alert(format!(
                    "{} ({}). Please verify the device is powered and in range, then search again.",
                    SessionError::Disconnected,
                    self.config.device_name,
                )));
                Step::Stop
            },
            ReconnectPolicy::Rescan | ReconnectPolicy::Direct => Step::Recover(token, device),
        }
    }

    async fn recover(&self, token: SessionToken, device: DeviceId) -> Step {
        let token = {
            let mut session = self.session();
            if !session.is_current(token) {
                return Step::Stop;
            }
            session.begin_attempt(SessionStatus::Reconnecting).0
        };
        self.emit(DeviceEvent::StateChange(SessionStatus::Reconnecting));

        sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;

        match self.config.reconnect_policy {
            ReconnectPolicy::Direct => {
                info!("Reconnecting to {}", device);
                self.begin_connect(token, device)
            },
            _ => {
                info!("Restarting discovery");
                match self.enter(token, SessionStatus::Searching) {
                    Some(_) => Step::Search(token),
                    None => Step::Stop,
                }
            },
        }
    }

    async fn write(&self, channel: &CommandChannel, command: &Command) -> Result<(), WriteError> {
        let value = command.encode();
        let deadline = self.config.write_deadline_ms;
        let fut = self.transport.write(&channel.device, channel.service, channel.characteristic, &value);

        tokio::select! {
            _ = sleep(Duration::from_millis(deadline)) => {
                warn!("Sending to command characteristic took too long");
                Err(WriteError::Deadline(deadline))
            }
            result = fut => match result {
                Ok(()) => {
                    info!("Wrote '{}' to BLE device", command);
                    Ok(())
                },
                Err(err) => Err(err.into()),
            }
        }
    }
}

async fn drive<T: BleTransport + 'static>(inner: Arc<Inner<T>>, cancel: CancellationToken, mut step: Step) {
    loop {
        step = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Connection task cancelled");
                return;
            },
            next = inner.advance(step) => next,
        };

        if let Step::Stop = step {
            return;
        }
    }
}

/// Drives the session with one peripheral: discovery, connection, notifications, reconnection
/// and command writes.
///
/// State changes, readings and user-facing alerts are published to every receiver returned by
/// [`SessionManager::subscribe`].
pub struct SessionManager<T: BleTransport + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: BleTransport + 'static> Clone for SessionManager<T> {
    fn clone(&self) -> Self {
        SessionManager { inner: self.inner.clone() }
    }
}

impl<T: BleTransport + 'static> SessionManager<T> {
    /// `offset` is used to render timestamp notifications in local time.
    pub fn new(transport: Arc<T>, config: Config, offset: UtcOffset) -> Self {
        let telemetry = Telemetry::new(config.history_capacity, offset);

        SessionManager {
            inner: Arc::new(Inner {
                transport,
                config,
                session: Mutex::new(DeviceSession::new()),
                telemetry: Mutex::new(telemetry),
                senders: Mutex::new(Vec::new()),
                attempt: Mutex::new(Attempt { cancel: CancellationToken::new(), handle: None }),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DeviceEvent> {
        let (sender, receiver) = unbounded();
        self.inner.senders.lock().expect("Failed to lock event senders").push(sender);
        receiver
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.session().status()
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.inner.session().device_id().cloned()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.session().last_error().map(str::to_string)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.inner.session().subscriptions().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session().command_channel().is_some()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.inner.telemetry.lock().expect("Failed to lock telemetry").clone()
    }

    /// Starts discovery. Only one scan or connection sequence may run at a time, so this is
    /// rejected unless the session is `Disconnected` or in `Error`.
    pub fn start_scan(&self) -> Result<(), ScanError> {
        let token = {
            let mut session = self.inner.session();
            let status = session.status();
            if status.is_busy() {
                debug!("Rejecting scan request while {}", status);
                return Err(ScanError::Busy(status));
            }
            session.begin_attempt(SessionStatus::Searching).0
        };
        self.inner.emit(DeviceEvent::StateChange(SessionStatus::Searching));

        let mut attempt = self.inner.attempt.lock().expect("Failed to lock connection task");
        attempt.cancel.cancel();
        attempt.cancel = CancellationToken::new();
        attempt.handle = Some(spawn(drive(self.inner.clone(), attempt.cancel.clone(), Step::Search(token))));
        Ok(())
    }

    /// Manual retry after a failed attempt.
    pub fn retry(&self) -> Result<(), ScanError> {
        info!("Retrying connection");
        self.start_scan()
    }

    /// Validates and writes a text command such as `set/flowRate/42`.
    pub async fn send(&self, command: &str) -> Result<(), WriteError> {
        match command.parse::<Command>() {
            Ok(command) => self.send_command(&command).await,
            Err(err) => {
                let err = WriteError::from(err);
                self.inner.emit(DeviceEvent::Alert(err.to_string()));
                Err(err)
            },
        }
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), WriteError> {
        let channel = self.inner.session().command_channel().cloned();

        let result = match channel {
            None => Err(WriteError::NotConnected),
            Some(channel) => self.inner.write(&channel, command).await,
        };

        if let Err(err) = &result {
            warn!("Failed to send '{}': {}", command, err);
            self.inner.emit(DeviceEvent::Alert(format!(
                "Could not send '{}' ({}). Please verify that the device is connected.",
                command, err,
            )));
        }

        result
    }

    /// Ends the session: cancels any scan or connection task, releases every subscription and
    /// closes the link.
    pub async fn shutdown(&self) {
        let (previous, released) = {
            let mut session = self.inner.session();
            (session.status(), session.teardown())
        };

        let handle = {
            let mut attempt = self.inner.attempt.lock().expect("Failed to lock connection task");
            attempt.cancel.cancel();
            attempt.handle.take()
        };

        if let Some(handle) = handle {
            info!("Waiting for connection task to stop");
            if let Err(err) = handle.await {
                warn!("Connection task ended abnormally: {}", err);
            }
        }

        if let Err(err) = self.inner.transport.stop_scan().await {
            debug!("Failed to stop scanning: {}", err);
        }
        self.inner.release(released).await;

        if previous != SessionStatus::Disconnected {
            self.inner.emit(DeviceEvent::StateChange(SessionStatus::Disconnected));
        }
        info!("Session closed");
    }
}
