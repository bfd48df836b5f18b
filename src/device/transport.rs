use std::pin::Pin;
use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::device::codec::FramedValue;
use crate::device::types::{DeviceId, GattService, Notification, TransportEvent};
use crate::error::TransportError;

pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// The BLE radio as seen by the session manager.
///
/// Implementations carry characteristic values as [`FramedValue`]s and convert to raw bytes at
/// their own edge.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// A fresh stream of advertisements and disconnects. Only events after the call are seen.
    async fn events(&self) -> Result<EventStream, TransportError>;

    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Peripherals the host is already connected to that expose `service`.
    async fn connected_devices(&self, service: Uuid) -> Result<Vec<DeviceId>, TransportError>;

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError>;

    /// Enumerates all services and their characteristics.
    async fn discover(&self, device: &DeviceId) -> Result<Vec<GattService>, TransportError>;

    /// Notifications of every subscribed characteristic of `device`.
    async fn notifications(&self, device: &DeviceId) -> Result<NotificationStream, TransportError>;

    async fn subscribe(&self, device: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<(), TransportError>;

    async fn unsubscribe(&self, device: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<(), TransportError>;

    /// Acknowledged write; resolves once the peripheral answered.
    async fn write(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &FramedValue,
    ) -> Result<(), TransportError>;
}
