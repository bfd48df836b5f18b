use std::collections::HashSet;
use std::sync::Mutex;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::device::codec::FramedValue;
use crate::device::transport::{BleTransport, EventStream, NotificationStream};
use crate::device::types::{DeviceId, GattService, Notification, TransportEvent};
use crate::error::TransportError;

/// The host's bluetooth adapter, backed by btleplug.
///
/// Create it once per process with [`BtleRadio::init`] and release it with
/// [`BtleRadio::shutdown`].
pub struct BtleRadio {
    // the adapters stay valid only as long as the manager lives
    _manager: Manager,
    adapter: Adapter,
    connected: Mutex<HashSet<DeviceId>>,
}

impl BtleRadio {
    pub async fn init() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        Ok(BtleRadio {
            _manager: manager,
            adapter,
            connected: Mutex::new(HashSet::new()),
        })
    }

    /// Stops scanning and disconnects every peripheral this radio connected to.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        if let Err(err) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan during shutdown: {:?}", err);
        }

        let devices: Vec<DeviceId> = self.connected.lock()
            .expect("Failed to lock connected devices")
            .drain()
            .collect();

        for device in devices {
            match self.peripheral(&device).await {
                Ok(peripheral) => {
                    info!("Disconnecting {}", device);
                    peripheral.disconnect().await?;
                },
                Err(err) => warn!("Peripheral {} vanished before shutdown: {}", device, err),
            }
        }

        Ok(())
    }

    // looks the peripheral up again on every call; references kept across drops go stale
    async fn peripheral(&self, device: &DeviceId) -> Result<Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| peripheral.id().to_string() == device.0)
            .ok_or_else(|| TransportError::UnknownPeripheral(device.0.clone()))
    }

    fn characteristic(peripheral: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(TransportError::UnknownCharacteristic(characteristic))
    }
}

#[async_trait]
impl BleTransport for BtleRadio {
    async fn events(&self) -> Result<EventStream, TransportError> {
        let adapter = self.adapter.clone();
        let events = self.adapter.events().await?;

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripheral = adapter.peripheral(&id).await.ok()?;
                        let local_name = match peripheral.properties().await {
                            Ok(Some(properties)) => properties.local_name,
                            Ok(None) => None,
                            Err(err) => {
                                warn!("Could not query peripheral for properties: {:?}", err);
                                None
                            },
                        };
                        Some(TransportEvent::Advertisement { id: DeviceId(id.to_string()), local_name })
                    },
                    CentralEvent::DeviceDisconnected(id) => Some(TransportEvent::Disconnected(DeviceId(id.to_string()))),
                    _ => None,
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        info!("Scanning...");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connected_devices(&self, service: Uuid) -> Result<Vec<DeviceId>, TransportError> {
        let mut devices = Vec::new();

        for peripheral in self.adapter.peripherals().await? {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }

            let advertised = match peripheral.properties().await {
                Ok(Some(properties)) => properties.services.contains(&service),
                _ => false,
            };
            let discovered = peripheral.services().iter().any(|s| s.uuid == service);

            if advertised || discovered {
                devices.push(DeviceId(peripheral.id().to_string()));
            }
        }

        Ok(devices)
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        self.connected.lock().expect("Failed to lock connected devices").insert(device.clone());
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.connected.lock().expect("Failed to lock connected devices").remove(device);
        let peripheral = self.peripheral(device).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover(&self, device: &DeviceId) -> Result<Vec<GattService>, TransportError> {
        let peripheral = self.peripheral(device).await?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn notifications(&self, device: &DeviceId) -> Result<NotificationStream, TransportError> {
        let peripheral = self.peripheral(device).await?;
        let stream = peripheral.notifications().await?.map(|data| Notification {
            characteristic: data.uuid,
            value: FramedValue::from_bytes(&data.value),
        });
        Ok(Box::pin(stream))
    }

    async fn subscribe(&self, device: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        info!("Subscribing to characteristic {:?} {:?}", service, characteristic.uuid);
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, device: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn write(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &FramedValue,
    ) -> Result<(), TransportError> {
        let bytes = value
            .to_bytes()
            .map_err(|err| TransportError::Other(format!("Refusing to write malformed value: {}", err)))?;
        let peripheral = self.peripheral(device).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral.write(&characteristic, &bytes, WriteType::WithResponse).await?;
        Ok(())
    }
}
