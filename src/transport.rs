//! The external BLE capability the link consumes.
//!
//! The session and supervisor are written against a small trait family
//! rather than `bluest` directly, so the lifecycle can be driven by a
//! scripted transport in tests. [`BluestTransport`] is the real
//! implementation over the platform adapter.

use crate::error::LinkError;
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Uuid};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Raw notification payloads from one characteristic, in delivery order.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LinkError>> + Send>>;

/// Entry point to the platform BLE stack.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Resolve once the adapter is powered on and usable.
    async fn available(&self) -> Result<(), LinkError>;

    /// Scan for devices advertising `service`, accept the first match and
    /// stop scanning immediately.
    async fn find_device(
        &self,
        service: Uuid,
        scan_timeout: Duration,
    ) -> Result<Box<dyn BleDevice>, LinkError>;
}

/// One discovered device.
#[async_trait]
pub trait BleDevice: Send + Sync {
    fn id(&self) -> String;

    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    /// All characteristics of `service` on the connected device.
    async fn discover_characteristics(
        &self,
        service: Uuid,
    ) -> Result<Vec<Box<dyn BleCharacteristic>>, LinkError>;

    /// Resolves once when the device drops the connection unexpectedly.
    async fn disconnected(&self);
}

/// One characteristic on a connected device.
#[async_trait]
pub trait BleCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    /// Register for notifications. The subscription is released when the
    /// returned stream is dropped.
    async fn notifications(&self) -> Result<NotificationStream, LinkError>;
}

/// [`BleTransport`] over the platform adapter via `bluest`.
pub struct BluestTransport {
    adapter: Adapter,
}

impl BluestTransport {
    pub async fn new() -> Result<Self, LinkError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| LinkError::AdapterUnavailable("default adapter not found".into()))?;
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BleTransport for BluestTransport {
    async fn available(&self) -> Result<(), LinkError> {
        self.adapter
            .wait_available()
            .await
            .map_err(|err| LinkError::AdapterUnavailable(err.to_string()))
    }

    async fn find_device(
        &self,
        service: Uuid,
        scan_timeout: Duration,
    ) -> Result<Box<dyn BleDevice>, LinkError> {
        let services = [service];
        let mut scan = self
            .adapter
            .scan(&services)
            .await
            .map_err(|err| LinkError::Scan(err.to_string()))?;

        let discovered = timeout(scan_timeout, scan.next())
            .await
            .map_err(|_| LinkError::Scan("no device advertising the service was found".into()))?
            .ok_or_else(|| LinkError::Scan("scan ended before a device was found".into()))?;

        // Dropping the scan stream stops the scan.
        Ok(Box::new(BluestDevice {
            adapter: self.adapter.clone(),
            device: discovered.device,
        }))
    }
}

struct BluestDevice {
    adapter: Adapter,
    device: Device,
}

#[async_trait]
impl BleDevice for BluestDevice {
    fn id(&self) -> String {
        format!("{:?}", self.device.id())
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.adapter
            .connect_device(&self.device)
            .await
            .map_err(|err| LinkError::Connect(err.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.adapter
            .disconnect_device(&self.device)
            .await
            .map_err(|err| LinkError::Disconnect(err.to_string()))
    }

    async fn discover_characteristics(
        &self,
        service: Uuid,
    ) -> Result<Vec<Box<dyn BleCharacteristic>>, LinkError> {
        let service = self
            .device
            .discover_services_with_uuid(service)
            .await
            .map_err(|err| LinkError::Discovery(err.to_string()))?
            .first()
            .ok_or_else(|| LinkError::Discovery("the device does not expose the service".into()))?
            .clone();

        let characteristics = service
            .discover_characteristics()
            .await
            .map_err(|err| LinkError::Discovery(err.to_string()))?;

        Ok(characteristics
            .into_iter()
            .map(|characteristic| {
                Box::new(BluestCharacteristic { characteristic }) as Box<dyn BleCharacteristic>
            })
            .collect())
    }

    async fn disconnected(&self) {
        match self.adapter.device_connection_events(&self.device).await {
            Ok(events) => {
                let mut events = std::pin::pin!(events);
                while let Some(event) = events.next().await {
                    if matches!(event, ConnectionEvent::Disconnected) {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "connection events unavailable, polling instead");
            }
        }
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !self.device.is_connected().await {
                return;
            }
        }
    }
}

struct BluestCharacteristic {
    characteristic: Characteristic,
}

#[async_trait]
impl BleCharacteristic for BluestCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid()
    }

    async fn notifications(&self) -> Result<NotificationStream, LinkError> {
        // `Characteristic::notify` borrows the characteristic, so a pump
        // task owns it for the lifetime of the subscription and forwards
        // into a channel. Dropping the returned stream ends the task, which
        // drops the inner stream and deregisters the notification.
        let characteristic = self.characteristic.clone();
        let uuid = self.characteristic.uuid();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    let _ = tx.send(Err(LinkError::Notification {
                        characteristic: uuid,
                        message: err.to_string(),
                    }));
                    return;
                }
            };
            let mut notifications = std::pin::pin!(notifications);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    item = notifications.next() => match item {
                        Some(item) => {
                            let item = item.map_err(|err| LinkError::Notification {
                                characteristic: uuid,
                                message: err.to_string(),
                            });
                            if tx.send(item).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}
