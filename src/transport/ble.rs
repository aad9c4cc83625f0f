//! BLE link over the Nordic UART service.
//!
//! The BMS dongle exposes the usual NUS pair: a write characteristic for
//! commands and a notify characteristic whose notifications each carry one
//! frame (a binary telemetry packet, possibly base64-armoured, or an ASCII
//! response line).

use crate::error::{Error, Result};
use crate::frame::Codec;
use crate::transport::{Adapter, Link};
use async_trait::async_trait;
use bluest::{AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

const NORDIC_UART_SERVICE_ID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
const NORDIC_UART_WRITE_CHARACTERISTIC_ID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
const NORDIC_UART_NOTIFY_CHARACTERISTIC_ID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// How long to scan before giving up on finding the named device.
const DISCOVERY_TIMEOUT_S: u64 = 30;

fn service_id() -> Uuid {
    Uuid::parse_str(NORDIC_UART_SERVICE_ID).unwrap()
}

fn write_characteristic_id() -> Uuid {
    Uuid::parse_str(NORDIC_UART_WRITE_CHARACTERISTIC_ID).unwrap()
}

fn notify_characteristic_id() -> Uuid {
    Uuid::parse_str(NORDIC_UART_NOTIFY_CHARACTERISTIC_ID).unwrap()
}

pub struct BleAdapter {
    adapter: bluest::Adapter,
}

impl BleAdapter {
    pub async fn new() -> Result<Self> {
        let adapter = bluest::Adapter::default()
            .await
            .ok_or_else(|| Error::Transport("default bluetooth adapter not found".into()))?;
        Ok(Self { adapter })
    }

    /// Scan for advertising devices carrying the UART service and collect
    /// their names for the given duration.
    pub async fn scan_peers(&self, scan_for: Duration) -> Result<Vec<String>> {
        self.adapter
            .wait_available()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let services = [service_id()];
        let mut events = self
            .adapter
            .scan(&services)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut names = Vec::new();
        let _ = timeout(scan_for, async {
            while let Some(found) = events.next().await {
                if let Ok(name) = found.device.name_async().await {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        })
        .await;
        Ok(names)
    }

    async fn discover_device(&self, name: &str) -> Result<AdvertisingDevice> {
        let services = [service_id()];
        let mut events = self
            .adapter
            .scan(&services)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        while let Some(found) = events.next().await {
            let device_name = found
                .device
                .name_async()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            if device_name == name {
                return Ok(found);
            }
        }
        Err(Error::Transport(format!("device {name} not found")))
    }

    async fn characteristic(device: &Device, id: Uuid, what: &str) -> Result<Characteristic> {
        let service = device
            .discover_services_with_uuid(service_id())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .first()
            .ok_or_else(|| Error::Transport("device does not offer the UART service".into()))?
            .clone();
        service
            .discover_characteristics_with_uuid(id)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .first()
            .cloned()
            .ok_or_else(|| Error::Transport(format!("device is missing the {what} characteristic")))
    }
}

#[async_trait]
impl Adapter for BleAdapter {
    async fn is_available(&self) -> bool {
        timeout(Duration::from_secs(5), self.adapter.wait_available())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn connect(&self, target: &str) -> Result<Box<dyn Link>> {
        self.adapter
            .wait_available()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let found = timeout(
            Duration::from_secs(DISCOVERY_TIMEOUT_S),
            self.discover_device(target),
        )
        .await
        .map_err(|_| Error::Transport(format!("device {target} not found")))??;

        self.adapter
            .connect_device(&found.device)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        debug!(target, "ble device connected");

        let write =
            Self::characteristic(&found.device, write_characteristic_id(), "write").await?;
        let notify =
            Self::characteristic(&found.device, notify_characteristic_id(), "notify").await?;

        // The notification stream borrows its characteristic, so a reader
        // task owns both and forwards frames over a channel.
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            let mut stream = match notify.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = frame_tx.send(Err(Error::Transport(e.to_string()))).await;
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                if let Ok(data) = &item {
                    trace!(rx = %hex::encode(data), "ble notification");
                }
                let item = item.map_err(|e| Error::Transport(e.to_string()));
                if frame_tx.send(item).await.is_err() {
                    break;
                }
            }
            debug!("ble notification stream ended");
        });

        Ok(Box::new(BleLink {
            adapter: self.adapter.clone(),
            device: found.device,
            write,
            frame_rx,
            reader,
        }))
    }
}

pub struct BleLink {
    adapter: bluest::Adapter,
    device: Device,
    write: Characteristic,
    frame_rx: mpsc::Receiver<Result<Vec<u8>>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Link for BleLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(tx = %hex::encode(bytes), "ble write");
        self.write
            .write(bytes)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.frame_rx.recv().await
    }

    fn codec(&self) -> Codec {
        Codec::Packet
    }

    async fn close(&mut self) {
        self.reader.abort();
        if let Err(e) = self.adapter.disconnect_device(&self.device).await {
            warn!(error = %e, "ble disconnect failed");
        }
    }
}
