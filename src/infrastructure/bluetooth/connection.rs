//! BLE Connection Module
//!
//! Opens the device, keeps a GATT session alive and resolves a characteristic
//! for every channel in the directory.

use crate::domain::channels::{self, ChannelId, DIRECTORY};
use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::protocol;
use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCommunicationStatus, GattSession,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};

/// Result of a successful connection
pub struct ConnectionResult {
    pub device: BluetoothLEDevice,
    pub session: GattSession,
    pub characteristics: HashMap<ChannelId, GattCharacteristic>,
}

pub struct BleConnection {
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleConnection {
    /// Status messages go to `event_sender`.
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { event_sender }
    }

    /// Connect to a device by Bluetooth address
    pub async fn connect(&self, address: u64) -> Result<ConnectionResult> {
        info!("Connecting to watch: {:#X}", address);
        self.send_log("Connecting to watch...", MessageSeverity::Info);

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?
            .await
            .with_context(|| format!("No BLE device at {address:#X}"))?;
        info!("Device opened: {:?}", device.Name()?);

        let session = self.open_session(&device).await?;
        let characteristics = self.resolve_channels(&device).await?;

        self.send_log(
            &format!("Watch connected ({} channels)", characteristics.len()),
            MessageSeverity::Success,
        );
        Ok(ConnectionResult {
            device,
            session,
            characteristics,
        })
    }

    /// Create a GattSession so Windows keeps the link up between writes.
    async fn open_session(&self, device: &BluetoothLEDevice) -> Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?
            .await
            .context("Failed to open GATT session")?;
        session.SetMaintainConnection(true)?;
        info!("GATT session open, max PDU {}", session.MaxPduSize()?);
        Ok(session)
    }

    /// Map every directory channel the watch exposes to its characteristic.
    async fn resolve_channels(
        &self,
        device: &BluetoothLEDevice,
    ) -> Result<HashMap<ChannelId, GattCharacteristic>> {
        let services_result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        if services_result.Status()? != GattCommunicationStatus::Success {
            anyhow::bail!(
                "Failed to get GATT services: {:?}",
                services_result.Status()?
            );
        }

        let mut found = HashMap::new();
        let services = services_result.Services()?;
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let chars_result = service.GetCharacteristicsAsync()?.await?;
            if chars_result.Status()? != GattCommunicationStatus::Success {
                debug!("Skipping service {:?}: characteristics unavailable", service.Uuid()?);
                continue;
            }
            let characteristics = chars_result.Characteristics()?;
            for j in 0..characteristics.Size()? {
                let characteristic = characteristics.GetAt(j)?;
                let id = protocol::channel_for(&characteristic.Uuid()?);
                if let Some(channel) = channels::lookup(id) {
                    debug!("Resolved {}", channel.name);
                    found.insert(id, characteristic);
                }
            }
        }

        for channel in DIRECTORY {
            if !found.contains_key(&channel.id) {
                warn!(
                    "Watch does not expose {} ({:?})",
                    channel.name,
                    protocol::guid_for(channel.id)
                );
            }
        }
        if found.is_empty() {
            anyhow::bail!("Device exposes none of the watch channels");
        }
        Ok(found)
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
