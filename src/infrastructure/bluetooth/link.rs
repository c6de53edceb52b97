//! Device Link over the WinRT GATT client.

use crate::domain::channels::ChannelId;
use crate::domain::models::{AppEvent, LinkState};
use crate::infrastructure::bluetooth::connection::{BleConnection, ConnectionResult};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::link::{
    check_inbound, check_outbound, ChannelCallback, DeviceLink, LinkError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use windows::core::{IInspectable, Ref};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;

fn platform(e: windows::core::Error) -> LinkError {
    LinkError::Platform(e.message().to_string())
}

fn map_status(status: BluetoothConnectionStatus) -> LinkState {
    if status == BluetoothConnectionStatus::Connected {
        LinkState::Connected
    } else {
        LinkState::Disconnected
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// How long a write may wait for the watch's acknowledgement.
    pub write_timeout: Duration,
    /// Used when the session cannot report its PDU size.
    pub fallback_mtu: u32,
}

pub struct WinRtLink {
    device: BluetoothLEDevice,
    session: GattSession,
    characteristics: HashMap<ChannelId, GattCharacteristic>,
    subscriptions: Mutex<HashMap<ChannelId, i64>>,
    state_tx: Arc<watch::Sender<LinkState>>,
    mtu: Arc<AtomicU32>,
    write_timeout: Duration,
    status_token: i64,
    pdu_token: i64,
}

impl WinRtLink {
    /// Connect to the watch at `address` and wire platform events.
    pub async fn open(
        address: u64,
        options: LinkOptions,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let connection = BleConnection::new(events).connect(address).await?;
        Ok(Arc::new(Self::from_connection(connection, options)?))
    }

    /// Build the link over an already resolved connection and start
    /// following its connection status.
    pub fn from_connection(
        connection: ConnectionResult,
        options: LinkOptions,
    ) -> anyhow::Result<Self> {
        let ConnectionResult {
            device,
            session,
            characteristics,
        } = connection;

        let initial = map_status(device.ConnectionStatus()?);
        let (state_tx, _) = watch::channel(initial);
        let state_tx = Arc::new(state_tx);

        let sender = state_tx.clone();
        let status_handler = TypedEventHandler::new(
            move |dev: Ref<BluetoothLEDevice>, _: Ref<IInspectable>| {
                if let Some(dev) = dev.as_ref() {
                    let state = map_status(dev.ConnectionStatus()?);
                    info!("Watch connection status: {:?}", state);
                    sender.send_replace(state);
                }
                Ok(())
            },
        );
        let status_token = device.ConnectionStatusChanged(&status_handler)?;

        let initial_mtu = session
            .MaxPduSize()
            .map(protocol::payload_mtu)
            .unwrap_or(options.fallback_mtu);
        let mtu = Arc::new(AtomicU32::new(initial_mtu));
        let current = mtu.clone();
        let pdu_handler =
            TypedEventHandler::new(move |session: Ref<GattSession>, _: Ref<IInspectable>| {
                if let Some(session) = session.as_ref() {
                    let payload = protocol::payload_mtu(session.MaxPduSize()?);
                    info!("Negotiated MTU changed: {}", payload);
                    current.store(payload, Ordering::SeqCst);
                }
                Ok(())
            });
        let pdu_token = session.MaxPduSizeChanged(&pdu_handler)?;

        Ok(Self {
            device,
            session,
            characteristics,
            subscriptions: Mutex::new(HashMap::new()),
            state_tx,
            mtu,
            write_timeout: options.write_timeout,
            status_token,
            pdu_token,
        })
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<ChannelId, i64>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn characteristic(&self, channel: ChannelId) -> Result<&GattCharacteristic, LinkError> {
        self.characteristics
            .get(&channel)
            .ok_or(LinkError::UnknownChannel(channel))
    }

    fn classify(&self, e: windows::core::Error) -> LinkError {
        if self.connection_state() == LinkState::Connected {
            platform(e)
        } else {
            LinkError::Disconnected
        }
    }
}

#[async_trait]
impl DeviceLink for WinRtLink {
    fn connection_state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    async fn send(&self, channel: ChannelId, bytes: &[u8]) -> Result<(), LinkError> {
        if self.connection_state() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        check_outbound(channel)?;
        let characteristic = self.characteristic(channel)?;

        let buffer = protocol::to_buffer(bytes).map_err(platform)?;
        let operation = characteristic
            .WriteValueWithResultAndOptionAsync(&buffer, GattWriteOption::WriteWithResponse)
            .map_err(platform)?;
        let result = tokio::time::timeout(self.write_timeout, operation)
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|e| self.classify(e))?;

        match result.Status().map_err(platform)? {
            GattCommunicationStatus::Success => {
                trace!(%channel, len = bytes.len(), "GATT write");
                Ok(())
            }
            GattCommunicationStatus::Unreachable => Err(LinkError::Disconnected),
            status => Err(LinkError::Platform(format!("write rejected: {status:?}"))),
        }
    }

    async fn register_callback(
        &self,
        channel: ChannelId,
        callback: ChannelCallback,
    ) -> Result<(), LinkError> {
        check_inbound(channel)?;
        let characteristic = self.characteristic(channel)?;
        self.unregister_callback(channel).await;

        let handler = TypedEventHandler::new(
            move |_: Ref<GattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match args
                        .CharacteristicValue()
                        .and_then(|value| protocol::read_buffer(&value))
                    {
                        Ok(bytes) => callback(&bytes),
                        Err(e) => warn!("Unreadable notification: {}", e.message()),
                    }
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler).map_err(platform)?;

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(platform)?
            .await
            .map_err(|e| self.classify(e));
        match status {
            Ok(GattCommunicationStatus::Success) => {
                debug!(%channel, "Notifications enabled");
                self.subscriptions().insert(channel, token);
                Ok(())
            }
            other => {
                let _ = characteristic.RemoveValueChanged(token);
                match other {
                    Err(e) => Err(e),
                    Ok(status) => Err(LinkError::Platform(format!(
                        "notification subscription rejected: {status:?}"
                    ))),
                }
            }
        }
    }

    async fn unregister_callback(&self, channel: ChannelId) {
        let Some(token) = self.subscriptions().remove(&channel) else {
            return;
        };
        let Ok(characteristic) = self.characteristic(channel) else {
            return;
        };
        let _ = characteristic.RemoveValueChanged(token);
        if self.connection_state() != LinkState::Connected {
            return;
        }
        if let Ok(operation) = characteristic.WriteClientCharacteristicConfigurationDescriptorAsync(
            GattClientCharacteristicConfigurationDescriptorValue::None,
        ) {
            if let Err(e) = operation.await {
                debug!(%channel, "Failed to disable notifications: {}", e.message());
            }
        }
    }

    fn negotiated_mtu(&self) -> u32 {
        self.mtu.load(Ordering::SeqCst)
    }
}

impl Drop for WinRtLink {
    fn drop(&mut self) {
        for (channel, token) in self.subscriptions().drain() {
            if let Some(characteristic) = self.characteristics.get(&channel) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        let _ = self.session.RemoveMaxPduSizeChanged(self.pdu_token);
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        let _ = self.session.Close();
        let _ = self.device.Close();
        info!("Watch link closed");
    }
}
