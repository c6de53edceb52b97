//! Device Link
//!
//! The single abstraction over the physical connection to the watch. The
//! platform BLE stack sits behind [`DeviceLink`]; everything above it only
//! sees channels, bytes and a connection state.
//!
//! ## Implementations
//!
//! - [`memory::MemoryLink`] - in-process link for tests and loopback use
//! - `bluetooth::WinRtLink` - Windows GATT client (Windows only)

pub mod memory;

use crate::domain::channels::{self, Channel, ChannelId, Direction};
use crate::domain::models::LinkState;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("write was not acknowledged in time")]
    Timeout,
    #[error("link dropped during the operation")]
    Disconnected,
    #[error("channel {0} does not accept writes from the phone")]
    InvalidDirection(ChannelId),
    #[error("channel {0} is not available on this device")]
    UnknownChannel(ChannelId),
    #[error("platform error: {0}")]
    Platform(String),
}

/// Receives every inbound notification of one channel, in wire order.
pub type ChannelCallback = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

#[async_trait]
pub trait DeviceLink: Send + Sync {
    fn connection_state(&self) -> LinkState;

    /// State-change events from the platform stack.
    fn watch_state(&self) -> watch::Receiver<LinkState>;

    /// Write `bytes` to `channel` with exactly one underlying write.
    /// Nothing is retried.
    async fn send(&self, channel: ChannelId, bytes: &[u8]) -> Result<(), LinkError>;

    async fn register_callback(
        &self,
        channel: ChannelId,
        callback: ChannelCallback,
    ) -> Result<(), LinkError>;

    async fn unregister_callback(&self, channel: ChannelId);

    /// Bytes allowed in one notification/write right now.
    fn negotiated_mtu(&self) -> u32;
}

/// Resolve `channel` and make sure the phone may write to it.
pub fn check_outbound(channel: ChannelId) -> Result<&'static Channel, LinkError> {
    let entry = channels::lookup(channel).ok_or(LinkError::UnknownChannel(channel))?;
    match entry.direction {
        Direction::ToDevice => Ok(entry),
        Direction::FromDevice => Err(LinkError::InvalidDirection(channel)),
    }
}

/// Resolve `channel` and make sure the watch notifies on it.
pub fn check_inbound(channel: ChannelId) -> Result<&'static Channel, LinkError> {
    let entry = channels::lookup(channel).ok_or(LinkError::UnknownChannel(channel))?;
    match entry.direction {
        Direction::FromDevice => Ok(entry),
        Direction::ToDevice => Err(LinkError::InvalidDirection(channel)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channels::{SCREENSHOT_CONTENT, SCREENSHOT_REQUEST};

    #[test]
    fn test_direction_checks() {
        assert!(check_outbound(SCREENSHOT_REQUEST.id).is_ok());
        assert_eq!(
            check_outbound(SCREENSHOT_CONTENT.id),
            Err(LinkError::InvalidDirection(SCREENSHOT_CONTENT.id))
        );
        assert!(check_inbound(SCREENSHOT_CONTENT.id).is_ok());
        let unknown = ChannelId::from_short(0x0001);
        assert_eq!(
            check_inbound(unknown),
            Err(LinkError::UnknownChannel(unknown))
        );
    }
}
