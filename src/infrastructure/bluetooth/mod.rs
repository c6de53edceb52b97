//! Bluetooth Module (Windows)
//!
//! [`WinRtLink`] implements [`DeviceLink`](crate::infrastructure::link::DeviceLink)
//! on top of the WinRT GATT client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  WinRtLink                    │
//! │  send / callbacks / state watch / MTU         │
//! └──────────────┬───────────────────────────────┘
//!                │
//!         ┌──────┴───────┐
//!         ▼              ▼
//! ┌──────────────┐ ┌────────────┐
//! │  Connection  │ │  Protocol  │
//! │ - session    │ │ - GUIDs    │
//! │ - channel    │ │ - buffers  │
//! │   discovery  │ │ - MTU      │
//! └──────────────┘ └────────────┘
//! ```
//!
//! Scanning and pairing are left to the OS; the device is opened by address.

pub mod connection;
pub mod link;
pub mod protocol;

pub use link::{LinkOptions, WinRtLink};
