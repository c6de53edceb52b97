//! Companion-side transport for a BLE wearable: channel directory,
//! fragmentation codec, device link abstraction, service registry and the
//! services that ride on it (screenshots, network tunnel, clock, media,
//! weather, notifications).

pub mod domain;
pub mod infrastructure;
pub mod services;
