//! Watch Services
//!
//! One service per logical channel group. The set is closed: the registry
//! dispatches over [`Service`] by `match`.
//!
//! ## Lifecycle
//!
//! ```text
//!   register ──► (link Connected) ──► handler() wired ──► sync()
//!                                                          │
//!   (link Disconnected / fatal failure) ◄── unsync() ◄─────┘
//! ```
//!
//! Services are cheap handles over shared state; callers keep a clone to push
//! data (media info, forecasts, capture requests) while the registry owns
//! the lifecycle.

pub mod framing;
pub mod media;
pub mod notification;
pub mod registry;
pub mod screenshot;
pub mod time;
pub mod tunnel;
pub mod weather;

use crate::domain::channels::{Channel, ChannelId};
use crate::domain::models::{AppEvent, ServiceKind};
use crate::infrastructure::backend::BackendError;
use crate::infrastructure::link::{ChannelCallback, DeviceLink, LinkError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use media::MediaService;
pub use notification::NotificationService;
pub use registry::ServiceRegistry;
pub use screenshot::ScreenshotService;
pub use time::TimeService;
pub use tunnel::TunnelBridge;
pub use weather::WeatherService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("sink failed: {0}")]
    Sink(String),
}

/// A fatal condition reported by a running service.
#[derive(Debug, Clone)]
pub struct ServiceFailure {
    pub service: ServiceKind,
    pub generation: u64,
    pub reason: String,
}

/// Handed to every service on `sync()`.
#[derive(Clone)]
pub struct SyncContext {
    pub link: Arc<dyn DeviceLink>,
    pub generation: u64,
    failures: mpsc::UnboundedSender<ServiceFailure>,
}

impl SyncContext {
    pub fn new(
        link: Arc<dyn DeviceLink>,
        generation: u64,
        failures: mpsc::UnboundedSender<ServiceFailure>,
    ) -> Self {
        Self {
            link,
            generation,
            failures,
        }
    }

    /// Ask the registry to tear `service` down.
    pub fn report_failure(&self, service: ServiceKind, reason: impl Into<String>) {
        let _ = self.failures.send(ServiceFailure {
            service,
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

pub(crate) fn emit(events: &mpsc::UnboundedSender<AppEvent>, event: AppEvent) {
    let _ = events.send(event);
}

pub enum Service {
    Notification(NotificationService),
    Weather(WeatherService),
    Media(MediaService),
    Time(TimeService),
    Screenshot(ScreenshotService),
    Tunnel(TunnelBridge),
}

impl Service {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Notification(_) => ServiceKind::Notification,
            Self::Weather(_) => ServiceKind::Weather,
            Self::Media(_) => ServiceKind::Media,
            Self::Time(_) => ServiceKind::Time,
            Self::Screenshot(_) => ServiceKind::Screenshot,
            Self::Tunnel(_) => ServiceKind::Tunnel,
        }
    }

    pub fn channels(&self) -> &'static [Channel] {
        match self {
            Self::Notification(_) => NotificationService::channels(),
            Self::Weather(_) => WeatherService::channels(),
            Self::Media(_) => MediaService::channels(),
            Self::Time(_) => TimeService::channels(),
            Self::Screenshot(_) => ScreenshotService::channels(),
            Self::Tunnel(_) => TunnelBridge::channels(),
        }
    }

    /// Callback for an inbound channel of this service.
    pub fn handler(&self, channel: ChannelId) -> Option<ChannelCallback> {
        match self {
            Self::Notification(s) => s.handler(channel),
            Self::Weather(_) => None,
            Self::Media(s) => s.handler(channel),
            Self::Time(_) => None,
            Self::Screenshot(s) => s.handler(channel),
            Self::Tunnel(s) => s.handler(channel),
        }
    }

    pub async fn sync(&mut self, ctx: &SyncContext) -> Result<(), ServiceError> {
        match self {
            Self::Notification(s) => s.sync(ctx).await,
            Self::Weather(s) => s.sync(ctx).await,
            Self::Media(s) => s.sync(ctx).await,
            Self::Time(s) => s.sync(ctx).await,
            Self::Screenshot(s) => s.sync(ctx).await,
            Self::Tunnel(s) => s.sync(ctx).await,
        }
    }

    /// Idempotent; safe even when `sync()` never ran or failed.
    pub async fn unsync(&mut self) {
        match self {
            Self::Notification(s) => s.unsync(),
            Self::Weather(s) => s.unsync(),
            Self::Media(s) => s.unsync(),
            Self::Time(s) => s.unsync(),
            Self::Screenshot(s) => s.unsync(),
            Self::Tunnel(s) => s.unsync().await,
        }
    }
}

impl From<NotificationService> for Service {
    fn from(service: NotificationService) -> Self {
        Self::Notification(service)
    }
}

impl From<WeatherService> for Service {
    fn from(service: WeatherService) -> Self {
        Self::Weather(service)
    }
}

impl From<MediaService> for Service {
    fn from(service: MediaService) -> Self {
        Self::Media(service)
    }
}

impl From<TimeService> for Service {
    fn from(service: TimeService) -> Self {
        Self::Time(service)
    }
}

impl From<ScreenshotService> for Service {
    fn from(service: ScreenshotService) -> Self {
        Self::Screenshot(service)
    }
}

impl From<TunnelBridge> for Service {
    fn from(service: TunnelBridge) -> Self {
        Self::Tunnel(service)
    }
}
