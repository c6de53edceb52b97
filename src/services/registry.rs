//! Service Registry
//!
//! Owns the service set and drives `sync()` / `unsync()` from link state.
//! Everything runs on one task ([`ServiceRegistry::run`]); services never
//! call back into the registry except through the failure queue carried by
//! their [`SyncContext`].

use super::{emit, Service, ServiceFailure, SyncContext};
use crate::domain::channels::{ChannelId, Direction};
use crate::domain::models::{AppEvent, LinkState, MessageSeverity, ServiceKind, StatusMessage};
use crate::infrastructure::link::DeviceLink;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel {channel} is claimed by both {existing} and {new}")]
    DuplicateChannel {
        channel: ChannelId,
        existing: ServiceKind,
        new: ServiceKind,
    },
}

pub struct ServiceRegistry {
    link: Arc<dyn DeviceLink>,
    services: Vec<Service>,
    channel_map: HashMap<ChannelId, usize>,
    events: mpsc::UnboundedSender<AppEvent>,
    failures_tx: mpsc::UnboundedSender<ServiceFailure>,
    failures_rx: mpsc::UnboundedReceiver<ServiceFailure>,
    generation: u64,
    synced: bool,
}

impl ServiceRegistry {
    /// An empty registry over `link`.
    pub fn new(link: Arc<dyn DeviceLink>, events: mpsc::UnboundedSender<AppEvent>) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            link,
            services: Vec::new(),
            channel_map: HashMap::new(),
            events,
            failures_tx,
            failures_rx,
            generation: 0,
            synced: false,
        }
    }

    /// Add a service. Sync order is registration order.
    pub fn register(&mut self, service: impl Into<Service>) -> Result<(), RegistryError> {
        let service = service.into();
        for channel in service.channels() {
            if let Some(&owner) = self.channel_map.get(&channel.id) {
                return Err(RegistryError::DuplicateChannel {
                    channel: channel.id,
                    existing: self.services[owner].kind(),
                    new: service.kind(),
                });
            }
        }

        let index = self.services.len();
        for channel in service.channels() {
            self.channel_map.insert(channel.id, index);
        }
        debug!(service = %service.kind(), "Service registered");
        self.services.push(service);
        Ok(())
    }

    /// Incremented on every `sync_all`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Service that claimed `channel`, if any.
    pub fn service_owning(&self, channel: ChannelId) -> Option<ServiceKind> {
        self.channel_map
            .get(&channel)
            .map(|&index| self.services[index].kind())
    }

    /// Sync on connect, unsync on disconnect.
    pub async fn handle_link_state(&mut self, state: LinkState) {
        emit(&self.events, AppEvent::LinkState(state));
        match state {
            LinkState::Connected => self.sync_all().await,
            LinkState::Disconnected => {
                if self.synced {
                    info!("Link lost, tearing services down");
                    self.unsync_all().await;
                }
            }
            LinkState::Connecting => info!("Link connecting"),
        }
    }

    /// Wire inbound callbacks and sync every service. A service that fails
    /// to sync is reported and skipped.
    pub async fn sync_all(&mut self) {
        if self.synced {
            self.unsync_all().await;
        }
        self.generation += 1;
        info!(generation = self.generation, "Syncing {} services", self.services.len());

        for service in &self.services {
            for channel in service.channels() {
                if channel.direction != Direction::FromDevice {
                    continue;
                }
                let Some(callback) = service.handler(channel.id) else {
                    continue;
                };
                if let Err(e) = self.link.register_callback(channel.id, callback).await {
                    warn!("Failed to subscribe to {}: {}", channel.name, e);
                }
            }
        }

        let ctx = SyncContext::new(
            self.link.clone(),
            self.generation,
            self.failures_tx.clone(),
        );
        let mut failed = 0;
        for service in &mut self.services {
            let kind = service.kind();
            match service.sync(&ctx).await {
                Ok(()) => info!(service = %kind, "Service synced"),
                Err(e) => {
                    failed += 1;
                    error!(service = %kind, "Service failed to sync: {}", e);
                    emit(
                        &self.events,
                        AppEvent::ServiceFailed {
                            service: kind,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
        self.synced = true;

        let (message, severity) = if failed == 0 {
            ("Watch synced".to_string(), MessageSeverity::Success)
        } else {
            (
                format!("Watch synced, {failed} service(s) failed"),
                MessageSeverity::Warning,
            )
        };
        emit(
            &self.events,
            AppEvent::LogMessage(StatusMessage { message, severity }),
        );
    }

    /// Unsync every service, then drop all inbound callbacks.
    pub async fn unsync_all(&mut self) {
        for service in &mut self.services {
            service.unsync().await;
        }
        for service in &self.services {
            unregister_inbound(self.link.as_ref(), service).await;
        }
        self.synced = false;
        debug!(generation = self.generation, "All services unsynced");
    }

    /// Tear down the one service that reported a fatal error.
    pub async fn handle_failure(&mut self, failure: ServiceFailure) {
        if !self.synced || failure.generation != self.generation {
            debug!(
                service = %failure.service,
                generation = failure.generation,
                "Ignoring failure from a previous session"
            );
            return;
        }

        let Some(service) = self
            .services
            .iter_mut()
            .find(|s| s.kind() == failure.service)
        else {
            return;
        };
        warn!(service = %failure.service, "Service failed: {}", failure.reason);
        service.unsync().await;
        unregister_inbound(self.link.as_ref(), service).await;
        emit(
            &self.events,
            AppEvent::ServiceFailed {
                service: failure.service,
                reason: failure.reason,
            },
        );
    }

    /// Follow the link until `shutdown` resolves or the link goes away.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut states = self.link.watch_state();
        let initial = *states.borrow_and_update();
        self.handle_link_state(initial).await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Registry shutting down");
                    break;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        warn!("Link state source closed");
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.handle_link_state(state).await;
                }
                Some(failure) = self.failures_rx.recv() => self.handle_failure(failure).await,
            }
        }

        if self.synced {
            self.unsync_all().await;
        }
    }
}

async fn unregister_inbound(link: &dyn DeviceLink, service: &Service) {
    for channel in service.channels() {
        if channel.direction == Direction::FromDevice {
            link.unregister_callback(channel.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channels::{
        MEDIA_COMMANDS, NOTIFICATION_FEEDBACK, SCREENSHOT_CONTENT, TIME_SET,
    };
    use crate::domain::fragmentation::Fragmenter;
    use crate::infrastructure::link::memory::MemoryLink;
    use crate::infrastructure::link::LinkError;
    use crate::services::screenshot::{CapturePhase, ScreenshotSink};
    use crate::services::{
        MediaService, NotificationService, ScreenshotService, TimeService, WeatherService,
    };
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct CountingSink {
        calls: Arc<Mutex<usize>>,
    }

    impl ScreenshotSink for CountingSink {
        fn store(&self, _image: &[u8]) -> anyhow::Result<PathBuf> {
            *self.calls.lock().unwrap() += 1;
            Ok(PathBuf::from("shot.jpg"))
        }
    }

    struct Fixture {
        link: Arc<MemoryLink>,
        registry: ServiceRegistry,
        screenshot: ScreenshotService,
        sink: CountingSink,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn fixture() -> Fixture {
        let link = Arc::new(MemoryLink::new(23));
        let (tx, events) = mpsc::unbounded_channel();
        let sink = CountingSink::default();
        let screenshot = ScreenshotService::new(Box::new(sink.clone()), tx.clone());

        let mut registry = ServiceRegistry::new(link.clone(), tx.clone());
        registry.register(NotificationService::new(tx.clone())).unwrap();
        registry.register(WeatherService::new()).unwrap();
        registry.register(MediaService::new(tx.clone())).unwrap();
        registry.register(TimeService::new()).unwrap();
        registry.register(screenshot.clone()).unwrap();

        Fixture {
            link,
            registry,
            screenshot,
            sink,
            events,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_duplicate_channel_is_rejected() {
        let mut f = fixture();
        assert_eq!(
            f.registry.register(TimeService::new()),
            Err(RegistryError::DuplicateChannel {
                channel: TIME_SET.id,
                existing: ServiceKind::Time,
                new: ServiceKind::Time,
            })
        );
        assert_eq!(
            f.registry.service_owning(MEDIA_COMMANDS.id),
            Some(ServiceKind::Media)
        );
    }

    #[tokio::test]
    async fn test_connect_wires_callbacks_and_syncs() {
        let mut f = fixture();
        f.link.set_state(LinkState::Connected);
        f.registry.handle_link_state(LinkState::Connected).await;

        assert!(f.registry.is_synced());
        assert_eq!(f.registry.generation(), 1);
        assert!(f.link.has_callback(MEDIA_COMMANDS.id));
        assert!(f.link.has_callback(NOTIFICATION_FEEDBACK.id));
        assert!(f.link.has_callback(SCREENSHOT_CONTENT.id));
        assert_eq!(f.link.writes_on(TIME_SET.id).len(), 1);

        f.registry.handle_link_state(LinkState::Disconnected).await;
        assert!(!f.registry.is_synced());
        assert!(!f.link.has_callback(MEDIA_COMMANDS.id));
        assert!(!f.link.has_callback(SCREENSHOT_CONTENT.id));
    }

    #[tokio::test]
    async fn test_failed_sync_does_not_stop_others() {
        let mut f = fixture();
        f.link.set_state(LinkState::Connected);
        // Notification, weather and media have nothing to push; time is the
        // first service to write.
        f.link.fail_next_send(LinkError::Timeout);
        f.registry.handle_link_state(LinkState::Connected).await;

        let failed: Vec<_> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::ServiceFailed { service, .. } => Some(service),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![ServiceKind::Time]);
        assert!(f.registry.is_synced());
        assert!(f.link.has_callback(SCREENSHOT_CONTENT.id));
    }

    #[tokio::test]
    async fn test_link_drop_mid_screenshot_discards_transfer() {
        let mut f = fixture();
        f.link.set_state(LinkState::Connected);
        f.registry.handle_link_state(LinkState::Connected).await;

        let mut watch = Fragmenter::for_mtu(23);
        for message in [10_000u32.to_le_bytes().to_vec(), vec![0u8; 4096]] {
            for fragment in watch.encode(&message) {
                assert!(f.link.deliver(SCREENSHOT_CONTENT.id, &fragment));
            }
        }
        assert_eq!(
            f.screenshot.phase(),
            CapturePhase::Receiving {
                received: 4096,
                total: 10_000
            }
        );

        f.link.set_state(LinkState::Disconnected);
        f.registry.handle_link_state(LinkState::Disconnected).await;
        assert!(!f.link.deliver(SCREENSHOT_CONTENT.id, &[0u8; 5904]));

        f.link.set_state(LinkState::Connected);
        f.registry.handle_link_state(LinkState::Connected).await;
        assert_eq!(f.screenshot.phase(), CapturePhase::Idle);
        assert_eq!(*f.sink.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_unsyncs_only_that_service() {
        let mut f = fixture();
        f.link.set_state(LinkState::Connected);
        f.registry.handle_link_state(LinkState::Connected).await;
        drain(&mut f.events);

        f.registry
            .handle_failure(ServiceFailure {
                service: ServiceKind::Media,
                generation: f.registry.generation() - 1,
                reason: "stale".into(),
            })
            .await;
        assert!(f.link.has_callback(MEDIA_COMMANDS.id));
        assert!(drain(&mut f.events).is_empty());

        f.registry
            .handle_failure(ServiceFailure {
                service: ServiceKind::Media,
                generation: f.registry.generation(),
                reason: "broken".into(),
            })
            .await;
        assert!(!f.link.has_callback(MEDIA_COMMANDS.id));
        assert!(f.link.has_callback(NOTIFICATION_FEEDBACK.id));
        assert!(matches!(
            drain(&mut f.events).as_slice(),
            [AppEvent::ServiceFailed {
                service: ServiceKind::Media,
                ..
            }]
        ));

        // The next connection brings it back.
        f.registry.handle_link_state(LinkState::Connected).await;
        assert!(f.link.has_callback(MEDIA_COMMANDS.id));
        assert_eq!(f.registry.generation(), 2);
    }

    #[tokio::test]
    async fn test_run_follows_link_state() {
        let f = fixture();
        let link = f.link.clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(f.registry.run(async move {
            let _ = stop_rx.await;
        }));

        link.set_state(LinkState::Connected);
        assert!(link
            .wait_for_writes(TIME_SET.id, 1, Duration::from_secs(2))
            .await
            .is_some());

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!link.has_callback(MEDIA_COMMANDS.id));
    }
}

#[cfg(all(test, unix))]
mod tunnel_tests {
    use super::*;
    use crate::domain::channels::TUNNEL_INCOMING;
    use crate::infrastructure::backend::BackendConfig;
    use crate::infrastructure::link::memory::MemoryLink;
    use crate::services::TunnelBridge;
    use interprocess::local_socket::tokio::prelude::*;
    use interprocess::local_socket::{GenericFilePath, ListenerOptions};
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<AppEvent>,
        wanted: impl Fn(&AppEvent) -> bool,
    ) -> Vec<AppEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("event source open");
            let done = wanted(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_tunnel_failure_then_reconnect_restarts_it() {
        let path = std::env::temp_dir().join(format!(
            "watch_sync_registry_{}.sock",
            std::process::id()
        ));
        let name = path.as_path().to_fs_name::<GenericFilePath>().unwrap();
        let listener = ListenerOptions::new().name(name).create_tokio().unwrap();
        let acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(stream) = listener.accept().await {
                held.push(stream);
            }
        });

        let link = Arc::new(MemoryLink::new(23));
        let (tx, mut events) = mpsc::unbounded_channel();
        let config = BackendConfig {
            program: "sleep".to_string(),
            args: vec!["1".to_string()],
            socket_path: path,
            connect_timeout: Duration::from_secs(2),
            max_frame_len: 4096,
        };
        let mut registry = ServiceRegistry::new(link.clone(), tx.clone());
        registry.register(TunnelBridge::new(config, tx)).unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let script = async {
            link.set_state(LinkState::Connected);
            wait_for(&mut events, |e| matches!(e, AppEvent::TunnelUp)).await;

            // The backend exits on its own; the registry tears the bridge down.
            let seen = wait_for(&mut events, |e| {
                matches!(
                    e,
                    AppEvent::ServiceFailed {
                        service: ServiceKind::Tunnel,
                        ..
                    }
                )
            })
            .await;
            assert!(seen.iter().any(|e| matches!(e, AppEvent::TunnelDown)));
            assert!(!link.has_callback(TUNNEL_INCOMING.id));

            link.set_state(LinkState::Disconnected);
            wait_for(&mut events, |e| {
                matches!(e, AppEvent::LinkState(LinkState::Disconnected))
            })
            .await;
            link.set_state(LinkState::Connected);
            wait_for(&mut events, |e| matches!(e, AppEvent::TunnelUp)).await;
            assert!(link.has_callback(TUNNEL_INCOMING.id));

            stop_tx.send(()).unwrap();
        };
        tokio::join!(
            registry.run(async {
                let _ = stop_rx.await;
            }),
            script
        );
        acceptor.abort();
    }
}
