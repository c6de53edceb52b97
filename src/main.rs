use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use watch_sync_rust::domain::models::{AppEvent, MessageSeverity};
use watch_sync_rust::domain::settings::{Settings, SettingsService};
use watch_sync_rust::infrastructure::backend::BackendConfig;
use watch_sync_rust::infrastructure::link::DeviceLink;
use watch_sync_rust::infrastructure::logging;
use watch_sync_rust::services::screenshot::FileSink;
use watch_sync_rust::services::{
    MediaService, NotificationService, ScreenshotService, ServiceRegistry, TimeService,
    TunnelBridge, WeatherService,
};

/// Accepts `AA:BB:CC:DD:EE:FF`, `0xAABBCCDDEEFF` or bare hex.
fn parse_address(input: &str) -> anyhow::Result<u64> {
    let hex: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != ':')
        .collect();
    if hex.is_empty() || hex.len() > 12 {
        anyhow::bail!("Invalid Bluetooth address: {input}");
    }
    u64::from_str_radix(&hex, 16).with_context(|| format!("Invalid Bluetooth address: {input}"))
}

#[cfg(windows)]
async fn open_link(
    address: u64,
    settings: &Settings,
    events: mpsc::UnboundedSender<AppEvent>,
) -> anyhow::Result<Arc<dyn DeviceLink>> {
    use watch_sync_rust::infrastructure::bluetooth::{LinkOptions, WinRtLink};

    let options = LinkOptions {
        write_timeout: std::time::Duration::from_millis(settings.write_timeout_ms),
        fallback_mtu: settings.default_mtu,
    };
    let link = WinRtLink::open(address, options, events).await?;
    Ok(link)
}

#[cfg(not(windows))]
async fn open_link(
    _address: u64,
    _settings: &Settings,
    _events: mpsc::UnboundedSender<AppEvent>,
) -> anyhow::Result<Arc<dyn DeviceLink>> {
    anyhow::bail!("No BLE backend is compiled in for this platform")
}

fn log_event(event: AppEvent) {
    match event {
        AppEvent::LinkState(state) => info!("Link: {:?}", state),
        AppEvent::LogMessage(status) => match status.severity {
            MessageSeverity::Error => error!("{}", status.message),
            MessageSeverity::Warning => warn!("{}", status.message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", status.message),
        },
        AppEvent::ScreenshotProgress { received, total } => {
            tracing::debug!("Screenshot {}/{} bytes", received, total)
        }
        AppEvent::ScreenshotSaved(path) => info!("Screenshot saved: {}", path.display()),
        AppEvent::ScreenshotFailed(reason) => warn!("Screenshot failed: {}", reason),
        AppEvent::MediaCommand(command) => info!("Media command: {:?}", command),
        AppEvent::NotificationDismissed(id) => info!("Notification {} dismissed", id),
        AppEvent::TunnelUp => info!("Tunnel up"),
        AppEvent::TunnelDown => info!("Tunnel down"),
        AppEvent::ServiceFailed { service, reason } => error!("{} failed: {}", service, reason),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting WatchSync");
    info!("Settings: {}", settings_service.path().display());

    let address = match std::env::args().nth(1) {
        Some(arg) => {
            let address = parse_address(&arg)?;
            settings_service.remember_device(address)?;
            address
        }
        None => settings_service.get().device_address.context(
            "No watch address given; pass one as the first argument or set device_address",
        )?,
    };
    let settings = settings_service.get().clone();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(event);
        }
    });

    let link = open_link(address, &settings, events_tx.clone()).await?;

    let mut registry = ServiceRegistry::new(link, events_tx.clone());
    registry.register(NotificationService::new(events_tx.clone()))?;
    registry.register(WeatherService::new())?;
    registry.register(MediaService::new(events_tx.clone()))?;
    registry.register(TimeService::new())?;
    registry.register(ScreenshotService::new(
        Box::new(FileSink::new(&settings.screenshot_dir)),
        events_tx.clone(),
    ))?;
    if settings.tunnel.enabled {
        registry.register(TunnelBridge::new(
            BackendConfig::from(&settings.tunnel),
            events_tx.clone(),
        ))?;
    }
    drop(events_tx);

    registry
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;
    info!("WatchSync stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address("AA:BB:CC:DD:EE:FF").unwrap(), 0xAABBCCDDEEFF);
        assert_eq!(parse_address("0x1a2b3c").unwrap(), 0x1A2B3C);
        assert!(parse_address("").is_err());
        assert!(parse_address("zz").is_err());
        assert!(parse_address("11:22:33:44:55:66:77").is_err());
    }
}
