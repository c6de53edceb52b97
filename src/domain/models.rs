use std::fmt;
use std::path::PathBuf;

/// Physical link state, driven by the platform BLE stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Notification,
    Weather,
    Media,
    Time,
    Screenshot,
    Tunnel,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Notification => "notification",
            Self::Weather => "weather",
            Self::Media => "media",
            Self::Time => "time",
            Self::Screenshot => "screenshot",
            Self::Tunnel => "tunnel",
        };
        f.write_str(name)
    }
}

/// Playback command sent by the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCommand {
    Previous,
    Next,
    Play,
    Pause,
    Volume(u8),
}

/// Everything the core reports to its collaborators (UI, toasts, logs).
#[derive(Debug, Clone)]
pub enum AppEvent {
    LinkState(LinkState),
    LogMessage(StatusMessage),
    ScreenshotProgress { received: u32, total: u32 },
    ScreenshotSaved(PathBuf),
    ScreenshotFailed(String),
    MediaCommand(MediaCommand),
    NotificationDismissed(u32),
    TunnelUp,
    TunnelDown,
    ServiceFailed { service: ServiceKind, reason: String },
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
