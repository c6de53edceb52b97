use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "watch_sync".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Network tunnel backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default = "default_false")]
    pub enabled: bool,
    /// Network-emulation executable spawned once per bridge.
    #[serde(default = "default_backend_program")]
    pub backend_program: String,
    /// Arguments; `{socket}` is replaced by the socket path.
    #[serde(default = "default_backend_args")]
    pub backend_args: Vec<String>,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            backend_program: default_backend_program(),
            backend_args: default_backend_args(),
            socket_path: default_socket_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

fn default_backend_program() -> String {
    "slirp-helper".to_string()
}
fn default_backend_args() -> Vec<String> {
    vec!["--socket".to_string(), "{socket}".to_string()]
}
fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("watch_sync_tunnel.sock")
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_frame_len() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Link Settings
    #[serde(default)]
    pub device_address: Option<u64>,
    /// MTU assumed until the platform reports the negotiated one.
    #[serde(default = "default_mtu")]
    pub default_mtu: u32,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    // Service Settings
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            device_address: None,
            default_mtu: default_mtu(),
            write_timeout_ms: default_write_timeout_ms(),
            screenshot_dir: default_screenshot_dir(),
            tunnel: TunnelSettings::default(),
        }
    }
}

fn default_mtu() -> u32 {
    23
}
fn default_write_timeout_ms() -> u64 {
    3000
}
fn default_screenshot_dir() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("WatchSync")
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the default location, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("WatchSync");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Write the settings back as pretty JSON.
    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Store `address` as the device to reconnect to and save.
    pub fn remember_device(&mut self, address: u64) -> anyhow::Result<()> {
        if self.settings.device_address != Some(address) {
            self.settings.device_address = Some(address);
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "tunnel": { "enabled": true } }"#).unwrap();
        assert!(settings.tunnel.enabled);
        assert_eq!(settings.tunnel.max_frame_len, 64 * 1024);
        assert_eq!(settings.default_mtu, 23);
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.device_address.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "watch_sync_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().default_mtu = 185;
        service.remember_device(0xAABBCCDDEEFF).unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().default_mtu, 185);
        assert_eq!(reloaded.get().device_address, Some(0xAABBCCDDEEFF));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let service = SettingsService::from_path(PathBuf::from("/nonexistent/watch_sync.json"));
        assert_eq!(service.get().write_timeout_ms, 3000);
    }
}
