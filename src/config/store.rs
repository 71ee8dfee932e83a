use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::AppConfig;
use crate::error::{AppError, Result};
use crate::registry::{DeviceAlias, MacAddress};

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "AUDIO_ROUTER_CONFIG";

/// Default configuration path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/audio-router/router.conf";

/// Configuration path from the environment, else the default
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Configuration store backed by a `key=value` file
///
/// Uses `ArcSwap` for lock-free reads; workers read the config once per
/// attach while the supervisor reads it every cycle.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Changed key, or `*` when the whole config was replaced
    pub key: String,
}

impl ConfigStore {
    /// Load configuration; a missing file yields defaults
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let config = match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let config = parse_config(&text)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Configuration file {} not found, using defaults",
                    path.display()
                );
                AppConfig::default()
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// In-memory store (tests, `check-config`)
    pub fn from_config(path: impl Into<PathBuf>, config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: path.into(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set a single key, persist it, and notify subscribers
    ///
    /// Other lines of the file (comments, ordering) are preserved.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let mut config = (*self.get()).clone();
        if !apply_key(&mut config, key, value).map_err(|e| config_error(key, e))? {
            return Err(AppError::Config(format!("unknown key: {}", key)));
        }
        config.validate().map_err(AppError::Config)?;

        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(AppError::Io(e)),
        };
        self.write_file(&replace_key(&existing, key, value)).await?;

        self.cache.store(Arc::new(config));
        debug!("Config key {} set to {}", key, value);
        let _ = self.change_tx.send(ConfigChange {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Update configuration with a closure and rewrite the whole file
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        config.validate().map_err(AppError::Config)?;

        self.write_file(&render_config(&config)).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "*".to_string(),
        });
        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    async fn write_file(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn config_error(key: &str, reason: String) -> AppError {
    AppError::Config(format!("{}: {}", key, reason))
}

/// Parse `key=value` text on top of the defaults
///
/// Blank lines and `#` comments are ignored; unknown keys are warned about.
pub fn parse_config(text: &str) -> Result<AppConfig> {
    let mut config = AppConfig::default();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            AppError::Config(format!("line {}: expected key=value, got {:?}", index + 1, line))
        })?;
        let (key, value) = (key.trim(), value.trim());

        match apply_key(&mut config, key, value) {
            Ok(true) => {}
            Ok(false) => warn!("line {}: unknown configuration key {:?}", index + 1, key),
            Err(reason) => {
                return Err(AppError::Config(format!(
                    "line {}: {}: {}",
                    index + 1,
                    key,
                    reason
                )))
            }
        }
    }

    config.validate().map_err(AppError::Config)?;
    Ok(config)
}

fn num<T: std::str::FromStr>(value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("expected a number, got {:?}", value))
}

fn flag(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("expected a boolean, got {:?}", value)),
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Apply one key. Returns `Ok(false)` for an unknown key.
fn apply_key(config: &mut AppConfig, key: &str, value: &str) -> std::result::Result<bool, String> {
    let c = config;
    match key {
        "default_device" => c.devices.default_device = optional(value),
        "peer_address" => {
            c.devices.peer_address = match optional(value) {
                Some(v) => Some(v.parse::<MacAddress>().map_err(|e| e.to_string())?),
                None => None,
            }
        }
        "peer_mode" => c.devices.peer_mode = value.parse()?,
        "bt_ready_timeout_secs" => c.devices.bt_ready_timeout_secs = num(value)?,
        "peer_alias" => {
            c.devices.peer_alias = DeviceAlias::new(value).map_err(|e| e.to_string())?
        }
        "mapping_dir" => c.devices.mapping_dir = PathBuf::from(value),
        "holder_dir" => c.devices.holder_dir = PathBuf::from(value),
        "lock_file" => c.devices.lock_file = PathBuf::from(value),
        "bus_card" => c.bus.card = value.to_string(),
        "bus_mirror" => c.bus.mirror = flag(value)?,
        "bt_buffer_us" => c.latency.bt_buffer_us = num(value)?,
        "bt_period_us" => c.latency.bt_period_us = num(value)?,
        "hw_buffer_us" => c.latency.hw_buffer_us = num(value)?,
        "hw_period_us" => c.latency.hw_period_us = num(value)?,
        "attach_attempts" => c.attach.attempts = num(value)?,
        "attach_backoff_ms" => c.attach.backoff_ms = num(value)?,
        "acquire_timeout_ms" => c.attach.acquire_timeout_ms = num(value)?,
        "io_timeout_ms" => c.attach.io_timeout_ms = num(value)?,
        "stall_limit" => c.attach.stall_limit = num(value)?,
        "recycle_cooldown_ms" => c.attach.recycle_cooldown_ms = num(value)?,
        "recycle_budget" => c.attach.recycle_budget = num(value)?,
        "ingest_listen" => c.ingest.listen = value.to_string(),
        "ingest_frame_ms" => c.latency.ingest_frame_ms = num(value)?,
        "ingest_queue_cap" => c.ingest.queue_cap = num(value)?,
        "ingest_target_frames" => c.latency.ingest_target_frames = num(value)?,
        "ingest_hysteresis_frames" => c.latency.ingest_hysteresis_frames = num(value)?,
        "ingest_control_ms" => c.ingest.control_ms = num(value)?,
        "grace_secs" => c.supervisor.grace_secs = num(value)?,
        "poll_interval_secs" => c.supervisor.poll_interval_secs = num(value)?,
        "settle_secs" => c.supervisor.settle_secs = num(value)?,
        "max_restarts" => c.supervisor.max_restarts = num(value)?,
        "command_timeout_secs" => c.supervisor.command_timeout_secs = num(value)?,
        "stop_timeout_secs" => c.supervisor.stop_timeout_secs = num(value)?,
        "health_log" => c.supervisor.health_log = PathBuf::from(value),
        "health_log_max_bytes" => c.supervisor.health_log_max_bytes = num(value)?,
        "units" => {
            c.supervisor.units = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<std::result::Result<_, _>>()?
        }
        "bt_source_unit" => c.supervisor.bt_source_unit = optional(value),
        _ => return Ok(false),
    }
    Ok(true)
}

/// Render every key, in the same order `apply_key` lists them
pub fn render_config(config: &AppConfig) -> String {
    let d = &config.devices;
    let l = &config.latency;
    let a = &config.attach;
    let s = &config.supervisor;

    let units: Vec<String> = s.units.iter().map(ToString::to_string).collect();
    let pairs: Vec<(&str, String)> = vec![
        ("default_device", d.default_device.clone().unwrap_or_default()),
        (
            "peer_address",
            d.peer_address.map(|m| m.to_string()).unwrap_or_default(),
        ),
        ("peer_mode", d.peer_mode.to_string()),
        ("bt_ready_timeout_secs", d.bt_ready_timeout_secs.to_string()),
        ("peer_alias", d.peer_alias.to_string()),
        ("mapping_dir", d.mapping_dir.display().to_string()),
        ("holder_dir", d.holder_dir.display().to_string()),
        ("lock_file", d.lock_file.display().to_string()),
        ("bus_card", config.bus.card.clone()),
        ("bus_mirror", config.bus.mirror.to_string()),
        ("bt_buffer_us", l.bt_buffer_us.to_string()),
        ("bt_period_us", l.bt_period_us.to_string()),
        ("hw_buffer_us", l.hw_buffer_us.to_string()),
        ("hw_period_us", l.hw_period_us.to_string()),
        ("attach_attempts", a.attempts.to_string()),
        ("attach_backoff_ms", a.backoff_ms.to_string()),
        ("acquire_timeout_ms", a.acquire_timeout_ms.to_string()),
        ("io_timeout_ms", a.io_timeout_ms.to_string()),
        ("stall_limit", a.stall_limit.to_string()),
        ("recycle_cooldown_ms", a.recycle_cooldown_ms.to_string()),
        ("recycle_budget", a.recycle_budget.to_string()),
        ("ingest_listen", config.ingest.listen.clone()),
        ("ingest_frame_ms", l.ingest_frame_ms.to_string()),
        ("ingest_queue_cap", config.ingest.queue_cap.to_string()),
        ("ingest_target_frames", l.ingest_target_frames.to_string()),
        ("ingest_hysteresis_frames", l.ingest_hysteresis_frames.to_string()),
        ("ingest_control_ms", config.ingest.control_ms.to_string()),
        ("grace_secs", s.grace_secs.to_string()),
        ("poll_interval_secs", s.poll_interval_secs.to_string()),
        ("settle_secs", s.settle_secs.to_string()),
        ("max_restarts", s.max_restarts.to_string()),
        ("command_timeout_secs", s.command_timeout_secs.to_string()),
        ("stop_timeout_secs", s.stop_timeout_secs.to_string()),
        ("health_log", s.health_log.display().to_string()),
        ("health_log_max_bytes", s.health_log_max_bytes.to_string()),
        ("units", units.join(",")),
        ("bt_source_unit", s.bt_source_unit.clone().unwrap_or_default()),
    ];

    let mut out = String::from("# audio-router configuration\n");
    for (key, value) in pairs {
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
        out.push('\n');
    }
    out
}

/// Replace the first `key=` line in `text`, or append one
fn replace_key(text: &str, key: &str, value: &str) -> String {
    let mut replaced = false;
    let mut out: Vec<String> = text
        .lines()
        .map(|line| {
            let is_key = !replaced
                && line
                    .split_once('=')
                    .map(|(k, _)| k.trim() == key)
                    .unwrap_or(false)
                && !line.trim_start().starts_with('#');
            if is_key {
                replaced = true;
                format!("{}={}", key, value)
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        out.push(format!("{}={}", key, value));
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerMode, UnitSpec};
    use tempfile::tempdir;

    #[test]
    fn test_parse_overrides_and_defaults() {
        let text = "\
# comment
peer_address = aa:bb:cc:dd:ee:ff

hw_buffer_us=20000
units=systemd:bluealsa.service, bridge:BT_FOSI ,ingest
bogus_key=1
";
        let config = parse_config(text).unwrap();
        assert_eq!(
            config.devices.peer_address.unwrap().to_string(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(config.latency.hw_buffer_us, 20_000);
        assert_eq!(config.latency.hw_period_us, 2_500);
        assert_eq!(config.supervisor.units.len(), 3);
        assert_eq!(
            config.supervisor.units[0],
            UnitSpec::Systemd("bluealsa.service".into())
        );
    }

    #[test]
    fn test_malformed_values_are_config_errors() {
        assert!(matches!(
            parse_config("attach_attempts=three"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            parse_config("no equals sign"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            parse_config("peer_address=not-a-mac"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            parse_config("ingest_queue_cap=100"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            parse_config("peer_mode=sometimes"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_render_round_trips() {
        let mut config = AppConfig::default();
        config.devices.default_device = Some("hw:CARD=ICUSBAUDIO7D,DEV=0".into());
        config.bus.mirror = false;
        config.devices.peer_mode = PeerMode::Fixed;
        config.devices.bt_ready_timeout_secs = 5;
        assert_eq!(parse_config(&render_config(&config)).unwrap(), config);
    }

    #[test]
    fn test_replace_key_preserves_other_lines() {
        let text = "# peers\npeer_address=11:22:33:44:55:66\nbus_card=Loopback\n";
        let out = replace_key(text, "peer_address", "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            out,
            "# peers\npeer_address=AA:BB:CC:DD:EE:FF\nbus_card=Loopback\n"
        );
        assert!(replace_key("", "bus_mirror", "false").contains("bus_mirror=false"));
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("absent.conf")).await.unwrap();
        assert_eq!(*store.get(), AppConfig::default());
    }

    #[tokio::test]
    async fn test_set_value_persists_and_notifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("router.conf");
        tokio::fs::write(&path, "# keep me\nbus_card=Loopback\n")
            .await
            .unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        let mut changes = store.subscribe();

        store
            .set_value("peer_address", "AA:BB:CC:DD:EE:FF")
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "peer_address");
        assert!(store.get().devices.peer_address.is_some());

        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(
            reloaded.get().devices.peer_address,
            store.get().devices.peer_address
        );
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.starts_with("# keep me\n"));

        assert!(store.set_value("nope", "1").await.is_err());
    }
}
