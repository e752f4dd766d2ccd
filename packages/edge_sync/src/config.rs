use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [reconnect]
//                    rotation_min_mins = 90
//
//   env var:         EDGE_SYNC_RECONNECT__ROTATION_MIN_MINS=90
//                    (double underscore = nesting)

pub const DEFAULT_EDGE_URL: &str = "wss://edge-chat.messenger.com/chat";
pub const DEFAULT_BOOTSTRAP_URL: &str = "https://www.facebook.com/api/graphqlbatch/";
pub const DEFAULT_REFRESH_URL: &str = "https://www.facebook.com/";
pub const DEFAULT_BOOTSTRAP_DOC_ID: &str = "3336396659757871";
pub const DEFAULT_APP_ID: &str = "219994525426954";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub edge: EdgeFileConfig,
    #[serde(default)]
    pub bootstrap: BootstrapFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub presence: PresenceFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Streaming endpoint tunables (`[edge]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeFileConfig {
    #[serde(default = "default_edge_url")]
    pub url: String,
    /// Region hint appended to the endpoint query string.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Advertise the account as online when the connection opens.
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for EdgeFileConfig {
    fn default() -> Self {
        Self {
            url: default_edge_url(),
            region: None,
            app_id: default_app_id(),
            user_agent: default_user_agent(),
            online: true,
            keepalive_secs: default_keepalive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Sequence bootstrap tunables (`[bootstrap]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapFileConfig {
    #[serde(default = "default_bootstrap_url")]
    pub url: String,
    #[serde(default = "default_bootstrap_doc_id")]
    pub doc_id: String,
}

impl Default for BootstrapFileConfig {
    fn default() -> Self {
        Self {
            url: default_bootstrap_url(),
            doc_id: default_bootstrap_doc_id(),
        }
    }
}

/// Reconnect, rotation and health-check tunables (`[reconnect]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_rotation_min_mins")]
    pub rotation_min_mins: u64,
    #[serde(default = "default_rotation_max_mins")]
    pub rotation_max_mins: u64,
    /// How often to look for a silent connection (0 = disabled).
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            delay_ms: default_reconnect_delay_ms(),
            max_delay_secs: default_max_reconnect_delay_secs(),
            rotation_min_mins: default_rotation_min_mins(),
            rotation_max_mins: default_rotation_max_mins(),
            health_check_secs: default_health_check_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Presence heartbeat tunables (`[presence]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceFileConfig {
    #[serde(default = "default_true")]
    pub broadcast: bool,
    #[serde(default = "default_presence_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PresenceFileConfig {
    fn default() -> Self {
        Self {
            broadcast: true,
            interval_secs: default_presence_interval_secs(),
        }
    }
}

/// Cookie and form token refresh tunables (`[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_refresh_url")]
    pub refresh_url: String,
    /// Minutes between refreshes (0 = disabled).
    #[serde(default = "default_refresh_mins")]
    pub refresh_mins: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            refresh_url: default_refresh_url(),
            refresh_mins: default_refresh_mins(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_edge_url() -> String {
    DEFAULT_EDGE_URL.to_string()
}
fn default_app_id() -> String {
    DEFAULT_APP_ID.to_string()
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_keepalive_secs() -> u16 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    60
}
fn default_bootstrap_url() -> String {
    DEFAULT_BOOTSTRAP_URL.to_string()
}
fn default_bootstrap_doc_id() -> String {
    DEFAULT_BOOTSTRAP_DOC_ID.to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_max_reconnect_delay_secs() -> u64 {
    60
}
fn default_rotation_min_mins() -> u64 {
    120
}
fn default_rotation_max_mins() -> u64 {
    240
}
fn default_health_check_secs() -> u64 {
    60
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_presence_interval_secs() -> u64 {
    50
}
fn default_refresh_url() -> String {
    DEFAULT_REFRESH_URL.to_string()
}
fn default_refresh_mins() -> u64 {
    20
}

/// Build a figment that layers: defaults → config.toml → EDGE_SYNC_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `EDGE_SYNC_EDGE__REGION=prn`  →  `edge.region = "prn"`
///   `EDGE_SYNC_PRESENCE__BROADCAST=false`  →  `presence.broadcast = false`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("EDGE_SYNC_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used by the client)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub edge: EdgeConfig,
    pub bootstrap: BootstrapConfig,
    pub reconnect: ReconnectConfig,
    pub presence: PresenceConfig,
    /// `None` disables the periodic session refresh.
    pub refresh: Option<RefreshConfig>,
}

#[derive(Clone, Debug)]
pub struct EdgeConfig {
    pub url: String,
    pub region: Option<String>,
    pub app_id: String,
    pub user_agent: String,
    pub online: bool,
    /// Zero disables MQTT pings.
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub url: String,
    pub doc_id: String,
}

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    /// Delay before the first reactive reconnect attempt.
    pub delay: Duration,
    /// Upper bound on the backoff between failed attempts.
    pub max_delay: Duration,
    pub rotation_min: Duration,
    pub rotation_max: Duration,
    /// `None` disables the stale-connection check.
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub stale_after: Duration,
}

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub broadcast: bool,
    pub interval: Duration,
}

#[derive(Clone, Debug)]
pub struct RefreshConfig {
    pub url: String,
    pub interval: Duration,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        // Zero would make the rotation timer fire back to back
        let rotation_min = Duration::from_secs(fc.reconnect.rotation_min_mins.max(1) * 60);
        let rotation_max =
            Duration::from_secs(fc.reconnect.rotation_max_mins * 60).max(rotation_min);
        let delay = Duration::from_millis(fc.reconnect.delay_ms);

        Self {
            edge: EdgeConfig {
                url: fc.edge.url.clone(),
                region: fc
                    .edge
                    .region
                    .as_ref()
                    .filter(|r| !r.is_empty())
                    .map(|r| r.to_lowercase()),
                app_id: fc.edge.app_id.clone(),
                user_agent: fc.edge.user_agent.clone(),
                online: fc.edge.online,
                keepalive: Duration::from_secs(fc.edge.keepalive_secs as u64),
                connect_timeout: Duration::from_secs(fc.edge.connect_timeout_secs),
            },
            bootstrap: BootstrapConfig {
                url: fc.bootstrap.url.clone(),
                doc_id: fc.bootstrap.doc_id.clone(),
            },
            reconnect: ReconnectConfig {
                auto_reconnect: fc.reconnect.auto_reconnect,
                delay,
                max_delay: Duration::from_secs(fc.reconnect.max_delay_secs).max(delay),
                rotation_min,
                rotation_max,
                health_check: if fc.reconnect.health_check_secs == 0 {
                    None
                } else {
                    Some(HealthCheckConfig {
                        interval: Duration::from_secs(fc.reconnect.health_check_secs),
                        stale_after: Duration::from_secs(fc.reconnect.stale_after_secs),
                    })
                },
            },
            presence: PresenceConfig {
                broadcast: fc.presence.broadcast,
                interval: Duration::from_secs(fc.presence.interval_secs.max(1)),
            },
            refresh: (fc.session.refresh_mins > 0).then(|| RefreshConfig {
                url: fc.session.refresh_url.clone(),
                interval: Duration::from_secs(fc.session.refresh_mins * 60),
            }),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

// =============================================================================
// Directory layout, derived from --data-dir rather than figment
// =============================================================================

#[derive(Clone, Debug)]
pub struct EdgeSyncConfig {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl EdgeSyncConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".edgesync"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, logs_dir })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// Default location of the exported session cookies.
    pub fn appstate_path(&self) -> PathBuf {
        self.data_dir.join("appstate.json")
    }

    /// Where the listener persists the sync cursor between runs.
    pub fn cursor_path(&self) -> PathBuf {
        self.state_dir().join("cursor.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_edge_file_config_defaults() {
        let d = EdgeFileConfig::default();
        assert_eq!(d.url, DEFAULT_EDGE_URL);
        assert!(d.region.is_none());
        assert!(d.online);
        assert_eq!(d.keepalive_secs, 60);
        assert_eq!(d.connect_timeout_secs, 60);
    }

    #[test]
    fn test_reconnect_file_config_defaults() {
        let d = ReconnectFileConfig::default();
        assert!(d.auto_reconnect);
        assert_eq!(d.delay_ms, 5000);
        assert_eq!(d.rotation_min_mins, 120);
        assert_eq!(d.rotation_max_mins, 240);
        assert_eq!(d.health_check_secs, 60);
        assert_eq!(d.stale_after_secs, 300);
    }

    // ── ClientConfig::from_file ─────────────────────────────────────────

    #[test]
    fn test_client_config_from_defaults() {
        let cc = ClientConfig::default();
        assert_eq!(cc.edge.keepalive, Duration::from_secs(60));
        assert_eq!(cc.reconnect.rotation_min, Duration::from_secs(2 * 3600));
        assert_eq!(cc.reconnect.rotation_max, Duration::from_secs(4 * 3600));
        assert_eq!(cc.presence.interval, Duration::from_secs(50));
        let hc = cc.reconnect.health_check.unwrap();
        assert_eq!(hc.stale_after, Duration::from_secs(300));
    }

    #[test]
    fn test_health_check_zero_disables() {
        let fc = FileConfig {
            reconnect: ReconnectFileConfig {
                health_check_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ClientConfig::from_file(&fc).reconnect.health_check.is_none());
    }

    #[test]
    fn test_inverted_rotation_window_collapses() {
        let fc = FileConfig {
            reconnect: ReconnectFileConfig {
                rotation_min_mins: 30,
                rotation_max_mins: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let cc = ClientConfig::from_file(&fc);
        assert_eq!(cc.reconnect.rotation_min, Duration::from_secs(1800));
        assert_eq!(cc.reconnect.rotation_max, Duration::from_secs(1800));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let fc = FileConfig {
            reconnect: ReconnectFileConfig {
                rotation_min_mins: 0,
                rotation_max_mins: 0,
                ..Default::default()
            },
            presence: PresenceFileConfig {
                broadcast: true,
                interval_secs: 0,
            },
            edge: EdgeFileConfig {
                keepalive_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let cc = ClientConfig::from_file(&fc);
        assert_eq!(cc.reconnect.rotation_min, Duration::from_secs(60));
        assert_eq!(cc.reconnect.rotation_max, Duration::from_secs(60));
        assert_eq!(cc.presence.interval, Duration::from_secs(1));
        // keepalive 0 is the MQTT "no pings" value and passes through
        assert!(cc.edge.keepalive.is_zero());
    }

    #[test]
    fn test_session_refresh_defaults_and_disable() {
        let cc = ClientConfig::default();
        let refresh = cc.refresh.unwrap();
        assert_eq!(refresh.url, DEFAULT_REFRESH_URL);
        assert_eq!(refresh.interval, Duration::from_secs(20 * 60));

        let mut fc = FileConfig::default();
        fc.session.refresh_mins = 0;
        assert!(ClientConfig::from_file(&fc).refresh.is_none());
    }

    #[test]
    fn test_region_is_lowercased_and_empty_dropped() {
        let mut fc = FileConfig::default();
        fc.edge.region = Some("PRN".to_string());
        assert_eq!(
            ClientConfig::from_file(&fc).edge.region.as_deref(),
            Some("prn")
        );
        fc.edge.region = Some(String::new());
        assert!(ClientConfig::from_file(&fc).edge.region.is_none());
    }

    // ── EdgeSyncConfig ──────────────────────────────────────────────────

    #[test]
    fn test_edge_sync_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EdgeSyncConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(config.data_dir, tmp.path());
        assert_eq!(config.logs_dir, tmp.path().join("logs"));
        assert!(tmp.path().join("logs").exists());
        assert!(tmp.path().join("state").exists());
        assert_eq!(config.appstate_path(), tmp.path().join("appstate.json"));
        assert_eq!(config.cursor_path(), tmp.path().join("state/cursor.json"));
        assert_eq!(config.config_toml_path(), tmp.path().join("config.toml"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.edge.url, DEFAULT_EDGE_URL);
        assert!(fc.presence.broadcast);
        assert_eq!(fc.bootstrap.doc_id, DEFAULT_BOOTSTRAP_DOC_ID);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[edge]\nregion = \"ATN\"\n\n[presence]\nbroadcast = false\ninterval_secs = 20\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.edge.region.as_deref(), Some("ATN"));
        assert!(!fc.presence.broadcast);
        assert_eq!(fc.presence.interval_secs, 20);
        assert_eq!(fc.session.refresh_mins, 20);
        // untouched sections keep their defaults
        assert_eq!(fc.reconnect.rotation_max_mins, 240);
    }
}
