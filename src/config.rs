use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::rcon::ServerEndpoint;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub rcon: RconConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub update: Option<UpdateConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub display_name: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    pub server_port: Option<u16>,
    pub query_port: Option<u16>,
}

impl InstanceConfig {
    /// Port currently configured for a firewall-relevant option.
    pub fn configured_port(&self, option: &str) -> Option<u16> {
        match option {
            "Server Port" => self.server_port,
            "Query Port" => self.query_port,
            _ => None,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RconConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rcon_host")]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_rcon_timeout")]
    pub timeout_secs: u64,
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_rcon_host(),
            port: None,
            password: String::new(),
            timeout_secs: default_rcon_timeout(),
        }
    }
}

impl std::fmt::Debug for RconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl RconConfig {
    /// The console is only usable with the flag set, a port and a password.
    pub fn is_api_enabled(&self) -> bool {
        self.enabled && self.port.is_some() && !self.password.is_empty()
    }

    pub fn endpoint(&self) -> Option<ServerEndpoint> {
        self.port.map(|port| ServerEndpoint {
            host: self.host.clone(),
            port,
            password: self.password.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Operator-facing texts. `{instance}` is replaced with the display name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub instance_started: String,
    pub instance_stopping: String,
    pub warning_5_minutes: String,
    pub warning_4_minutes: String,
    pub warning_3_minutes: String,
    pub warning_2_minutes: String,
    pub warning_1_minute: String,
    pub warning_30_seconds: String,
    pub warning_now: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            instance_started: ":green_circle: {instance} has started".to_string(),
            instance_stopping: ":red_circle: {instance} is shutting down".to_string(),
            warning_5_minutes: "Server is shutting down in 5 minutes".to_string(),
            warning_4_minutes: "Server is shutting down in 4 minutes".to_string(),
            warning_3_minutes: "Server is shutting down in 3 minutes".to_string(),
            warning_2_minutes: "Server is shutting down in 2 minutes".to_string(),
            warning_1_minute: "Server is shutting down in 1 minute".to_string(),
            warning_30_seconds: "Server is shutting down in 30 seconds!".to_string(),
            warning_now: "Server is shutting down NOW!".to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct NotificationsConfig {
    pub discord_webhook_url: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            discord_webhook_url: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

impl std::fmt::Debug for NotificationsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationsConfig")
            .field(
                "discord_webhook_url",
                &self.discord_webhook_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    pub version_url: String,
    pub links_url: String,
    #[serde(default = "default_artifact_type")]
    pub artifact_type: String,
    pub install_dir: PathBuf,
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    #[serde(default = "default_version_file")]
    pub version_file: String,
    #[serde(default = "default_update_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        Self::from_toml(&content)
    }

    /// An explicit `--config` path must load; without one, fall back to
    /// `./config.toml`, then `/opt/warden-agent/config.toml`, then the environment.
    pub fn load(explicit: Option<&str>) -> Result<Self, String> {
        if let Some(path) = explicit {
            return Self::from_file(path).map_err(|e| format!("{}: {}", path, e));
        }
        Self::from_file("./config.toml")
            .or_else(|_| Self::from_file("/opt/warden-agent/config.toml"))
            .or_else(|_| Self::from_env())
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        let port = |name: &str| -> Result<Option<u16>, String> {
            match std::env::var(name) {
                Ok(v) if !v.trim().is_empty() => v
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|e| format!("{} is not a port: {}", name, e)),
                _ => Ok(None),
            }
        };

        Ok(Self {
            instance: InstanceConfig {
                display_name: std::env::var("INSTANCE_NAME")
                    .map_err(|_| "INSTANCE_NAME not set".to_string())?,
                description: std::env::var("INSTANCE_DESCRIPTION")
                    .unwrap_or_else(|_| default_description()),
                max_players: std::env::var("MAX_PLAYERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_max_players),
                server_port: port("SERVER_PORT")?,
                query_port: port("QUERY_PORT")?,
            },
            rcon: RconConfig {
                enabled: std::env::var("RCON_ENABLED")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false),
                host: std::env::var("RCON_HOST").unwrap_or_else(|_| default_rcon_host()),
                port: port("RCON_PORT")?,
                password: std::env::var("RCON_PASSWORD").unwrap_or_default(),
                timeout_secs: default_rcon_timeout(),
            },
            messages: MessagesConfig::default(),
            notifications: NotificationsConfig {
                discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
                timeout_secs: default_http_timeout(),
            },
            update: match (
                std::env::var("UPDATE_VERSION_URL"),
                std::env::var("UPDATE_LINKS_URL"),
            ) {
                (Ok(version_url), Ok(links_url)) => Some(UpdateConfig {
                    version_url,
                    links_url,
                    artifact_type: default_artifact_type(),
                    install_dir: PathBuf::from(
                        std::env::var("INSTALL_DIR")
                            .unwrap_or_else(|_| "/var/lib/warden/AppFiles".to_string()),
                    ),
                    binary_name: default_binary_name(),
                    version_file: default_version_file(),
                    timeout_secs: default_update_timeout(),
                }),
                _ => None,
            },
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}

fn default_description() -> String {
    "Minecraft Java Edition".to_string()
}

fn default_max_players() -> u32 {
    20
}

fn default_rcon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rcon_timeout() -> u64 {
    5
}

fn default_http_timeout() -> u64 {
    10
}

fn default_artifact_type() -> String {
    "serverJar".to_string()
}

fn default_binary_name() -> String {
    "server.jar".to_string()
}

fn default_version_file() -> String {
    ".installed-version".to_string()
}

fn default_update_timeout() -> u64 {
    300
}
