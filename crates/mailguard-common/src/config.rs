//! Configuration for MailGuard

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Prefix for environment variable overrides, e.g. `MAILGUARD__REDIS__HOST`
pub const ENV_PREFIX: &str = "MAILGUARD";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Managed chain configuration
    #[serde(default)]
    pub netfilter: NetfilterConfig,

    /// Ban escalation policy
    #[serde(default)]
    pub bans: BanConfig,

    /// Persisted store and event bus
    #[serde(default)]
    pub redis: RedisConfig,

    /// Source NAT targets
    #[serde(default)]
    pub snat: SnatConfig,

    /// Isolation rule for the internal bridge
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// Background task cadence
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Managed chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetfilterConfig {
    /// Name of the dedicated chain
    #[serde(default = "default_chain_name")]
    pub chain_name: String,

    /// Comment tagging every rule this service owns
    #[serde(default = "default_chain_comment")]
    pub chain_comment: String,

    /// Track bans without touching the kernel ruleset
    #[serde(default)]
    pub manage_external: bool,

    /// Internal IPv4 network (SNAT source)
    #[serde(default = "default_ipv4_network")]
    pub ipv4_network: Ipv4Net,

    /// Internal IPv6 network (SNAT source)
    #[serde(default = "default_ipv6_network")]
    pub ipv6_network: Ipv6Net,
}

impl Default for NetfilterConfig {
    fn default() -> Self {
        Self {
            chain_name: default_chain_name(),
            chain_comment: default_chain_comment(),
            manage_external: false,
            ipv4_network: default_ipv4_network(),
            ipv6_network: default_ipv6_network(),
        }
    }
}

fn default_chain_name() -> String {
    "MAIL".to_string()
}

fn default_chain_comment() -> String {
    "mail".to_string()
}

fn default_ipv4_network() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(172, 22, 1, 0), 24).unwrap_or_default()
}

fn default_ipv6_network() -> Ipv6Net {
    Ipv6Net::new(Ipv6Addr::new(0xfd4d, 0x6169, 0x6c63, 0x6f77, 0, 0, 0, 0), 64)
        .unwrap_or_default()
}

/// Ban escalation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanConfig {
    /// Base ban duration in seconds
    #[serde(default = "default_ban_time")]
    pub ban_time: u64,

    /// Upper bound for escalated bans in seconds
    #[serde(default = "default_max_ban_time")]
    pub max_ban_time: u64,

    /// Double the ban duration for each prior ban
    #[serde(default = "default_true")]
    pub ban_time_increment: bool,

    /// Failures within the retry window before a ban
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry window in seconds
    #[serde(default = "default_retry_window")]
    pub retry_window: u64,

    /// Prefix length IPv4 offenders are widened to
    #[serde(default = "default_netban_ipv4")]
    pub netban_ipv4: u8,

    /// Prefix length IPv6 offenders are widened to
    #[serde(default = "default_netban_ipv6")]
    pub netban_ipv6: u8,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            ban_time: default_ban_time(),
            max_ban_time: default_max_ban_time(),
            ban_time_increment: true,
            max_attempts: default_max_attempts(),
            retry_window: default_retry_window(),
            netban_ipv4: default_netban_ipv4(),
            netban_ipv6: default_netban_ipv6(),
        }
    }
}

fn default_ban_time() -> u64 {
    1800
}

fn default_max_ban_time() -> u64 {
    10000
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_window() -> u64 {
    600
}

fn default_netban_ipv4() -> u8 {
    32
}

fn default_netban_ipv6() -> u8 {
    128
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis password
    pub password: Option<String>,

    /// Database index
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL for the redis client
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn default_redis_host() -> String {
    "172.22.1.249".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

/// Source NAT targets; a family without a target is not reconciled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnatConfig {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Isolation rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Install the isolation rule at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Trusted bridge interface
    #[serde(default = "default_isolation_interface")]
    pub interface: String,

    /// TCP ports only reachable through the trusted interface
    #[serde(default = "default_isolation_ports")]
    pub ports: Vec<u16>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: default_isolation_interface(),
            ports: default_isolation_ports(),
        }
    }
}

fn default_isolation_interface() -> String {
    "br-mail".to_string()
}

fn default_isolation_ports() -> Vec<u16> {
    vec![6379]
}

/// Background task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Event bus channel carrying log lines
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Chain order verification interval in seconds
    #[serde(default = "default_short_interval")]
    pub chain_order_interval_secs: u64,

    /// SNAT reconciliation interval in seconds
    #[serde(default = "default_short_interval")]
    pub snat_interval_secs: u64,

    /// Ban expiry interval in seconds
    #[serde(default = "default_short_interval")]
    pub autopurge_interval_secs: u64,

    /// Blacklist and whitelist refresh interval in seconds
    #[serde(default = "default_list_refresh_interval")]
    pub list_refresh_interval_secs: u64,

    /// DNS lookup timeout in seconds
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            chain_order_interval_secs: default_short_interval(),
            snat_interval_secs: default_short_interval(),
            autopurge_interval_secs: default_short_interval(),
            list_refresh_interval_secs: default_list_refresh_interval(),
            dns_timeout_secs: default_dns_timeout(),
        }
    }
}

fn default_channel() -> String {
    "F2B_CHANNEL".to_string()
}

fn default_short_interval() -> u64 {
    10
}

fn default_list_refresh_interval() -> u64 {
    60
}

fn default_dns_timeout() -> u64 {
    3
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, overridden by environment
    pub fn load_from(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(crate::Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first default location found
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mailguard.toml"),
            PathBuf::from("/etc/mailguard/mailguard.toml"),
        ];

        let path = paths.iter().find(|p| p.exists());
        Self::load_from(path.map(PathBuf::as_path))
    }

    /// Reject values the ban engine cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.bans.netban_ipv4 > 32 {
            return Err(crate::Error::Config(format!(
                "bans.netban_ipv4 must be at most 32, got {}",
                self.bans.netban_ipv4
            )));
        }
        if self.bans.netban_ipv6 > 128 {
            return Err(crate::Error::Config(format!(
                "bans.netban_ipv6 must be at most 128, got {}",
                self.bans.netban_ipv6
            )));
        }
        if self.bans.max_attempts == 0 {
            return Err(crate::Error::Config(
                "bans.max_attempts must be positive".to_string(),
            ));
        }

        let intervals = [
            ("chain_order_interval_secs", self.service.chain_order_interval_secs),
            ("snat_interval_secs", self.service.snat_interval_secs),
            ("autopurge_interval_secs", self.service.autopurge_interval_secs),
            ("list_refresh_interval_secs", self.service.list_refresh_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(crate::Error::Config(format!(
                    "service.{} must be positive",
                    name
                )));
            }
        }

        Ok(())
    }
}
