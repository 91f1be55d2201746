//! Configuration management for edgevpn

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{EdgeError, EdgeResult};
use crate::lease::Pool;
use crate::validation;

/// Main edgevpn configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub ssl: SslSection,
    pub network: NetworkSection,
    pub system: SystemSection,
    pub daemon: DaemonSection,
    pub intervals: IntervalSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the daemon callback surface binds to
    pub callback_listen: SocketAddr,
    /// TCP/UDP port ocserv listens on
    pub vpn_port: u16,
    /// SQLite database path
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SslSection {
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Daemon-wide IPv4 network (CIDR)
    pub ip_pool: String,
    pub dns: Vec<String>,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    pub max_clients: u32,
    /// Seconds without activity before a session is evicted
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// VPN daemon executable
    pub binary: String,
    /// Arguments; `{config}` is replaced by the generated config path
    pub args: Vec<String>,
    /// Control tool used for `show users`, `show status` and `disconnect`
    pub control_binary: String,
    pub config_dir: PathBuf,
    pub credential_file: PathBuf,
    pub run_dir: PathBuf,
    pub chroot_dir: PathBuf,
    pub domain: String,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalSection {
    pub poll_secs: u64,
    pub reap_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            callback_listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
            vpn_port: 443,
            db_path: PathBuf::from("/var/lib/edgevpn/edgevpn.db"),
        }
    }
}

impl Default for SslSection {
    fn default() -> Self {
        Self {
            server_cert: PathBuf::from("/etc/edgevpn/server.crt"),
            server_key: PathBuf::from("/etc/edgevpn/server.key"),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            ip_pool: "192.168.100.0/24".to_string(),
            dns: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            mtu: 1400,
        }
    }
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            max_clients: 100,
            idle_timeout: 3600,
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            binary: "ocserv".to_string(),
            args: vec!["-f".to_string(), "-c".to_string(), "{config}".to_string()],
            control_binary: "occtl".to_string(),
            config_dir: PathBuf::from("/etc/edgevpn/ocserv"),
            credential_file: PathBuf::from("/run/ocserv/ocpasswd"),
            run_dir: PathBuf::from("/run/ocserv"),
            chroot_dir: PathBuf::from("/var/lib/ocserv"),
            domain: "edge-vpn.local".to_string(),
            device: "vpns".to_string(),
        }
    }
}

impl Default for IntervalSection {
    fn default() -> Self {
        Self {
            poll_secs: 10,
            reap_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> EdgeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EdgeError::Config(format!("Failed to read config: {}", e)))?;

        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| EdgeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> EdgeResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!("Config file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> EdgeResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EdgeError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| EdgeError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> EdgeResult<()> {
        Pool::parse(&self.network.ip_pool)
            .map_err(|e| EdgeError::Config(format!("network.ip_pool: {}", e)))?;

        validation::validate_mtu(self.network.mtu)
            .map_err(|e| EdgeError::Config(format!("network.mtu: {}", e)))?;

        for dns in &self.network.dns {
            validation::validate_ip_address(dns)
                .map_err(|e| EdgeError::Config(format!("network.dns: {}", e)))?;
        }

        if self.system.idle_timeout == 0 {
            return Err(EdgeError::Config(
                "system.idle_timeout must be greater than 0".to_string(),
            ));
        }

        if self.intervals.poll_secs == 0 || self.intervals.reap_secs == 0 {
            return Err(EdgeError::Config(
                "intervals must be greater than 0".to_string(),
            ));
        }

        if self.daemon.binary.is_empty() || self.daemon.control_binary.is_empty() {
            return Err(EdgeError::Config(
                "daemon.binary and daemon.control_binary are required".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply overrides stored in the `system_config` table.
    ///
    /// Invalid values are skipped with a warning so a bad row never replaces
    /// a working file setting.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        if let Some(pool) = overrides.get("default_ip_pool") {
            if Pool::parse(pool).is_ok() {
                self.network.ip_pool = pool.clone();
            } else {
                warn!("Ignoring invalid default_ip_pool override: {}", pool);
            }
        }

        let dns1 = overrides.get("default_dns1").filter(|v| !v.is_empty());
        let dns2 = overrides.get("default_dns2").filter(|v| !v.is_empty());
        if let (Some(dns1), Some(dns2)) = (dns1, dns2) {
            match (validation::validate_ip_address(dns1), validation::validate_ip_address(dns2)) {
                (Ok(_), Ok(_)) => self.network.dns = vec![dns1.clone(), dns2.clone()],
                _ => warn!("Ignoring invalid DNS override: {}, {}", dns1, dns2),
            }
        }

        if let Some(mtu) = positive::<u32>(overrides, "default_mtu") {
            match validation::validate_mtu(mtu) {
                Ok(()) => self.network.mtu = mtu,
                Err(e) => warn!("Ignoring default_mtu override {}: {}", mtu, e),
            }
        }
        if let Some(max_clients) = positive::<u32>(overrides, "max_clients") {
            self.system.max_clients = max_clients;
        }
        if let Some(idle_timeout) = positive::<u64>(overrides, "idle_timeout") {
            self.system.idle_timeout = idle_timeout;
        }

        info!(
            "Effective settings: pool={}, dns={:?}, mtu={}, max_clients={}, idle_timeout={}s",
            self.network.ip_pool,
            self.network.dns,
            self.network.mtu,
            self.system.max_clients,
            self.system.idle_timeout
        );
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> EdgeResult<()> {
        let mut dirs = vec![
            self.daemon.config_dir.clone(),
            self.daemon.run_dir.clone(),
            self.daemon.chroot_dir.clone(),
        ];
        if let Some(parent) = self.server.db_path.parent() {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs.iter().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| EdgeError::Config(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}

fn positive<T>(overrides: &HashMap<String, String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    overrides
        .get(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [network]
            ip_pool = "10.10.0.0/16"

            [system]
            idle_timeout = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.network.ip_pool, "10.10.0.0/16");
        assert_eq!(config.network.mtu, 1400);
        assert_eq!(config.system.idle_timeout, 600);
        assert_eq!(config.system.max_clients, 100);
        assert_eq!(config.daemon.binary, "ocserv");
        assert_eq!(config.intervals.poll_secs, 10);
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let mut config = ServerConfig::default();
        config.network.ip_pool = "not-a-cidr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let mut config = ServerConfig::default();
        config.system.idle_timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = ServerConfig::default();
        let overrides: HashMap<String, String> = [
            ("default_ip_pool", "10.8.0.0/24"),
            ("default_dns1", "1.1.1.1"),
            ("default_dns2", "1.0.0.1"),
            ("default_mtu", "1300"),
            ("max_clients", "0"),
            ("idle_timeout", "garbage"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_overrides(&overrides);

        assert_eq!(config.network.ip_pool, "10.8.0.0/24");
        assert_eq!(config.network.dns, vec!["1.1.1.1", "1.0.0.1"]);
        assert_eq!(config.network.mtu, 1300);
        assert_eq!(config.system.max_clients, 100);
        assert_eq!(config.system.idle_timeout, 3600);
    }

    #[test]
    fn test_invalid_pool_override_ignored() {
        let mut config = ServerConfig::default();
        let overrides = HashMap::from([("default_ip_pool".to_string(), "fe80::/64".to_string())]);
        config.apply_overrides(&overrides);
        assert_eq!(config.network.ip_pool, "192.168.100.0/24");
    }

    #[test]
    fn test_out_of_range_overrides_ignored() {
        let mut config = ServerConfig::default();
        let overrides: HashMap<String, String> = [
            ("default_mtu", "20000"),
            ("default_dns1", "not-an-ip"),
            ("default_dns2", "8.8.4.4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_overrides(&overrides);

        assert_eq!(config.network.mtu, 1400);
        assert_eq!(config.network.dns, vec!["8.8.8.8", "8.8.4.4"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgevpn.toml");

        let mut config = ServerConfig::default();
        config.server.vpn_port = 8443;
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(&path).unwrap();
        assert_eq!(loaded.server.vpn_port, 8443);
    }
}
