//! ocserv configuration generation
//!
//! Rendered from current policy on every start; nothing is cached.

use std::path::PathBuf;

use crate::config::ServerConfig;
use crate::error::{EdgeError, EdgeResult};
use crate::lease::Pool;
use crate::validation::{sanitize_config_value, validate_ip_address};

pub const CONFIG_FILE_NAME: &str = "ocserv.conf";
pub const PROFILE_FILE_NAME: &str = "profile.xml";

/// Values substituted into the daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfigParams {
    pub vpn_port: u16,
    pub max_clients: u32,
    pub idle_timeout: u64,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub ip_pool: String,
    pub dns: Vec<String>,
    pub mtu: u32,
    pub credential_file: PathBuf,
    pub run_dir: PathBuf,
    pub chroot_dir: PathBuf,
    pub device: String,
    pub domain: String,
    pub profile_path: PathBuf,
}

impl DaemonConfigParams {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            vpn_port: config.server.vpn_port,
            max_clients: config.system.max_clients,
            idle_timeout: config.system.idle_timeout,
            server_cert: config.ssl.server_cert.clone(),
            server_key: config.ssl.server_key.clone(),
            ip_pool: config.network.ip_pool.clone(),
            dns: config.network.dns.clone(),
            mtu: config.network.mtu,
            credential_file: config.daemon.credential_file.clone(),
            run_dir: config.daemon.run_dir.clone(),
            chroot_dir: config.daemon.chroot_dir.clone(),
            device: config.daemon.device.clone(),
            domain: config.daemon.domain.clone(),
            profile_path: config.daemon.config_dir.join(PROFILE_FILE_NAME),
        }
    }
}

fn path_value(path: &std::path::Path) -> EdgeResult<String> {
    sanitize_config_value(&path.to_string_lossy())
}

/// Render the daemon's configuration file.
pub fn generate_config(params: &DaemonConfigParams) -> EdgeResult<String> {
    let pool = Pool::parse(&params.ip_pool)?;
    let cert = path_value(&params.server_cert)?;
    let key = path_value(&params.server_key)?;
    let run_dir = path_value(&params.run_dir)?;

    let mut conf = String::new();

    conf.push_str("# ocserv configuration generated by edgevpnd; changes are overwritten\n\n");
    conf.push_str(&format!(
        "auth = \"plain[passwd={}]\"\n\n",
        path_value(&params.credential_file)?
    ));

    conf.push_str(&format!("tcp-port = {}\n", params.vpn_port));
    conf.push_str(&format!("udp-port = {}\n\n", params.vpn_port));

    conf.push_str("run-as-user = nobody\nrun-as-group = daemon\n\n");
    conf.push_str(&format!("socket-file = {}/ocserv-socket\n", run_dir));
    conf.push_str(&format!("chroot-dir = {}\n\n", path_value(&params.chroot_dir)?));

    conf.push_str(&format!("max-clients = {}\n", params.max_clients));
    conf.push_str("max-same-clients = 2\n\n");

    conf.push_str(&format!("server-cert = {}\n", cert));
    conf.push_str(&format!("server-key = {}\n", key));
    conf.push_str(&format!("ca-cert = {}\n\n", cert));

    conf.push_str("isolate-workers = true\n");
    conf.push_str("keepalive = 32400\ndpd = 90\nmobile-dpd = 1800\n");
    conf.push_str("switch-to-tcp-timeout = 25\n");
    conf.push_str("try-mtu-discovery = true\n");
    conf.push_str(&format!("mtu = {}\n", params.mtu));
    conf.push_str("cert-user-oid = 0.9.2342.19200300.100.1.1\n");
    conf.push_str("compression = true\nno-compress-limit = 256\n");
    conf.push_str(
        "tls-priorities = \"NORMAL:%SERVER_PRECEDENCE:%COMPAT:-RSA:-VERS-SSL3.0:-ARCFOUR-128\"\n\n",
    );

    conf.push_str("auth-timeout = 240\n");
    conf.push_str(&format!("idle-timeout = {}\n", params.idle_timeout));
    conf.push_str("mobile-idle-timeout = 2400\n");
    conf.push_str("min-reauth-time = 300\nmax-ban-score = 80\nban-reset-time = 1200\n");
    conf.push_str("cookie-timeout = 300\ndeny-roaming = false\n");
    conf.push_str("rekey-time = 172800\nrekey-method = ssl\n\n");

    conf.push_str("use-occtl = true\n");
    conf.push_str(&format!("pid-file = {}/ocserv.pid\n\n", run_dir));

    conf.push_str(&format!("device = {}\n", sanitize_config_value(&params.device)?));
    conf.push_str("predictable-ips = true\n");
    conf.push_str(&format!(
        "default-domain = {}\n\n",
        sanitize_config_value(&params.domain)?
    ));

    conf.push_str(&format!("ipv4-network = {}\n\n", pool));

    conf.push_str("tunnel-all-dns = true\n");
    for dns in &params.dns {
        let server = validate_ip_address(dns)
            .map_err(|_| EdgeError::Config(format!("invalid DNS server '{}'", dns)))?;
        conf.push_str(&format!("dns = {}\n", server));
    }

    conf.push_str("\nping-leases = false\n");
    conf.push_str("cisco-client-compat = true\ndtls-legacy = true\n\n");
    conf.push_str(&format!("user-profile = {}\n", path_value(&params.profile_path)?));

    Ok(conf)
}

/// AnyConnect client profile served alongside the configuration.
pub fn generate_profile() -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<AnyConnectProfile xmlns=\"http://schemas.xmlsoap.org/encoding/\">\n");
    xml.push_str("<ServerList>\n");
    xml.push_str("    <HostEntry>\n");
    xml.push_str("        <HostName>Edge VPN Server</HostName>\n");
    xml.push_str("        <HostAddress>%{HOSTNAME}</HostAddress>\n");
    xml.push_str("    </HostEntry>\n");
    xml.push_str("</ServerList>\n");
    xml.push_str("</AnyConnectProfile>\n");
    xml
}

/// Credential file body: one `username:hash` line per user.
pub fn generate_credentials<'a, I>(credentials: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    credentials
        .into_iter()
        .map(|(username, hash)| format!("{}:{}\n", username, hash))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DaemonConfigParams {
        DaemonConfigParams::from_config(&ServerConfig::default())
    }

    #[test]
    fn test_substitutions() {
        let mut params = params();
        params.vpn_port = 8443;
        params.max_clients = 16;
        params.idle_timeout = 900;
        params.ip_pool = "10.8.0.0/16".to_string();
        params.server_cert = PathBuf::from("/certs/a.crt");
        params.server_key = PathBuf::from("/certs/a.key");

        let conf = generate_config(&params).unwrap();
        assert!(conf.contains("tcp-port = 8443\n"));
        assert!(conf.contains("udp-port = 8443\n"));
        assert!(conf.contains("max-clients = 16\n"));
        assert!(conf.contains("idle-timeout = 900\n"));
        assert!(conf.contains("server-cert = /certs/a.crt\n"));
        assert!(conf.contains("server-key = /certs/a.key\n"));
        assert!(conf.contains("ipv4-network = 10.8.0.0/16\n"));
        assert!(conf.contains("auth = \"plain[passwd=/run/ocserv/ocpasswd]\""));
        assert!(conf.contains("user-profile = /etc/edgevpn/ocserv/profile.xml\n"));
    }

    #[test]
    fn test_one_dns_directive_per_server() {
        let mut params = params();
        params.dns = vec!["1.1.1.1".into(), "9.9.9.9".into(), "2606:4700::1111".into()];

        let conf = generate_config(&params).unwrap();
        let dns: Vec<_> = conf.lines().filter(|l| l.starts_with("dns = ")).collect();
        assert_eq!(dns, vec!["dns = 1.1.1.1", "dns = 9.9.9.9", "dns = 2606:4700::1111"]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut bad_pool = params();
        bad_pool.ip_pool = "nope".to_string();
        assert!(generate_config(&bad_pool).is_err());

        let mut bad_dns = params();
        bad_dns.dns = vec!["8.8.8.8\nauth = none".to_string()];
        assert!(generate_config(&bad_dns).is_err());

        let mut bad_domain = params();
        bad_domain.domain = "a\nb".to_string();
        assert!(generate_config(&bad_domain).is_err());
    }

    #[test]
    fn test_credentials_and_profile() {
        let body = generate_credentials([("alice", "$2b$10$abc"), ("bob", "$2b$10$def")]);
        assert_eq!(body, "alice:$2b$10$abc\nbob:$2b$10$def\n");
        assert_eq!(generate_credentials(std::iter::empty()), "");
        assert!(generate_profile().contains("<HostName>Edge VPN Server</HostName>"));
    }
}
