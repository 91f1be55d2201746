//! Input validation and sanitization
//!
//! Usernames end up as control-tool arguments and as lines in the daemon's
//! credential file; config values end up in the generated daemon config.

use crate::error::{EdgeError, EdgeResult};
use std::net::IpAddr;

/// Maximum username length accepted from the daemon or the store
const MAX_USERNAME_LEN: usize = 64;

/// Maximum length for configuration values
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for error messages shown to callers
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Validate a VPN username
///
/// Rejects anything that could split a `username:hash` credential line or be
/// read as an option by the control tool.
pub fn validate_username(name: &str) -> EdgeResult<()> {
    if name.is_empty() {
        return Err(EdgeError::InvalidParameter(
            "Username cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_USERNAME_LEN {
        return Err(EdgeError::InvalidParameter(
            format!("Username too long (max {} characters)", MAX_USERNAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.' | '@') {
            return Err(EdgeError::InvalidParameter(
                format!("Invalid username '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    if name.starts_with('-') {
        return Err(EdgeError::InvalidParameter(
            "Username cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate IP address
pub fn validate_ip_address(addr: &str) -> EdgeResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| EdgeError::InvalidParameter(
            format!("Invalid IP address: {}", addr)
        ))
}

/// Validate MTU value
pub fn validate_mtu(mtu: u32) -> EdgeResult<()> {
    if mtu < 68 {
        return Err(EdgeError::InvalidParameter(
            "MTU must be at least 68 bytes".to_string()
        ));
    }
    if mtu > 9000 {
        return Err(EdgeError::InvalidParameter(
            "MTU cannot exceed 9000 bytes".to_string()
        ));
    }
    Ok(())
}

/// Sanitize configuration values to prevent directive injection
pub fn sanitize_config_value(value: &str) -> EdgeResult<String> {
    if value.chars().any(|c| c.is_control()) {
        return Err(EdgeError::InvalidParameter(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(EdgeError::InvalidParameter(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Truncate subprocess stderr before it is surfaced in an error
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bob.smith").is_ok());
        assert!(validate_username("carol@corp").is_ok());
        assert!(validate_username("dave_01").is_ok());

        // Would break the credential file or the control tool
        assert!(validate_username("eve:hash").is_err());
        assert!(validate_username("mallory\nroot").is_err());
        assert!(validate_username("alice; reboot").is_err());
        assert!(validate_username("--all").is_err());
        assert!(validate_username("").is_err());
        assert!(validate_username(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_ip_validation() {
        assert!(validate_ip_address("8.8.8.8").is_ok());
        assert!(validate_ip_address("2001:4860:4860::8888").is_ok());
        assert!(validate_ip_address("8.8.8").is_err());
        assert!(validate_ip_address("dns.google").is_err());
    }

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(1400).is_ok());
        assert!(validate_mtu(67).is_err());
        assert!(validate_mtu(9001).is_err());
    }

    #[test]
    fn test_sanitize_config_value() {
        assert_eq!(sanitize_config_value("/etc/ssl/server.crt").unwrap(), "/etc/ssl/server.crt");
        assert!(sanitize_config_value("server.crt\nauth = \"plain\"").is_err());
        assert!(sanitize_config_value(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_sanitize_error_message() {
        let long = "e".repeat(600);
        let sanitized = sanitize_error_message(&long);
        assert!(sanitized.ends_with("... (truncated)"));
        assert!(sanitized.len() < 600);
        assert_eq!(sanitize_error_message("  boom \n"), "boom");
    }
}
