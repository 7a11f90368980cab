//! Host identity reported to the registry

use std::net::UdpSocket;

use crate::Config;

/// Hostname of this machine, `unknown` when it cannot be read
#[must_use]
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Address of the interface holding the default route
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// source address.
#[must_use]
pub fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.ip().to_string())
}

/// Address to announce: configured value first, then the default route
#[must_use]
pub fn announce_ip(config: &Config) -> String {
    config
        .server
        .announce_ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(local_ip)
}

/// Application name to report, falling back to the hostname
#[must_use]
pub fn app_name(config: &Config) -> String {
    if config.app.name.is_empty() {
        hostname()
    } else {
        config.app.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_ip_prefers_configured_value() {
        let mut config = Config::default();
        config.server.announce_ip = Some("10.1.2.3".to_string());
        assert_eq!(announce_ip(&config), "10.1.2.3");
    }

    #[test]
    fn test_announce_ip_ignores_empty_value() {
        let mut config = Config::default();
        config.server.announce_ip = Some(String::new());
        assert!(announce_ip(&config).parse::<std::net::IpAddr>().is_ok());
    }

    #[test]
    fn test_app_name_fallback() {
        let mut config = Config::default();
        assert_eq!(app_name(&config), hostname());

        config.app.name = "gateway".to_string();
        assert_eq!(app_name(&config), "gateway");
    }
}
