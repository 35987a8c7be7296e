use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub listen_port: u16,

    pub wg_port: u16,
    pub wg_interface: String,
    pub wg_ip_range: Ipv4Network,
    pub headscale_ip_range: Ipv4Network,
    /// Extra CIDRs the jail engine never blocks.
    pub ignore_networks: Vec<Ipv4Network>,
    /// Public address of this host, used by the self-protection check.
    pub server_ip: Option<IpAddr>,

    pub encryption_secret: String,
    pub ssl_domain: String,

    pub max_attempts: i64,
    pub max_traffic_logs: i64,
    pub jail_check_interval_sec: u64,
    pub traffic_monitor_interval_sec: u64,
    pub cleanup_interval_min: u64,
    pub dns_lookup_timeout_sec: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self, String> {
        let encryption_secret = std::env::var("ENCRYPTION_SECRET")
            .map_err(|_| "ENCRYPTION_SECRET must be set".to_string())?;
        if encryption_secret.len() < 16 {
            return Err("ENCRYPTION_SECRET must be at least 16 characters".to_string());
        }

        let wg_ip_range: Ipv4Network = std::env::var("WG_IP_RANGE")
            .unwrap_or_else(|_| "10.8.0.0/24".to_string())
            .parse()
            .map_err(|e| format!("invalid WG_IP_RANGE: {}", e))?;

        let headscale_ip_range: Ipv4Network = std::env::var("HEADSCALE_IP_RANGE")
            .unwrap_or_else(|_| "100.64.0.0/10".to_string())
            .parse()
            .map_err(|e| format!("invalid HEADSCALE_IP_RANGE: {}", e))?;

        let ignore_networks = match std::env::var("IGNORE_NETWORKS") {
            Ok(raw) => {
                let mut nets = Vec::new();
                for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let net: Ipv4Network = part
                        .parse()
                        .map_err(|e| format!("invalid IGNORE_NETWORKS entry {:?}: {}", part, e))?;
                    nets.push(net);
                }
                nets
            }
            Err(_) => Vec::new(),
        };

        let server_ip = std::env::var("SERVER_IP")
            .ok()
            .and_then(|v| v.parse::<IpAddr>().ok());

        Ok(Settings {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:/usr/local/wgadmin/wgadmin.db?mode=rwc".to_string()),
            listen_port: env_or("WGADMIN_PORT", 3000),
            wg_port: env_or("WG_PORT", 51820),
            wg_interface: std::env::var("WG_INTERFACE").unwrap_or_else(|_| "wg0".to_string()),
            wg_ip_range,
            headscale_ip_range,
            ignore_networks,
            server_ip,
            encryption_secret,
            ssl_domain: std::env::var("SSL_DOMAIN").unwrap_or_default(),
            max_attempts: env_or("MAX_ATTEMPTS", 5000),
            max_traffic_logs: env_or("MAX_TRAFFIC_LOGS", 10_000),
            jail_check_interval_sec: env_or("JAIL_CHECK_INTERVAL_SEC", 5),
            traffic_monitor_interval_sec: env_or("TRAFFIC_MONITOR_INTERVAL_SEC", 10),
            cleanup_interval_min: env_or("CLEANUP_INTERVAL_MIN", 5),
            dns_lookup_timeout_sec: env_or("DNS_LOOKUP_TIMEOUT_SEC", 2),
        })
    }

    /// Networks the jail engine must never escalate against: operator-supplied
    /// ignore list plus the VPN client ranges.
    pub fn protected_networks(&self) -> Vec<Ipv4Network> {
        let mut nets = self.ignore_networks.clone();
        nets.push(self.wg_ip_range);
        nets.push(self.headscale_ip_range);
        nets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            database_url: "sqlite::memory:".into(),
            listen_port: 3000,
            wg_port: 51820,
            wg_interface: "wg0".into(),
            wg_ip_range: "10.8.0.0/24".parse().unwrap(),
            headscale_ip_range: "100.64.0.0/10".parse().unwrap(),
            ignore_networks: vec!["192.168.1.0/24".parse().unwrap()],
            server_ip: Some("203.0.113.1".parse().unwrap()),
            encryption_secret: "0123456789abcdef0123456789abcdef".into(),
            ssl_domain: "vpn.example.com".into(),
            max_attempts: 5000,
            max_traffic_logs: 10_000,
            jail_check_interval_sec: 5,
            traffic_monitor_interval_sec: 10,
            cleanup_interval_min: 5,
            dns_lookup_timeout_sec: 2,
        }
    }

    #[test]
    fn protected_networks_include_vpn_ranges() {
        let s = base_settings();
        let nets = s.protected_networks();
        assert!(nets.contains(&"10.8.0.0/24".parse().unwrap()));
        assert!(nets.contains(&"100.64.0.0/10".parse().unwrap()));
        assert!(nets.contains(&"192.168.1.0/24".parse().unwrap()));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("WGADMIN_TEST_PORT", "not-a-number");
        assert_eq!(env_or::<u16>("WGADMIN_TEST_PORT", 7), 7);
        std::env::remove_var("WGADMIN_TEST_PORT");
    }
}

#[cfg(test)]
pub fn test_settings() -> Settings {
    Settings {
        database_url: "sqlite::memory:".into(),
        listen_port: 3000,
        wg_port: 51820,
        wg_interface: "wg0".into(),
        wg_ip_range: "10.8.0.0/24".parse().unwrap(),
        headscale_ip_range: "100.64.0.0/10".parse().unwrap(),
        ignore_networks: Vec::new(),
        server_ip: Some("203.0.113.1".parse().unwrap()),
        encryption_secret: "0123456789abcdef0123456789abcdef".into(),
        ssl_domain: "vpn.example.com".into(),
        max_attempts: 100,
        max_traffic_logs: 100,
        jail_check_interval_sec: 5,
        traffic_monitor_interval_sec: 10,
        cleanup_interval_min: 5,
        dns_lookup_timeout_sec: 2,
    }
}
