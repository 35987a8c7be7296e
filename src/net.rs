use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::Ipv4Network;

use crate::error::{ApiError, ApiResult};

/// CGNAT space (RFC 6598); Headscale hands addresses out of this range.
pub fn cgnat() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::new(100, 64, 0, 0), 10).expect("static prefix is valid")
}

pub fn parse_ipv4(value: &str) -> ApiResult<Ipv4Addr> {
    match value.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(ip),
        Ok(IpAddr::V6(_)) => Err(ApiError::Validation(format!(
            "IPv6 addresses are not supported: {}",
            value
        ))),
        Err(_) => Err(ApiError::Validation(format!("invalid IP address: {}", value))),
    }
}

/// Parse a CIDR and normalize it to its network address (so `10.0.0.5/24`
/// becomes `10.0.0.0/24`).
pub fn parse_cidr(value: &str) -> ApiResult<Ipv4Network> {
    let net: Ipv4Network = value
        .trim()
        .parse()
        .map_err(|_| ApiError::Validation(format!("invalid CIDR: {}", value)))?;
    Ipv4Network::new(net.network(), net.prefix())
        .map_err(|_| ApiError::Validation(format!("invalid CIDR: {}", value)))
}

pub fn parse_port(value: &str) -> ApiResult<u16> {
    let port: u32 = value
        .trim()
        .parse()
        .map_err(|_| ApiError::Validation(format!("invalid port: {}", value)))?;
    if port == 0 || port > 65_535 {
        return Err(ApiError::Validation(format!("invalid port: {}", value)));
    }
    Ok(port as u16)
}

pub fn parse_country_code(value: &str) -> ApiResult<String> {
    let code = value.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ApiError::Validation(format!(
            "invalid country code: {}",
            value
        )));
    }
    Ok(code.to_ascii_uppercase())
}

/// Address space that must never end up in a block rule: RFC 1918, loopback,
/// link-local, CGNAT, multicast, unspecified and broadcast.
pub fn is_reserved(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || cgnat().contains(ip)
}

pub fn ip_in_any(ip: Ipv4Addr, nets: &[Ipv4Network]) -> bool {
    nets.iter().any(|n| n.contains(ip))
}

/// The /24 a single address belongs to, for jail escalation.
pub fn subnet24(ip: Ipv4Addr) -> Ipv4Network {
    let octets = ip.octets();
    let base = Ipv4Addr::new(octets[0], octets[1], octets[2], 0);
    Ipv4Network::new(base, 24).expect("/24 prefix is always valid")
}

/// Escape LIKE metacharacters for use with `ESCAPE '\'`. Every LIKE search in
/// the store goes through this one helper; the pattern itself is still bound
/// as a parameter, which keeps quotes inert.
pub fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '\\' || c == '%' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// SSRF guard for user-supplied fetch targets (blocklists, zone overrides):
/// https only, hostname must resolve, and no resolved address may sit in
/// private, loopback, link-local or CGNAT space.
pub async fn sanitize_fetch_url(raw: &str) -> ApiResult<reqwest::Url> {
    let url = reqwest::Url::parse(raw)
        .map_err(|_| ApiError::Validation(format!("invalid URL: {}", raw)))?;

    if url.scheme() != "https" {
        return Err(ApiError::Validation(
            "only https URLs are allowed".to_string(),
        ));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ApiError::Validation("URL has no host".to_string()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| ApiError::Validation(format!("host does not resolve: {}", host)))?
        .map(|sa| sa.ip())
        .collect();

    if addrs.is_empty() {
        return Err(ApiError::Validation(format!(
            "host does not resolve: {}",
            host
        )));
    }

    for addr in addrs {
        let blocked = match addr {
            IpAddr::V4(v4) => is_reserved(v4),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if blocked {
            return Err(ApiError::Validation(format!(
                "URL resolves to a reserved address: {}",
                host
            )));
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_rejects_addresses() {
        assert_eq!(parse_ipv4("203.0.113.7").unwrap(), Ipv4Addr::new(203, 0, 113, 7));
        assert!(parse_ipv4("not-an-ip").is_err());
        assert!(parse_ipv4("2001:db8::1").is_err());
    }

    #[test]
    fn cidr_is_normalized_to_network_address() {
        let net = parse_cidr("10.1.2.99/24").unwrap();
        assert_eq!(net.to_string(), "10.1.2.0/24");
        assert!(parse_cidr("10.1.2.0/33").is_err());
    }

    #[test]
    fn port_bounds() {
        assert_eq!(parse_port("22").unwrap(), 22);
        assert_eq!(parse_port("65535").unwrap(), 65_535);
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("ssh").is_err());
    }

    #[test]
    fn country_codes_uppercase() {
        assert_eq!(parse_country_code("ru").unwrap(), "RU");
        assert!(parse_country_code("RUS").is_err());
        assert!(parse_country_code("r1").is_err());
    }

    #[test]
    fn reserved_space() {
        assert!(is_reserved(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_reserved(Ipv4Addr::new(10, 8, 0, 3)));
        assert!(is_reserved(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_reserved(Ipv4Addr::new(169, 254, 0, 5)));
        assert!(is_reserved(Ipv4Addr::new(100, 64, 0, 1)));
        // Documentation ranges (TEST-NET) stay blockable.
        assert!(!is_reserved(Ipv4Addr::new(203, 0, 113, 7)));
        assert!(!is_reserved(Ipv4Addr::new(198, 51, 100, 4)));
        assert!(!is_reserved(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn subnet24_of_address() {
        let net = subnet24(Ipv4Addr::new(198, 51, 100, 77));
        assert_eq!(net.to_string(), "198.51.100.0/24");
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("50%_off\\x"), "50\\%\\_off\\\\x");
        assert_eq!(escape_like("plain"), "plain");
        // Quotes pass through untouched; they are bound, not interpolated.
        assert_eq!(escape_like("o'brien"), "o'brien");
    }

    #[tokio::test]
    async fn ssrf_rejects_plain_http_and_bad_urls() {
        assert!(sanitize_fetch_url("http://example.com/list.txt").await.is_err());
        assert!(sanitize_fetch_url("not a url").await.is_err());
        assert!(sanitize_fetch_url("https://").await.is_err());
    }
}
