use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;

use crate::error::ApiResult;
use crate::models::TrafficLog;

use super::nft::FORWARD_LOG_PREFIX;
use super::store::now_ts;
use super::FirewallService;

pub const DNS_CACHE_CAPACITY: usize = 10_000;
const DNS_CACHE_TTL: Duration = Duration::from_secs(3600);
const TRAFFIC_LOG_FILE: &str = "/var/log/kern.log";

/// Process-local reverse-DNS cache: bounded LRU with a TTL. Lookups peek
/// under the read lock; promotion to most-recent and inserts take the write
/// lock.
pub struct DnsCache {
    inner: RwLock<LruCache<Ipv4Addr, (String, Instant)>>,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        DnsCache {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, ip: Ipv4Addr) -> Option<String> {
        {
            let cache = self.inner.read().await;
            match cache.peek(&ip) {
                Some((_, inserted)) if inserted.elapsed() < DNS_CACHE_TTL => {}
                _ => return None,
            }
        }
        let mut cache = self.inner.write().await;
        cache.get(&ip).map(|(domain, _)| domain.clone())
    }

    pub async fn insert(&self, ip: Ipv4Addr, domain: String) {
        self.inner.write().await.put(ip, (domain, Instant::now()));
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// One parsed forward-chain log line.
#[derive(Debug, PartialEq)]
pub struct ForwardEvent {
    pub client_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    pub protocol: String,
}

/// Parse a kernel log line emitted by the forward chain's log rule. The
/// fields are the kernel's own `KEY=value` pairs.
pub fn parse_forward_line(line: &str) -> Option<ForwardEvent> {
    if !line.contains(FORWARD_LOG_PREFIX.trim_end()) {
        return None;
    }
    let mut src = None;
    let mut dst = None;
    let mut dpt = None;
    let mut proto = None;
    for part in line.split_whitespace() {
        if let Some(v) = part.strip_prefix("SRC=") {
            src = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("DST=") {
            dst = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("DPT=") {
            dpt = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("PROTO=") {
            proto = Some(v.to_lowercase());
        }
    }
    Some(ForwardEvent {
        client_ip: src?,
        dest_ip: dst?,
        dest_port: dpt?,
        protocol: proto?,
    })
}

impl FirewallService {
    pub async fn record_traffic(
        &self,
        event: &ForwardEvent,
        domain: Option<String>,
    ) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO traffic_logs (timestamp, client_ip, dest_ip, dest_port, protocol, domain)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(now_ts())
        .bind(event.client_ip.to_string())
        .bind(event.dest_ip.to_string())
        .bind(event.dest_port as i64)
        .bind(&event.protocol)
        .bind(domain)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "DELETE FROM traffic_logs WHERE id NOT IN
             (SELECT id FROM traffic_logs ORDER BY id DESC LIMIT ?)",
        )
        .bind(self.cfg.max_traffic_logs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_traffic(
        &self,
        limit: i64,
        offset: i64,
    ) -> ApiResult<(Vec<TrafficLog>, i64)> {
        let rows = sqlx::query_as::<_, TrafficLog>(
            "SELECT * FROM traffic_logs ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit.clamp(1, 500))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM traffic_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok((rows, total))
    }

    /// Reverse-resolve through the cache; a miss asks the resolver with a
    /// hard deadline and caches whatever comes back (including "no name").
    pub async fn resolve_domain(
        &self,
        resolver: &TokioAsyncResolver,
        ip: Ipv4Addr,
    ) -> Option<String> {
        if let Some(domain) = self.dns_cache.get(ip).await {
            return (!domain.is_empty()).then_some(domain);
        }

        let deadline = Duration::from_secs(self.cfg.dns_lookup_timeout_sec.max(1));
        let domain = match tokio::time::timeout(deadline, resolver.reverse_lookup(ip.into())).await
        {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .unwrap_or_default(),
            // Timeouts and NXDOMAIN both cache as empty so we do not hammer
            // the resolver for the same address.
            _ => String::new(),
        };
        self.dns_cache.insert(ip, domain.clone()).await;
        (!domain.is_empty()).then_some(domain)
    }
}

/// Tails the kernel log for forward-chain log lines and turns them into
/// traffic rows. Pre-existing log content is never replayed.
pub async fn run_traffic_monitor(svc: Arc<FirewallService>) {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "system resolver unavailable; traffic domains will be empty");
            TokioAsyncResolver::tokio(Default::default(), Default::default())
        }
    };

    let mut pos: Option<u64> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(
        svc.cfg.traffic_monitor_interval_sec.max(1),
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = traffic_tick(&svc, &resolver, &mut pos).await {
            tracing::debug!(error = %e, "traffic monitor tick failed");
        }
    }
}

async fn traffic_tick(
    svc: &Arc<FirewallService>,
    resolver: &TokioAsyncResolver,
    pos: &mut Option<u64>,
) -> ApiResult<()> {
    let meta = match tokio::fs::metadata(TRAFFIC_LOG_FILE).await {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    let size = meta.len();

    let start = match *pos {
        // First pass: skip everything already in the file.
        None => {
            *pos = Some(size);
            return Ok(());
        }
        Some(p) if size < p => 0, // rotated
        Some(p) => p,
    };
    if size == start {
        return Ok(());
    }

    let mut file = match tokio::fs::File::open(TRAFFIC_LOG_FILE).await {
        Ok(f) => f,
        Err(_) => return Ok(()),
    };
    if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
        return Ok(());
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return Ok(());
    }
    *pos = Some(size);

    let text = String::from_utf8_lossy(&buf);
    for line in text.lines() {
        let Some(event) = parse_forward_line(line) else {
            continue;
        };
        let domain = svc.resolve_domain(resolver, event.dest_ip).await;
        svc.record_traffic(&event, domain).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::test_service;

    #[test]
    fn parses_forward_log_lines() {
        let line = "Mar 10 12:00:01 host kernel: [wgadmin-fwd] IN=wg0 OUT=eth0 MAC= SRC=10.8.0.2 DST=142.250.74.78 LEN=60 TOS=0x00 PROTO=TCP SPT=52122 DPT=443 WINDOW=64240";
        let event = parse_forward_line(line).unwrap();
        assert_eq!(event.client_ip, "10.8.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(event.dest_ip, "142.250.74.78".parse::<Ipv4Addr>().unwrap());
        assert_eq!(event.dest_port, 443);
        assert_eq!(event.protocol, "tcp");

        assert!(parse_forward_line("unrelated kernel chatter").is_none());
        assert!(parse_forward_line("[wgadmin-fwd] SRC=10.8.0.2 DST=bad").is_none());
    }

    #[tokio::test]
    async fn dns_cache_promotes_and_bounds() {
        let cache = DnsCache::new(2);
        cache.insert("1.1.1.1".parse().unwrap(), "one.one.one.one".to_string()).await;
        cache.insert("8.8.8.8".parse().unwrap(), "dns.google".to_string()).await;

        // Touch the older entry so it becomes most-recent.
        assert_eq!(
            cache.get("1.1.1.1".parse().unwrap()).await.as_deref(),
            Some("one.one.one.one")
        );

        cache.insert("9.9.9.9".parse().unwrap(), "dns.quad9.net".to_string()).await;
        assert_eq!(cache.len().await, 2);
        // 8.8.8.8 was least recently used and got evicted.
        assert!(cache.get("8.8.8.8".parse().unwrap()).await.is_none());
        assert!(cache.get("1.1.1.1".parse().unwrap()).await.is_some());
    }

    #[tokio::test]
    async fn traffic_rows_are_capped() {
        let svc = test_service().await;
        for i in 0..120 {
            let event = ForwardEvent {
                client_ip: "10.8.0.2".parse().unwrap(),
                dest_ip: format!("93.184.216.{}", i % 250).parse().unwrap(),
                dest_port: 443,
                protocol: "tcp".to_string(),
            };
            svc.record_traffic(&event, Some("example.org".to_string())).await.unwrap();
        }
        let (rows, total) = svc.list_traffic(25, 0).await.unwrap();
        assert_eq!(total, 100);
        assert_eq!(rows.len(), 25);
        // Newest first.
        assert!(rows[0].id > rows[24].id);
    }
}
