use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{ApiError, ApiResult};
use crate::models::Jail;
use crate::net;

use super::store::{now_ts, ts_after_secs, NewEntry};
use super::FirewallService;

/// Jail log files must live under these roots; anything else is rejected at
/// create/update time.
const ALLOWED_LOG_PREFIXES: &[&str] = &["/var/log/"];

// ============ REQUEST SHAPES ============

#[derive(Debug, Clone, Deserialize)]
pub struct JailCreate {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub log_file: String,
    pub filter_regex: String,
    #[serde(default = "default_max_retry")]
    pub max_retry: i64,
    #[serde(default = "default_find_time")]
    pub find_time: i64,
    #[serde(default = "default_ban_time")]
    pub ban_time: i64,
    pub port: Option<String>,
    #[serde(default)]
    pub escalate_enabled: bool,
    #[serde(default = "default_escalate_threshold")]
    pub escalate_threshold: i64,
    #[serde(default = "default_escalate_window")]
    pub escalate_window: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JailUpdate {
    pub enabled: Option<bool>,
    pub log_file: Option<String>,
    pub filter_regex: Option<String>,
    pub max_retry: Option<i64>,
    pub find_time: Option<i64>,
    pub ban_time: Option<i64>,
    pub port: Option<String>,
    pub escalate_enabled: Option<bool>,
    pub escalate_threshold: Option<i64>,
    pub escalate_window: Option<i64>,
}

fn default_true() -> bool {
    true
}
fn default_max_retry() -> i64 {
    5
}
fn default_find_time() -> i64 {
    3600
}
fn default_ban_time() -> i64 {
    2_592_000
}
fn default_escalate_threshold() -> i64 {
    5
}
fn default_escalate_window() -> i64 {
    86_400
}

// ============ VALIDATION ============

/// Compile-check a jail filter so no bad pattern ever reaches a monitor.
pub fn validate_filter_regex(pattern: &str) -> ApiResult<Regex> {
    Regex::new(pattern).map_err(|e| ApiError::Validation(format!("invalid filter regex: {}", e)))
}

fn validate_log_path(path: &str) -> ApiResult<()> {
    if path.contains("..") || !ALLOWED_LOG_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err(ApiError::Validation(format!(
            "log file must live under {}: {}",
            ALLOWED_LOG_PREFIXES.join(", "),
            path
        )));
    }
    Ok(())
}

/// Pull `(source ip, dest port)` out of a matched line. Named groups `ip` and
/// `port` win; otherwise capture 1 is the IP and capture 2, when numeric, the
/// port.
fn extract_match(re: &Regex, line: &str) -> Option<(Ipv4Addr, Option<u16>)> {
    let caps = re.captures(line)?;
    let ip_str = caps
        .name("ip")
        .map(|m| m.as_str())
        .or_else(|| caps.get(1).map(|m| m.as_str()))?;
    let ip: Ipv4Addr = ip_str.parse().ok()?;
    let port = caps
        .name("port")
        .map(|m| m.as_str())
        .or_else(|| caps.get(2).map(|m| m.as_str()))
        .and_then(|p| p.parse().ok());
    Some((ip, port))
}

impl FirewallService {
    // ============ CRUD ============

    pub async fn list_jails(&self) -> ApiResult<Vec<Jail>> {
        Ok(sqlx::query_as("SELECT * FROM jails ORDER BY name")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_jail(&self, name: &str) -> ApiResult<Jail> {
        sqlx::query_as::<_, Jail>("SELECT * FROM jails WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no jail named {}", name)))
    }

    async fn get_jail_by_id(&self, id: i64) -> ApiResult<Jail> {
        sqlx::query_as::<_, Jail>("SELECT * FROM jails WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no jail with id {}", id)))
    }

    pub async fn create_jail(&self, req: JailCreate) -> ApiResult<Jail> {
        if req.name.trim().is_empty() {
            return Err(ApiError::Validation("jail name must not be empty".to_string()));
        }
        validate_log_path(&req.log_file)?;
        validate_filter_regex(&req.filter_regex)?;
        if req.max_retry < 1 || req.find_time < 1 {
            return Err(ApiError::Validation(
                "max_retry and find_time must be positive".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO jails
                (name, enabled, log_file, filter_regex, max_retry, find_time, ban_time,
                 port, action, escalate_enabled, escalate_threshold, escalate_window)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'block', ?, ?, ?)
            "#,
        )
        .bind(&req.name)
        .bind(req.enabled)
        .bind(&req.log_file)
        .bind(&req.filter_regex)
        .bind(req.max_retry)
        .bind(req.find_time)
        .bind(req.ban_time)
        .bind(&req.port)
        .bind(req.escalate_enabled)
        .bind(req.escalate_threshold)
        .bind(req.escalate_window)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(ApiError::Conflict(format!(
                    "a jail named {} already exists",
                    req.name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let jail = self.get_jail(&req.name).await?;
        if jail.enabled {
            self.start_jail_monitor(jail.id).await;
        }
        Ok(jail)
    }

    pub async fn update_jail(&self, name: &str, req: JailUpdate) -> ApiResult<Jail> {
        let jail = self.get_jail(name).await?;

        if let Some(pattern) = &req.filter_regex {
            validate_filter_regex(pattern)?;
        }
        if let Some(path) = &req.log_file {
            validate_log_path(path)?;
        }

        sqlx::query(
            r#"
            UPDATE jails SET
                enabled = ?, log_file = ?, filter_regex = ?, max_retry = ?,
                find_time = ?, ban_time = ?, port = ?, escalate_enabled = ?,
                escalate_threshold = ?, escalate_window = ?
            WHERE id = ?
            "#,
        )
        .bind(req.enabled.unwrap_or(jail.enabled))
        .bind(req.log_file.as_ref().unwrap_or(&jail.log_file))
        .bind(req.filter_regex.as_ref().unwrap_or(&jail.filter_regex))
        .bind(req.max_retry.unwrap_or(jail.max_retry))
        .bind(req.find_time.unwrap_or(jail.find_time))
        .bind(req.ban_time.unwrap_or(jail.ban_time))
        .bind(req.port.as_ref().or(jail.port.as_ref()))
        .bind(req.escalate_enabled.unwrap_or(jail.escalate_enabled))
        .bind(req.escalate_threshold.unwrap_or(jail.escalate_threshold))
        .bind(req.escalate_window.unwrap_or(jail.escalate_window))
        .bind(jail.id)
        .execute(&self.pool)
        .await?;

        // Hot reload: the running monitor keeps stale settings otherwise.
        self.restart_jail_monitor(jail.id).await?;
        self.get_jail(name).await
    }

    pub async fn delete_jail(&self, name: &str) -> ApiResult<()> {
        let jail = self.get_jail(name).await?;
        self.stop_jail_monitor(jail.id).await;
        sqlx::query("DELETE FROM jails WHERE id = ?")
            .bind(jail.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Default jails shipped with the service; `INSERT OR IGNORE` keeps user
    /// edits intact across restarts.
    pub async fn seed_default_jails(&self) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO jails
                (name, enabled, log_file, filter_regex, max_retry, find_time, ban_time,
                 port, action, escalate_enabled, escalate_threshold, escalate_window)
            VALUES
                ('sshd', 1, '/var/log/auth.log',
                 'Failed password .* from (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})',
                 5, 3600, 2592000, '22', 'block', 1, 5, 86400),
                ('portscan', 1, '/var/log/kern.log',
                 '\[wgadmin-drop\] .*SRC=(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}).*DPT=(\d+)',
                 10, 600, 86400, NULL, 'block', 1, 5, 86400)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ MONITOR REGISTRY ============

    pub async fn start_jail_monitor(&self, id: i64) {
        let Some(svc) = self.weak.upgrade() else {
            return;
        };
        let mut registry = self.jails.lock().await;
        if registry.contains_key(&id) {
            return;
        }
        let handle = tokio::spawn(async move {
            run_jail_monitor(svc, id).await;
        });
        registry.insert(id, handle);
        tracing::info!(jail_id = id, "jail monitor started");
    }

    pub async fn stop_jail_monitor(&self, id: i64) {
        if let Some(handle) = self.jails.lock().await.remove(&id) {
            handle.abort();
            tracing::info!(jail_id = id, "jail monitor stopped");
        }
    }

    pub async fn restart_jail_monitor(&self, id: i64) -> ApiResult<()> {
        self.stop_jail_monitor(id).await;
        let jail = self.get_jail_by_id(id).await?;
        if jail.enabled {
            self.start_jail_monitor(id).await;
        }
        Ok(())
    }

    pub async fn start_enabled_jails(&self) -> ApiResult<()> {
        let jails = self.list_jails().await?;
        for jail in jails.into_iter().filter(|j| j.enabled) {
            self.start_jail_monitor(jail.id).await;
        }
        Ok(())
    }

    // ============ SCANNING ============

    /// One tail pass over the jail's log file. Returns the number of lines
    /// that matched. Transient I/O errors skip the tick without failing.
    pub(crate) async fn scan_jail(
        &self,
        jail: &mut Jail,
        re: &Regex,
        rings: &mut HashMap<Ipv4Addr, Vec<DateTime<Utc>>>,
        first_run: bool,
    ) -> ApiResult<u64> {
        let meta = match tokio::fs::metadata(&jail.log_file).await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(jail = %jail.name, error = %e, "log file unreadable this tick");
                return Ok(0);
            }
        };
        let size = meta.len() as i64;

        // Shrunk file means rotation: start over from the top.
        if size < jail.last_log_pos {
            jail.last_log_pos = 0;
        }

        // Never replay history that predates the service.
        if first_run && jail.last_log_pos == 0 {
            jail.last_log_pos = size;
            self.persist_log_pos(jail).await?;
            return Ok(0);
        }

        if size == jail.last_log_pos {
            return Ok(0);
        }

        let mut file = match tokio::fs::File::open(&jail.log_file).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(jail = %jail.name, error = %e, "log file open failed this tick");
                return Ok(0);
            }
        };
        if file
            .seek(std::io::SeekFrom::Start(jail.last_log_pos as u64))
            .await
            .is_err()
        {
            return Ok(0);
        }
        let mut buf = Vec::with_capacity((size - jail.last_log_pos).max(0) as usize);
        if file.read_to_end(&mut buf).await.is_err() {
            return Ok(0);
        }
        let text = String::from_utf8_lossy(&buf);

        let mut matched = 0u64;
        let now = Utc::now();
        let window = chrono::Duration::seconds(jail.find_time);

        for line in text.lines() {
            let Some((ip, port)) = extract_match(re, line) else {
                continue;
            };
            matched += 1;

            if net::ip_in_any(ip, &self.cfg.protected_networks()) || net::is_reserved(ip) {
                continue;
            }
            // The WireGuard handshake port is endless noise for the port
            // scanner jail.
            if jail.name == "portscan" && port == Some(self.cfg.wg_port) {
                continue;
            }
            if self.is_ip_blocked(ip).await? {
                self.bump_hit_count(ip).await?;
                continue;
            }

            self.record_attempt(
                &ip.to_string(),
                port.map(i64::from),
                "tcp",
                &jail.name,
                "observed",
            )
            .await?;

            let ring = rings.entry(ip).or_default();
            ring.push(now);
            ring.retain(|t| now.signed_duration_since(*t) <= window);

            if ring.len() as i64 >= jail.max_retry {
                let reason = format!(
                    "{} failed attempts within {}s",
                    ring.len(),
                    jail.find_time
                );
                self.block_ip(ip, jail, &reason).await?;
                rings.remove(&ip);
            }
        }

        jail.last_log_pos = size;
        self.persist_log_pos(jail).await?;
        Ok(matched)
    }

    async fn persist_log_pos(&self, jail: &Jail) -> ApiResult<()> {
        sqlx::query("UPDATE jails SET last_log_pos = ? WHERE id = ?")
            .bind(jail.last_log_pos)
            .bind(jail.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert the block row for an offender, fan the event out, and check
    /// whether the jail should escalate to the whole /24.
    pub(crate) async fn block_ip(&self, ip: Ipv4Addr, jail: &Jail, reason: &str) -> ApiResult<()> {
        let expires_at = if jail.ban_time > 0 {
            Some(ts_after_secs(jail.ban_time))
        } else {
            None
        };
        let source = format!("jail:{}", jail.name);

        self.create_system_entry(&NewEntry {
            entry_type: "ip".to_string(),
            value: ip.to_string(),
            action: "block".to_string(),
            direction: "inbound".to_string(),
            protocol: "both".to_string(),
            source: source.clone(),
            reason: reason.to_string(),
            name: String::new(),
            essential: false,
            enabled: true,
            expires_at,
            escalated_from: None,
        })
        .await?;

        self.record_attempt(&ip.to_string(), None, "tcp", &jail.name, "blocked")
            .await?;
        tracing::warn!(ip = %ip, jail = %jail.name, reason, "IP blocked");
        self.notify_block(&ip.to_string(), &jail.name, reason).await;

        if jail.escalate_enabled {
            self.maybe_escalate(ip, jail).await?;
        }
        self.request_apply();
        Ok(())
    }

    /// When enough distinct addresses out of one /24 have been blocked by
    /// this jail inside the escalation window, replace the singletons with a
    /// single range entry for the subnet.
    async fn maybe_escalate(&self, ip: Ipv4Addr, jail: &Jail) -> ApiResult<()> {
        let subnet = net::subnet24(ip);
        let since = ts_after_secs(-jail.escalate_window);
        let source = format!("jail:{}", jail.name);

        let blocked: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT value FROM firewall_entries
             WHERE type = 'ip' AND action = 'block' AND source = ? AND created_at >= ?",
        )
        .bind(&source)
        .bind(&since)
        .fetch_all(&self.pool)
        .await?;

        let in_subnet: Vec<&String> = blocked
            .iter()
            .filter(|v| {
                v.parse::<Ipv4Addr>()
                    .map(|a| subnet.contains(a))
                    .unwrap_or(false)
            })
            .collect();

        if (in_subnet.len() as i64) < jail.escalate_threshold {
            return Ok(());
        }

        let expires_at = if jail.ban_time > 0 {
            Some(ts_after_secs(jail.ban_time))
        } else {
            None
        };

        // Range insert and singleton cleanup land together or not at all.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO firewall_entries
                (type, value, action, direction, protocol, source, reason,
                 enabled, expires_at, created_at, escalated_from)
            VALUES ('range', ?, 'block', 'inbound', 'both', ?, ?, 1, ?, ?, ?)
            ON CONFLICT (type, value, protocol) DO UPDATE SET
                expires_at = excluded.expires_at,
                escalated_from = excluded.escalated_from
            "#,
        )
        .bind(subnet.to_string())
        .bind(&source)
        .bind(format!(
            "escalated: {} addresses blocked within {}s",
            in_subnet.len(),
            jail.escalate_window
        ))
        .bind(&expires_at)
        .bind(now_ts())
        .bind(&jail.name)
        .execute(&mut *tx)
        .await?;

        for value in &in_subnet {
            sqlx::query(
                "DELETE FROM firewall_entries
                 WHERE type = 'ip' AND value = ? AND source = ? AND essential = 0",
            )
            .bind(value)
            .bind(&source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::warn!(subnet = %subnet, jail = %jail.name, "escalated to subnet block");
        self.notify_block(&subnet.to_string(), &jail.name, "subnet escalation")
            .await;
        self.request_apply();
        Ok(())
    }
}

/// Long-lived tailer for one jail. Aborted through the registry handle.
async fn run_jail_monitor(svc: Arc<FirewallService>, id: i64) {
    let mut jail = match svc.get_jail_by_id(id).await {
        Ok(j) => j,
        Err(e) => {
            tracing::error!(jail_id = id, error = %e, "jail monitor cannot load its row");
            return;
        }
    };

    // Bad patterns are rejected at write time; hitting this means the row
    // predates validation, so the monitor stays inert.
    let re = match Regex::new(&jail.filter_regex) {
        Ok(re) => re,
        Err(e) => {
            tracing::error!(jail = %jail.name, error = %e, "stored filter regex does not compile");
            return;
        }
    };

    if tokio::fs::metadata(&jail.log_file).await.is_err() {
        tracing::warn!(jail = %jail.name, log_file = %jail.log_file, "log file missing; monitor not started");
        return;
    }

    let mut rings: HashMap<Ipv4Addr, Vec<DateTime<Utc>>> = HashMap::new();
    let mut first_run = true;
    let mut ticker =
        tokio::time::interval(Duration::from_secs(svc.cfg.jail_check_interval_sec.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = svc.scan_jail(&mut jail, &re, &mut rings, first_run).await {
            tracing::warn!(jail = %jail.name, error = %e, "jail scan failed");
        }
        first_run = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::store::EntryFilter;
    use crate::firewall::test_service;
    use std::io::Write;

    fn test_jail(name: &str, log_file: &str) -> Jail {
        Jail {
            id: 1,
            name: name.to_string(),
            enabled: true,
            log_file: log_file.to_string(),
            filter_regex: r"Failed password .* from (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})"
                .to_string(),
            max_retry: 5,
            find_time: 3600,
            ban_time: 2_592_000,
            port: Some("22".to_string()),
            action: "block".to_string(),
            last_log_pos: 0,
            escalate_enabled: false,
            escalate_threshold: 5,
            escalate_window: 86_400,
        }
    }

    async fn insert_jail_row(svc: &std::sync::Arc<FirewallService>, jail: &Jail) {
        sqlx::query(
            "INSERT INTO jails (id, name, enabled, log_file, filter_regex, max_retry, find_time, ban_time)
             VALUES (?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(jail.id)
        .bind(&jail.name)
        .bind(&jail.log_file)
        .bind(&jail.filter_regex)
        .bind(jail.max_retry)
        .bind(jail.find_time)
        .bind(jail.ban_time)
        .execute(svc.pool())
        .await
        .unwrap();
    }

    #[test]
    fn extracts_positional_and_named_groups() {
        let re = Regex::new(r"SRC=(?P<ip>\S+).*DPT=(?P<port>\d+)").unwrap();
        let (ip, port) =
            extract_match(&re, "[wgadmin-drop] IN=eth0 SRC=203.0.113.5 DST=10.0.0.1 DPT=8080")
                .unwrap();
        assert_eq!(ip, "203.0.113.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(port, Some(8080));

        let re = Regex::new(r"from (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").unwrap();
        let (ip, port) = extract_match(&re, "Failed password for root from 198.51.100.4").unwrap();
        assert_eq!(ip, "198.51.100.4".parse::<Ipv4Addr>().unwrap());
        assert_eq!(port, None);

        assert!(extract_match(&re, "nothing to see").is_none());
    }

    #[test]
    fn regex_validation_rejects_garbage() {
        assert!(validate_filter_regex(r"from (\d+\.\d+\.\d+\.\d+)").is_ok());
        assert!(validate_filter_regex(r"from (unclosed").is_err());
    }

    #[test]
    fn log_path_whitelist() {
        assert!(validate_log_path("/var/log/auth.log").is_ok());
        assert!(validate_log_path("/etc/passwd").is_err());
        assert!(validate_log_path("/var/log/../../etc/shadow").is_err());
    }

    #[tokio::test]
    async fn first_run_skips_preexisting_lines() {
        let svc = test_service().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..3 {
            writeln!(file, "Failed password for root from 198.51.100.{} port 22", i).unwrap();
        }
        file.flush().unwrap();

        let mut jail = test_jail("sshd", file.path().to_str().unwrap());
        insert_jail_row(&svc, &jail).await;
        let re = Regex::new(&jail.filter_regex).unwrap();
        let mut rings = HashMap::new();

        let matched = svc.scan_jail(&mut jail, &re, &mut rings, true).await.unwrap();
        assert_eq!(matched, 0);
        assert!(jail.last_log_pos > 0);

        // Nothing recorded, nothing blocked.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attempts")
            .fetch_one(svc.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn repeated_failures_block_the_offender() {
        let svc = test_service().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut jail = test_jail("sshd", file.path().to_str().unwrap());
        insert_jail_row(&svc, &jail).await;
        let re = Regex::new(&jail.filter_regex).unwrap();
        let mut rings = HashMap::new();

        // First tick pins the offset to EOF.
        svc.scan_jail(&mut jail, &re, &mut rings, true).await.unwrap();

        for _ in 0..6 {
            writeln!(file, "Failed password for admin from 198.51.100.4 port 22 ssh2").unwrap();
        }
        file.flush().unwrap();

        let matched = svc.scan_jail(&mut jail, &re, &mut rings, false).await.unwrap();
        assert_eq!(matched, 6);

        let (rows, _) = svc
            .list_entries(&EntryFilter {
                entry_type: Some("ip".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let block = &rows[0];
        assert_eq!(block.value, "198.51.100.4");
        assert_eq!(block.source, "jail:sshd");
        assert!(block.expires_at.is_some());

        // The ring was cleared on block.
        assert!(!rings.contains_key(&"198.51.100.4".parse::<Ipv4Addr>().unwrap()));

        // Audit trail has observations plus the block marker.
        let observed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attempts WHERE jail_name = 'sshd' AND action = 'observed'",
        )
        .fetch_one(svc.pool())
        .await
        .unwrap();
        assert!(observed >= 5);
    }

    #[tokio::test]
    async fn rotation_resets_the_offset() {
        let svc = test_service().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Failed password for root from 198.51.100.9 port 22").unwrap();
        file.flush().unwrap();

        let mut jail = test_jail("sshd", file.path().to_str().unwrap());
        jail.last_log_pos = 1_000_000; // recorded offset from before rotation
        insert_jail_row(&svc, &jail).await;
        let re = Regex::new(&jail.filter_regex).unwrap();
        let mut rings = HashMap::new();

        let matched = svc.scan_jail(&mut jail, &re, &mut rings, false).await.unwrap();
        assert_eq!(matched, 1);
        let size = std::fs::metadata(file.path()).unwrap().len() as i64;
        assert_eq!(jail.last_log_pos, size);
    }

    #[tokio::test]
    async fn ignored_networks_are_skipped() {
        let svc = test_service().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut jail = test_jail("sshd", file.path().to_str().unwrap());
        jail.max_retry = 1;
        insert_jail_row(&svc, &jail).await;
        let re = Regex::new(&jail.filter_regex).unwrap();
        let mut rings = HashMap::new();
        svc.scan_jail(&mut jail, &re, &mut rings, true).await.unwrap();

        // WireGuard client range and private space never get blocked.
        writeln!(file, "Failed password for root from 10.8.0.5 port 22").unwrap();
        writeln!(file, "Failed password for root from 192.168.0.10 port 22").unwrap();
        writeln!(file, "Failed password for root from 100.64.1.2 port 22").unwrap();
        file.flush().unwrap();

        svc.scan_jail(&mut jail, &re, &mut rings, false).await.unwrap();
        let (rows, _) = svc.list_entries(&EntryFilter::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn escalation_collapses_singletons_into_a_range() {
        let svc = test_service().await;
        let mut jail = test_jail("sshd", "/var/log/auth.log");
        jail.escalate_enabled = true;
        jail.escalate_threshold = 5;
        insert_jail_row(&svc, &jail).await;

        for i in 1..=5 {
            let ip: Ipv4Addr = format!("198.51.100.{}", i).parse().unwrap();
            svc.block_ip(ip, &jail, "test offence").await.unwrap();
        }

        let (ranges, _) = svc
            .list_entries(&EntryFilter {
                entry_type: Some("range".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].value, "198.51.100.0/24");
        assert_eq!(ranges[0].escalated_from.as_deref(), Some("sshd"));

        // No singleton survivors from the escalated subnet.
        let (ips, _) = svc
            .list_entries(&EntryFilter {
                entry_type: Some("ip".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(ips.is_empty());
    }

    #[tokio::test]
    async fn already_blocked_ips_bump_hit_count_only() {
        let svc = test_service().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut jail = test_jail("sshd", file.path().to_str().unwrap());
        insert_jail_row(&svc, &jail).await;
        let re = Regex::new(&jail.filter_regex).unwrap();
        let mut rings = HashMap::new();
        svc.scan_jail(&mut jail, &re, &mut rings, true).await.unwrap();

        svc.block_ip("198.51.100.4".parse().unwrap(), &jail, "seed").await.unwrap();

        writeln!(file, "Failed password for root from 198.51.100.4 port 22").unwrap();
        file.flush().unwrap();
        svc.scan_jail(&mut jail, &re, &mut rings, false).await.unwrap();

        let hit_count: i64 = sqlx::query_scalar(
            "SELECT hit_count FROM firewall_entries WHERE type = 'ip' AND value = '198.51.100.4'",
        )
        .fetch_one(svc.pool())
        .await
        .unwrap();
        assert_eq!(hit_count, 1);
        // No observation row for an already-blocked source.
        let observed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attempts WHERE action = 'observed'",
        )
        .fetch_one(svc.pool())
        .await
        .unwrap();
        assert_eq!(observed, 0);
    }
}
