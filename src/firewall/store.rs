use std::net::IpAddr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::models::FirewallEntry;
use crate::net;

use super::FirewallService;

pub const ENTRY_TYPES: &[&str] = &["ip", "range", "country", "port"];
pub const ACTIONS: &[&str] = &["block", "allow"];
pub const DIRECTIONS: &[&str] = &["inbound", "outbound", "both"];
pub const PROTOCOLS: &[&str] = &["tcp", "udp", "both"];

/// Whitelist for ORDER BY interpolation; bound parameters cannot carry
/// identifiers, so anything not in this list is rejected outright.
const SORT_COLUMNS: &[&str] = &[
    "id",
    "type",
    "value",
    "action",
    "direction",
    "source",
    "hit_count",
    "created_at",
    "expires_at",
];

pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn ts_after_secs(secs: i64) -> String {
    (Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============ REQUEST / RESPONSE SHAPES ============

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub value: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub name: String,
    pub expires_at: Option<String>,
}

fn default_action() -> String {
    "block".to_string()
}
fn default_direction() -> String {
    "inbound".to_string()
}
fn default_protocol() -> String {
    "both".to_string()
}

/// Fully validated row, ready for upsert. Only system code paths may set
/// `essential` or `escalated_from`.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub entry_type: String,
    pub value: String,
    pub action: String,
    pub direction: String,
    pub protocol: String,
    pub source: String,
    pub reason: String,
    pub name: String,
    pub essential: bool,
    pub enabled: bool,
    pub expires_at: Option<String>,
    pub escalated_from: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryFilter {
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    pub action: Option<String>,
    pub direction: Option<String>,
    pub source: Option<String>,
    pub enabled: Option<bool>,
    /// Case-preserving substring match over value, name and reason.
    pub search: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BulkOutcome {
    pub affected: u64,
    pub created: u64,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub op: String,
    #[serde(default)]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub entries: Vec<CreateEntry>,
}

#[derive(Debug, Serialize)]
pub struct StatusSummary {
    #[serde(rename = "blockedIPCount")]
    pub blocked_ip_count: i64,
    #[serde(rename = "blockedRangeCount")]
    pub blocked_range_count: i64,
    #[serde(rename = "blockedCountryCount")]
    pub blocked_country_count: i64,
    #[serde(rename = "allowedPortCount")]
    pub allowed_port_count: i64,
    #[serde(rename = "totalEntries")]
    pub total_entries: i64,
    #[serde(rename = "attempts24h")]
    pub attempts_24h: i64,
    #[serde(rename = "jailsEnabled")]
    pub jails_enabled: i64,
    #[serde(rename = "lastApplied")]
    pub last_applied: Option<String>,
}

// ============ VALIDATION ============

fn check_one_of(field: &str, value: &str, allowed: &[&str]) -> ApiResult<()> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "invalid {}: {} (expected one of {})",
            field,
            value,
            allowed.join(", ")
        )))
    }
}

/// Normalize the value for its type: dotted IPv4, canonical CIDR, uppercase
/// 2-letter country code, or bare port number.
pub fn normalize_value(entry_type: &str, value: &str) -> ApiResult<String> {
    match entry_type {
        "ip" => Ok(net::parse_ipv4(value)?.to_string()),
        "range" => Ok(net::parse_cidr(value)?.to_string()),
        "country" => net::parse_country_code(value),
        "port" => Ok(net::parse_port(value)?.to_string()),
        other => Err(ApiError::Validation(format!("invalid type: {}", other))),
    }
}

impl FirewallService {
    fn validate_entry(&self, req: &CreateEntry, source: &str) -> ApiResult<NewEntry> {
        check_one_of("type", &req.entry_type, ENTRY_TYPES)?;
        check_one_of("action", &req.action, ACTIONS)?;
        check_one_of("direction", &req.direction, DIRECTIONS)?;
        check_one_of("protocol", &req.protocol, PROTOCOLS)?;

        if let Some(exp) = &req.expires_at {
            chrono::DateTime::parse_from_rfc3339(exp)
                .map_err(|_| ApiError::Validation(format!("invalid expires_at: {}", exp)))?;
        }

        Ok(NewEntry {
            entry_type: req.entry_type.clone(),
            value: normalize_value(&req.entry_type, &req.value)?,
            action: req.action.clone(),
            direction: req.direction.clone(),
            protocol: req.protocol.clone(),
            source: source.to_string(),
            reason: req.reason.clone(),
            name: req.name.clone(),
            essential: false,
            enabled: true,
            expires_at: req.expires_at.clone(),
            escalated_from: None,
        })
    }

    /// Refuse single-IP blocks that would cut the requester (or the server
    /// itself) off: the requester's own address, the configured server
    /// address, and anything in private / loopback / link-local / VPN space.
    fn self_protection_check(&self, entry: &NewEntry, requester: Option<IpAddr>) -> ApiResult<()> {
        if entry.entry_type != "ip" || entry.action != "block" {
            return Ok(());
        }
        let ip = net::parse_ipv4(&entry.value)?;

        if let Some(IpAddr::V4(req_ip)) = requester {
            if req_ip == ip {
                return Err(ApiError::Forbidden(
                    "cannot block your own IP address".to_string(),
                ));
            }
        }
        if let Some(IpAddr::V4(server)) = self.cfg.server_ip {
            if server == ip {
                return Err(ApiError::Forbidden(
                    "cannot block the server's own IP address".to_string(),
                ));
            }
        }
        if net::is_reserved(ip) || net::ip_in_any(ip, &self.cfg.protected_networks()) {
            return Err(ApiError::Forbidden(format!(
                "refusing to block reserved or VPN-internal address {}",
                ip
            )));
        }
        Ok(())
    }

    // ============ CRUD ============

    /// User-facing create: validate, normalize, self-protect, upsert. Country
    /// entries additionally pull their zone list (cold cache fetches, warm
    /// cache takes the incremental set path).
    pub async fn create_entry(
        &self,
        req: CreateEntry,
        requester: Option<IpAddr>,
    ) -> ApiResult<FirewallEntry> {
        let entry = self.validate_entry(&req, "manual")?;
        self.self_protection_check(&entry, requester)?;

        let id = self.upsert_entry(&entry).await?;
        let row = self.get_entry(id).await?;

        if entry.entry_type == "country" && entry.action == "block" {
            self.activate_country(&entry.value, &entry.direction).await?;
        } else {
            self.request_apply();
        }
        Ok(row)
    }

    /// System-owned insert (jails, escalation, docker, seeds). Skips the
    /// requester check but still refuses reserved space for blocks.
    pub async fn create_system_entry(&self, entry: &NewEntry) -> ApiResult<i64> {
        self.self_protection_check(entry, None)?;
        self.upsert_entry(entry).await
    }

    async fn upsert_entry(&self, e: &NewEntry) -> ApiResult<i64> {
        // Essential rows belong to the system; a user upsert must not land on
        // top of one.
        let existing: Option<FirewallEntry> = sqlx::query_as(
            "SELECT * FROM firewall_entries WHERE type = ? AND value = ? AND protocol = ?",
        )
        .bind(&e.entry_type)
        .bind(&e.value)
        .bind(&e.protocol)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref row) = existing {
            if row.essential && !e.essential {
                return Err(ApiError::Forbidden(format!(
                    "entry {} is essential and cannot be replaced",
                    row.id
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO firewall_entries
                (type, value, action, direction, protocol, source, reason, name,
                 essential, enabled, expires_at, created_at, escalated_from)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (type, value, protocol) DO UPDATE SET
                action = excluded.action,
                direction = excluded.direction,
                source = excluded.source,
                reason = excluded.reason,
                name = excluded.name,
                essential = excluded.essential,
                enabled = excluded.enabled,
                expires_at = excluded.expires_at,
                escalated_from = excluded.escalated_from
            "#,
        )
        .bind(&e.entry_type)
        .bind(&e.value)
        .bind(&e.action)
        .bind(&e.direction)
        .bind(&e.protocol)
        .bind(&e.source)
        .bind(&e.reason)
        .bind(&e.name)
        .bind(e.essential)
        .bind(e.enabled)
        .bind(&e.expires_at)
        .bind(now_ts())
        .bind(&e.escalated_from)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM firewall_entries WHERE type = ? AND value = ? AND protocol = ?",
        )
        .bind(&e.entry_type)
        .bind(&e.value)
        .bind(&e.protocol)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_entry(&self, id: i64) -> ApiResult<FirewallEntry> {
        sqlx::query_as::<_, FirewallEntry>("SELECT * FROM firewall_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("no entry with id {}", id)))
    }

    pub async fn delete_entry(&self, id: i64) -> ApiResult<FirewallEntry> {
        let row = self.get_entry(id).await?;
        if row.essential {
            return Err(ApiError::Forbidden(format!(
                "entry {} is essential and cannot be deleted",
                id
            )));
        }
        sqlx::query("DELETE FROM firewall_entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if row.entry_type == "country" && row.action == "block" {
            self.deactivate_country(&row.value).await;
        } else {
            self.request_apply();
        }
        Ok(row)
    }

    pub async fn toggle_entry(
        &self,
        id: i64,
        enabled: Option<bool>,
        direction: Option<String>,
    ) -> ApiResult<FirewallEntry> {
        let row = self.get_entry(id).await?;

        if row.essential && enabled == Some(false) {
            return Err(ApiError::Forbidden(format!(
                "entry {} is essential and cannot be disabled",
                id
            )));
        }
        if let Some(dir) = &direction {
            check_one_of("direction", dir, DIRECTIONS)?;
        }

        let new_enabled = enabled.unwrap_or(row.enabled);
        let new_direction = direction.unwrap_or_else(|| row.direction.clone());

        sqlx::query("UPDATE firewall_entries SET enabled = ?, direction = ? WHERE id = ?")
            .bind(new_enabled)
            .bind(&new_direction)
            .bind(id)
            .execute(&self.pool)
            .await?;

        let updated = self.get_entry(id).await?;

        // Direction flips on a cached country take the incremental set path;
        // everything else goes through the debounced recompile.
        if updated.entry_type == "country" {
            if updated.enabled {
                self.activate_country(&updated.value, &updated.direction)
                    .await?;
            } else {
                self.deactivate_country(&updated.value).await;
            }
        } else {
            self.request_apply();
        }
        Ok(updated)
    }

    // ============ BULK ============

    pub async fn bulk(&self, req: BulkRequest, requester: Option<IpAddr>) -> ApiResult<BulkOutcome> {
        let mut affected = 0u64;
        let mut created = 0u64;

        match req.op.as_str() {
            "create" => {
                for item in req.entries {
                    match self.create_entry(item, requester).await {
                        Ok(_) => {
                            created += 1;
                            affected += 1;
                        }
                        Err(e) => tracing::warn!(error = %e, "bulk create item skipped"),
                    }
                }
            }
            "delete" => {
                for id in req.ids {
                    match self.delete_entry(id).await {
                        Ok(_) => affected += 1,
                        Err(e) => tracing::warn!(id, error = %e, "bulk delete item skipped"),
                    }
                }
            }
            "enable" | "disable" => {
                let enabled = req.op == "enable";
                for id in req.ids {
                    match self.toggle_entry(id, Some(enabled), None).await {
                        Ok(_) => affected += 1,
                        Err(e) => tracing::warn!(id, error = %e, "bulk toggle item skipped"),
                    }
                }
            }
            "set_inbound" | "set_outbound" | "set_both" => {
                let dir = req.op.trim_start_matches("set_").to_string();
                for id in req.ids {
                    match self.toggle_entry(id, None, Some(dir.clone())).await {
                        Ok(_) => affected += 1,
                        Err(e) => tracing::warn!(id, error = %e, "bulk direction item skipped"),
                    }
                }
            }
            other => {
                return Err(ApiError::Validation(format!("invalid bulk op: {}", other)));
            }
        }

        self.request_apply();
        Ok(BulkOutcome { affected, created })
    }

    pub async fn delete_by_source(&self, source: &str) -> ApiResult<u64> {
        if source.trim().is_empty() {
            return Err(ApiError::Validation("source must not be empty".to_string()));
        }
        let result = sqlx::query("DELETE FROM firewall_entries WHERE source = ? AND essential = 0")
            .bind(source)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            self.request_apply();
        }
        Ok(result.rows_affected())
    }

    // ============ LISTING / STATUS ============

    pub async fn list_entries(&self, f: &EntryFilter) -> ApiResult<(Vec<FirewallEntry>, i64)> {
        let mut where_sql = String::from("WHERE (expires_at IS NULL OR expires_at > ?)");
        if f.entry_type.is_some() {
            where_sql.push_str(" AND type = ?");
        }
        if f.action.is_some() {
            where_sql.push_str(" AND action = ?");
        }
        if f.direction.is_some() {
            where_sql.push_str(" AND direction = ?");
        }
        if f.source.is_some() {
            where_sql.push_str(" AND source = ?");
        }
        if f.enabled.is_some() {
            where_sql.push_str(" AND enabled = ?");
        }
        if f.search.is_some() {
            where_sql.push_str(
                " AND (value LIKE ? ESCAPE '\\' OR name LIKE ? ESCAPE '\\' OR reason LIKE ? ESCAPE '\\')",
            );
        }

        let sort = f.sort.as_deref().unwrap_or("id");
        if !SORT_COLUMNS.contains(&sort) {
            return Err(ApiError::Validation(format!("invalid sort column: {}", sort)));
        }
        let order = match f.order.as_deref().unwrap_or("asc") {
            "asc" => "ASC",
            "desc" => "DESC",
            other => {
                return Err(ApiError::Validation(format!("invalid order: {}", other)));
            }
        };

        let limit = f.limit.unwrap_or(25).clamp(1, 500);
        let offset = f.offset.unwrap_or(0).max(0);

        let now = now_ts();
        let like = f.search.as_deref().map(|s| format!("%{}%", net::escape_like(s)));

        let list_sql = format!(
            "SELECT * FROM firewall_entries {} ORDER BY {} {} LIMIT ? OFFSET ?",
            where_sql, sort, order
        );
        let mut lq = sqlx::query_as::<_, FirewallEntry>(&list_sql).bind(now.clone());
        if let Some(v) = &f.entry_type {
            lq = lq.bind(v.clone());
        }
        if let Some(v) = &f.action {
            lq = lq.bind(v.clone());
        }
        if let Some(v) = &f.direction {
            lq = lq.bind(v.clone());
        }
        if let Some(v) = &f.source {
            lq = lq.bind(v.clone());
        }
        if let Some(v) = f.enabled {
            lq = lq.bind(v);
        }
        if let Some(pat) = &like {
            lq = lq.bind(pat.clone()).bind(pat.clone()).bind(pat.clone());
        }
        let rows = lq.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let count_sql = format!("SELECT COUNT(*) FROM firewall_entries {}", where_sql);
        let mut cq = sqlx::query_scalar::<_, i64>(&count_sql).bind(now.clone());
        if let Some(v) = &f.entry_type {
            cq = cq.bind(v.clone());
        }
        if let Some(v) = &f.action {
            cq = cq.bind(v.clone());
        }
        if let Some(v) = &f.direction {
            cq = cq.bind(v.clone());
        }
        if let Some(v) = &f.source {
            cq = cq.bind(v.clone());
        }
        if let Some(v) = f.enabled {
            cq = cq.bind(v);
        }
        if let Some(pat) = &like {
            cq = cq.bind(pat.clone()).bind(pat.clone()).bind(pat.clone());
        }
        let total = cq.fetch_one(&self.pool).await?;

        Ok((rows, total))
    }

    pub async fn status(&self) -> ApiResult<StatusSummary> {
        let now = now_ts();
        let count = |type_: &'static str, action: &'static str| {
            let now = now.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM firewall_entries
                     WHERE type = ? AND action = ? AND enabled = 1
                       AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(type_)
                .bind(action)
                .bind(now)
                .fetch_one(&self.pool)
                .await
            }
        };

        let blocked_ip_count = count("ip", "block").await?;
        let blocked_range_count = count("range", "block").await?;
        let blocked_country_count = count("country", "block").await?;
        let allowed_port_count = count("port", "allow").await?;

        let total_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM firewall_entries")
            .fetch_one(&self.pool)
            .await?;

        let since = ts_after_secs(-86_400);
        let attempts_24h: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE timestamp > ?")
                .bind(&since)
                .fetch_one(&self.pool)
                .await?;

        let jails_enabled: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jails WHERE enabled = 1")
                .fetch_one(&self.pool)
                .await?;

        Ok(StatusSummary {
            blocked_ip_count,
            blocked_range_count,
            blocked_country_count,
            allowed_port_count,
            total_entries,
            attempts_24h,
            jails_enabled,
            last_applied: self.last_applied.read().await.clone(),
        })
    }

    // ============ MAINTENANCE ============

    /// Remove rows whose expiry has passed; returns how many went. The
    /// cleanup task recompiles when anything was swept.
    pub async fn sweep_expired(&self) -> ApiResult<u64> {
        let result = sqlx::query(
            "DELETE FROM firewall_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            tracing::info!(swept, "expired firewall entries removed");
            self.request_apply();
        }
        Ok(swept)
    }

    pub async fn record_attempt(
        &self,
        source_ip: &str,
        dest_port: Option<i64>,
        protocol: &str,
        jail_name: &str,
        action: &str,
    ) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO attempts (timestamp, source_ip, dest_port, protocol, jail_name, action)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(now_ts())
        .bind(source_ip)
        .bind(dest_port)
        .bind(protocol)
        .bind(jail_name)
        .bind(action)
        .execute(&self.pool)
        .await?;

        // Keep the audit table bounded; oldest rows go first.
        sqlx::query(
            "DELETE FROM attempts WHERE id NOT IN
             (SELECT id FROM attempts ORDER BY id DESC LIMIT ?)",
        )
        .bind(self.cfg.max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// True when a non-expired, enabled block already covers this address
    /// (exact IP match or containing range).
    pub async fn is_ip_blocked(&self, ip: std::net::Ipv4Addr) -> ApiResult<bool> {
        let now = now_ts();
        let exact: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM firewall_entries
             WHERE type = 'ip' AND value = ? AND action = 'block' AND enabled = 1
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(ip.to_string())
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        if exact.is_some() {
            return Ok(true);
        }

        let ranges: Vec<String> = sqlx::query_scalar(
            "SELECT value FROM firewall_entries
             WHERE type = 'range' AND action = 'block' AND enabled = 1
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ranges
            .iter()
            .filter_map(|r| r.parse::<ipnetwork::Ipv4Network>().ok())
            .any(|n| n.contains(ip)))
    }

    pub async fn bump_hit_count(&self, ip: std::net::Ipv4Addr) -> ApiResult<()> {
        sqlx::query(
            "UPDATE firewall_entries SET hit_count = hit_count + 1
             WHERE type = 'ip' AND value = ?",
        )
        .bind(ip.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ SYSTEM-OWNED ENTRIES ============

    pub async fn ssh_port(&self) -> ApiResult<u16> {
        let stored = crate::db::get_setting(&self.pool, "ssh_port").await?;
        Ok(stored.and_then(|v| v.parse().ok()).unwrap_or(22))
    }

    /// Change the SSH allow rule. Applies synchronously so the caller's next
    /// connection attempt on the new port already passes.
    pub async fn set_ssh_port(&self, port: u16) -> ApiResult<()> {
        let old = self.ssh_port().await?;
        if old != port {
            sqlx::query("DELETE FROM firewall_entries WHERE type = 'port' AND value = ? AND source = 'system' AND name = 'SSH'")
                .bind(old.to_string())
                .execute(&self.pool)
                .await?;
        }
        crate::db::set_setting(&self.pool, "ssh_port", &port.to_string()).await?;
        self.create_system_entry(&NewEntry {
            entry_type: "port".to_string(),
            value: port.to_string(),
            action: "allow".to_string(),
            direction: "inbound".to_string(),
            protocol: "tcp".to_string(),
            source: "system".to_string(),
            reason: "SSH management access".to_string(),
            name: "SSH".to_string(),
            essential: true,
            enabled: true,
            expires_at: None,
            escalated_from: None,
        })
        .await?;
        self.apply_rules().await?;
        Ok(())
    }

    /// Rows the service cannot run without: SSH and the WireGuard listen
    /// port. Idempotent; runs at every startup.
    pub async fn seed_essential_entries(&self) -> ApiResult<()> {
        let ssh = self.ssh_port().await?;
        self.create_system_entry(&NewEntry {
            entry_type: "port".to_string(),
            value: ssh.to_string(),
            action: "allow".to_string(),
            direction: "inbound".to_string(),
            protocol: "tcp".to_string(),
            source: "system".to_string(),
            reason: "SSH management access".to_string(),
            name: "SSH".to_string(),
            essential: true,
            enabled: true,
            expires_at: None,
            escalated_from: None,
        })
        .await?;

        self.create_system_entry(&NewEntry {
            entry_type: "port".to_string(),
            value: self.cfg.wg_port.to_string(),
            action: "allow".to_string(),
            direction: "inbound".to_string(),
            protocol: "udp".to_string(),
            source: "system".to_string(),
            reason: "WireGuard listen port".to_string(),
            name: "WireGuard".to_string(),
            essential: true,
            enabled: true,
            expires_at: None,
            escalated_from: None,
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::test_service;

    fn create_req(entry_type: &str, value: &str) -> CreateEntry {
        CreateEntry {
            entry_type: entry_type.to_string(),
            value: value.to_string(),
            action: "block".to_string(),
            direction: "inbound".to_string(),
            protocol: "both".to_string(),
            reason: String::new(),
            name: String::new(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn create_normalizes_and_upserts() {
        let svc = test_service().await;

        let first = svc
            .create_entry(create_req("range", "203.0.113.9/24"), None)
            .await
            .unwrap();
        assert_eq!(first.value, "203.0.113.0/24");

        let mut again = create_req("range", "203.0.113.0/24");
        again.reason = "second pass".to_string();
        let second = svc.create_entry(again, None).await.unwrap();

        // Same unique key: one row, later fields win.
        assert_eq!(first.id, second.id);
        assert_eq!(second.reason, "second pass");

        let (rows, total) = svc.list_entries(&EntryFilter::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn self_protection_rejects_own_and_reserved() {
        let svc = test_service().await;

        let own: IpAddr = "198.51.100.20".parse().unwrap();
        let err = svc
            .create_entry(create_req("ip", "198.51.100.20"), Some(own))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert!(err.to_string().contains("cannot block your own IP address"));

        // Configured server address.
        let err = svc
            .create_entry(create_req("ip", "203.0.113.1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        // Private and CGNAT space.
        for victim in ["192.168.1.5", "10.8.0.3", "100.64.0.9", "127.0.0.1"] {
            let err = svc.create_entry(create_req("ip", victim), None).await.unwrap_err();
            assert!(matches!(err, ApiError::Forbidden(_)), "{} should be refused", victim);
        }

        // Allows on private space are fine.
        let mut allow = create_req("ip", "8.8.8.8");
        allow.action = "allow".to_string();
        assert!(svc.create_entry(allow, Some(own)).await.is_ok());
    }

    #[tokio::test]
    async fn essential_entries_resist_delete_and_disable() {
        let svc = test_service().await;
        svc.seed_essential_entries().await.unwrap();

        let (rows, _) = svc
            .list_entries(&EntryFilter {
                entry_type: Some("port".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ssh = rows.iter().find(|r| r.name == "SSH").unwrap();
        assert!(ssh.essential);

        let err = svc.delete_entry(ssh.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let err = svc.toggle_entry(ssh.id, Some(false), None).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        // Direction changes without disabling are allowed.
        assert!(svc
            .toggle_entry(ssh.id, None, Some("both".to_string()))
            .await
            .is_ok());

        // Row is unchanged where it matters.
        assert!(svc.get_entry(ssh.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn bulk_round_trip_restores_enabled_state() {
        let svc = test_service().await;
        let a = svc.create_entry(create_req("ip", "203.0.113.7"), None).await.unwrap();
        let b = svc.create_entry(create_req("ip", "203.0.113.8"), None).await.unwrap();

        let out = svc
            .bulk(
                BulkRequest {
                    op: "disable".to_string(),
                    ids: vec![a.id, b.id, 9999],
                    entries: vec![],
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.affected, 2);

        assert!(!svc.get_entry(a.id).await.unwrap().enabled);

        let out = svc
            .bulk(
                BulkRequest {
                    op: "enable".to_string(),
                    ids: vec![a.id, b.id],
                    entries: vec![],
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.affected, 2);
        assert!(svc.get_entry(a.id).await.unwrap().enabled);
        assert!(svc.get_entry(b.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_swept() {
        let svc = test_service().await;
        let mut req = create_req("ip", "203.0.113.50");
        req.expires_at = Some(ts_after_secs(-10));
        svc.create_entry(req, None).await.unwrap();

        let (rows, total) = svc.list_entries(&EntryFilter::default()).await.unwrap();
        assert_eq!(total, 0);
        assert!(rows.is_empty());

        assert_eq!(svc.sweep_expired().await.unwrap(), 1);
        assert_eq!(svc.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn search_escapes_like_metacharacters() {
        let svc = test_service().await;
        let mut named = create_req("ip", "203.0.113.61");
        named.name = "100%_match".to_string();
        svc.create_entry(named, None).await.unwrap();

        let mut other = create_req("ip", "203.0.113.62");
        other.name = "100x match".to_string();
        svc.create_entry(other, None).await.unwrap();

        let (rows, total) = svc
            .list_entries(&EntryFilter {
                search: Some("100%_".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        // A literal match only; % and _ must not act as wildcards.
        assert_eq!(total, 1);
        assert_eq!(rows[0].name, "100%_match");
    }

    #[tokio::test]
    async fn sort_column_whitelist() {
        let svc = test_service().await;
        let err = svc
            .list_entries(&EntryFilter {
                sort: Some("value; DROP TABLE firewall_entries".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_by_source_spares_essentials() {
        let svc = test_service().await;
        svc.seed_essential_entries().await.unwrap();

        let deleted = svc.delete_by_source("system").await.unwrap();
        assert_eq!(deleted, 0);

        svc.create_entry(create_req("ip", "203.0.113.77"), None).await.unwrap();
        assert_eq!(svc.delete_by_source("manual").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blocked_lookup_covers_ranges() {
        let svc = test_service().await;
        svc.create_entry(create_req("range", "198.51.100.0/24"), None)
            .await
            .unwrap();

        assert!(svc.is_ip_blocked("198.51.100.7".parse().unwrap()).await.unwrap());
        assert!(!svc.is_ip_blocked("198.51.101.7".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn attempts_table_is_capped() {
        let svc = test_service().await;
        for i in 0..110 {
            svc.record_attempt(&format!("203.0.113.{}", i % 250), Some(22), "tcp", "sshd", "observed")
                .await
                .unwrap();
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attempts")
            .fetch_one(svc.pool())
            .await
            .unwrap();
        assert_eq!(count, 100);
    }

    #[tokio::test]
    async fn ssh_port_change_replaces_essential_row() {
        let svc = test_service().await;
        svc.seed_essential_entries().await.unwrap();
        assert_eq!(svc.ssh_port().await.unwrap(), 22);

        // apply_rules will fail to spawn nft in the test environment; the
        // port bookkeeping must still hold.
        let _ = svc.set_ssh_port(2222).await;
        assert_eq!(svc.ssh_port().await.unwrap(), 2222);

        let (rows, _) = svc
            .list_entries(&EntryFilter {
                entry_type: Some("port".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ssh_rows: Vec<_> = rows.iter().filter(|r| r.name == "SSH").collect();
        assert_eq!(ssh_rows.len(), 1);
        assert_eq!(ssh_rows[0].value, "2222");
    }
}
