use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{ApiError, ApiResult};

use super::store::now_ts;
use super::FirewallService;

const TABLE: &str = "inet wgadmin";
pub const INPUT_LOG_PREFIX: &str = "[wgadmin-drop] ";
pub const FORWARD_LOG_PREFIX: &str = "[wgadmin-fwd] ";
const NFT_TIMEOUT: Duration = Duration::from_secs(10);
/// Incremental set updates go to the kernel in chunks this large.
const SET_BATCH: usize = 1000;

/// Everything the compiler needs from the policy store, read in one pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RuleSnapshot {
    pub blocked_ips: Vec<Ipv4Addr>,
    pub blocked_ranges: Vec<Ipv4Network>,
    pub allowed_tcp_ports: Vec<u16>,
    pub allowed_udp_ports: Vec<u16>,
    /// Cached CIDRs of every inbound-blocked country.
    pub blocked_countries: Vec<String>,
    /// Cached CIDRs of countries blocked with direction=both.
    pub blocked_countries_out: Vec<String>,
}

impl FirewallService {
    pub async fn load_snapshot(&self) -> ApiResult<RuleSnapshot> {
        let now = now_ts();
        let mut snap = RuleSnapshot::default();

        let ips: Vec<String> = sqlx::query_scalar(
            "SELECT value FROM firewall_entries
             WHERE type = 'ip' AND action = 'block' AND enabled = 1
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;
        snap.blocked_ips = ips.iter().filter_map(|v| v.parse().ok()).collect();

        let ranges: Vec<String> = sqlx::query_scalar(
            "SELECT value FROM firewall_entries
             WHERE type = 'range' AND action = 'block' AND enabled = 1
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;
        snap.blocked_ranges = ranges.iter().filter_map(|v| v.parse().ok()).collect();

        let ports: Vec<(String, String)> = sqlx::query_as(
            "SELECT value, protocol FROM firewall_entries
             WHERE type = 'port' AND action = 'allow' AND enabled = 1
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;
        for (value, protocol) in ports {
            let Ok(port) = value.parse::<u16>() else { continue };
            if protocol == "tcp" || protocol == "both" {
                snap.allowed_tcp_ports.push(port);
            }
            if protocol == "udp" || protocol == "both" {
                snap.allowed_udp_ports.push(port);
            }
        }

        let countries: Vec<(String, String)> = sqlx::query_as(
            "SELECT value, direction FROM firewall_entries
             WHERE type = 'country' AND action = 'block' AND enabled = 1
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;
        for (code, direction) in countries {
            let zones: Option<String> =
                sqlx::query_scalar("SELECT zones FROM country_zones WHERE country_code = ?")
                    .bind(&code)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some(zones) = zones else {
                tracing::warn!(country = %code, "no cached zones for blocked country; skipping until fetched");
                continue;
            };
            let cidrs: Vec<String> = zones
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            if direction == "inbound" || direction == "both" {
                snap.blocked_countries.extend(cidrs.clone());
            }
            if direction == "both" {
                snap.blocked_countries_out.extend(cidrs);
            }
        }

        Ok(snap)
    }

    /// Full rebuild + atomic install. The generated script removes the old
    /// table and defines the new one inside a single `nft -f` transaction, so
    /// the kernel never holds a half-applied ruleset.
    pub async fn apply_rules(&self) -> ApiResult<()> {
        let _guard = self.apply_lock.lock().await;
        let snap = self.load_snapshot().await?;
        let script = build_script(&snap, &self.cfg.wg_interface);

        let path = std::env::temp_dir().join(format!("wgadmin-{}.nft", std::process::id()));
        tokio::fs::write(&path, &script)
            .await
            .map_err(|e| ApiError::Internal(format!("writing ruleset file: {}", e)))?;

        let result = run_nft(&["-f", &path.to_string_lossy()]).await;
        let _ = tokio::fs::remove_file(&path).await;
        result?;

        *self.last_applied.write().await = Some(now_ts());
        tracing::info!(
            blocked_ips = snap.blocked_ips.len(),
            blocked_ranges = snap.blocked_ranges.len(),
            countries = snap.blocked_countries.len(),
            "ruleset applied"
        );
        Ok(())
    }

    /// Incremental element insert for an already-installed table. Falls back
    /// with an error for anything other than duplicate elements; the caller
    /// decides whether to recompile.
    pub async fn add_set_elements(&self, set: &str, elements: &[String]) -> ApiResult<()> {
        for chunk in elements.chunks(SET_BATCH) {
            let spec = format!("add element {} {} {{ {} }}", TABLE, set, chunk.join(", "));
            if let Err(e) = run_nft(&[&spec]).await {
                if is_exists_error(&e) {
                    continue;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn delete_set_elements(&self, set: &str, elements: &[String]) -> ApiResult<()> {
        for chunk in elements.chunks(SET_BATCH) {
            let spec = format!("delete element {} {} {{ {} }}", TABLE, set, chunk.join(", "));
            if let Err(e) = run_nft(&[&spec]).await {
                if is_missing_error(&e) {
                    continue;
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

fn is_exists_error(e: &ApiError) -> bool {
    let msg = e.to_string();
    msg.contains("File exists") || msg.contains("already exists")
}

fn is_missing_error(e: &ApiError) -> bool {
    let msg = e.to_string();
    msg.contains("No such file or directory") || msg.contains("does not exist")
}

async fn run_nft(args: &[&str]) -> ApiResult<()> {
    let output = tokio::time::timeout(NFT_TIMEOUT, Command::new("nft").args(args).output())
        .await
        .map_err(|_| ApiError::Internal("nft invocation timed out".to_string()))?
        .map_err(|e| ApiError::Internal(format!("failed to run nft: {}", e)))?;

    if !output.status.success() {
        return Err(ApiError::Internal(format!(
            "nft {}: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn push_set(script: &mut String, name: &str, set_type: &str, interval: bool, elements: &[String]) {
    script.push_str(&format!("    set {} {{\n        type {}\n", name, set_type));
    if interval {
        script.push_str("        flags interval\n");
    }
    // nft rejects an empty elements clause; an empty set just omits it.
    if !elements.is_empty() {
        script.push_str(&format!("        elements = {{ {} }}\n", elements.join(", ")));
    }
    script.push_str("    }\n");
}

/// Render the complete declarative ruleset. The leading empty declaration
/// plus delete is the standard idiom for an atomic replace: the whole file is
/// one transaction, and the delete no longer fails on first install.
pub fn build_script(snap: &RuleSnapshot, wg_interface: &str) -> String {
    let mut s = String::new();
    s.push_str(&format!("table {} {{}}\n", TABLE));
    s.push_str(&format!("delete table {}\n", TABLE));
    s.push_str(&format!("table {} {{\n", TABLE));

    push_set(
        &mut s,
        "blocked_ips",
        "ipv4_addr",
        false,
        &snap.blocked_ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
    );
    push_set(
        &mut s,
        "blocked_ranges",
        "ipv4_addr",
        true,
        &snap.blocked_ranges.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
    );
    push_set(
        &mut s,
        "allowed_tcp_ports",
        "inet_service",
        false,
        &snap.allowed_tcp_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
    );
    push_set(
        &mut s,
        "allowed_udp_ports",
        "inet_service",
        false,
        &snap.allowed_udp_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
    );
    push_set(&mut s, "blocked_countries", "ipv4_addr", true, &snap.blocked_countries);
    push_set(
        &mut s,
        "blocked_countries_out",
        "ipv4_addr",
        true,
        &snap.blocked_countries_out,
    );

    s.push_str("    chain input {\n");
    s.push_str("        type filter hook input priority 0; policy drop;\n");
    s.push_str("        ct state established,related accept\n");
    s.push_str("        iif \"lo\" accept\n");
    s.push_str("        ip protocol icmp accept\n");
    s.push_str("        ip saddr @blocked_ips counter drop\n");
    s.push_str("        ip saddr @blocked_ranges counter drop\n");
    s.push_str("        ip saddr @blocked_countries counter drop\n");
    s.push_str("        tcp dport @allowed_tcp_ports accept\n");
    s.push_str("        udp dport @allowed_udp_ports accept\n");
    s.push_str(&format!(
        "        limit rate 10/minute log prefix \"{}\" counter\n",
        INPUT_LOG_PREFIX
    ));
    s.push_str("    }\n");

    s.push_str("    chain forward {\n");
    s.push_str("        type filter hook forward priority 0; policy accept;\n");
    s.push_str("        ct state established,related accept\n");
    s.push_str("        ip saddr @blocked_ips counter drop\n");
    s.push_str("        ip saddr @blocked_ranges counter drop\n");
    s.push_str("        ip saddr @blocked_countries counter drop\n");
    s.push_str(&format!(
        "        iifname \"{}\" ct state new log prefix \"{}\" accept\n",
        wg_interface, FORWARD_LOG_PREFIX
    ));
    s.push_str(&format!(
        "        iifname \"tailscale0\" ct state new log prefix \"{}\" accept\n",
        FORWARD_LOG_PREFIX
    ));
    s.push_str("    }\n");

    s.push_str("    chain output {\n");
    s.push_str("        type filter hook output priority 0; policy accept;\n");
    s.push_str("        ip daddr @blocked_countries_out counter drop\n");
    s.push_str("    }\n");

    s.push_str("}\n");
    s
}

/// Consumes the apply-signal channel: wake, drain any piled-up signals, run
/// one rebuild. Errors are logged and the kernel keeps its previous table.
pub async fn run_apply_worker(svc: Arc<FirewallService>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        while rx.try_recv().is_ok() {}
        if let Err(e) = svc.apply_rules().await {
            tracing::error!(error = %e, "ruleset apply failed; previous ruleset stays active");
        }
    }
}
