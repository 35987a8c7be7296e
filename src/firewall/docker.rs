use std::collections::HashSet;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{ApiError, ApiResult};

use super::store::NewEntry;
use super::FirewallService;

const DOCKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Host ports a container publishes to the outside, from one `docker ps`
/// ports column. Loopback-only binds stay invisible to the firewall.
fn parse_published_ports(ports_column: &str) -> Vec<(u16, String)> {
    let mut out = Vec::new();
    for part in ports_column.split(',').map(str::trim) {
        // Format: 0.0.0.0:8080->80/tcp or [::]:443->443/tcp
        let Some((bind, target)) = part.split_once("->") else {
            continue;
        };
        if bind.starts_with("127.") || bind.starts_with("[::1]") {
            continue;
        }
        let Some(port_str) = bind.rsplit(':').next() else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };
        let proto = target.rsplit('/').next().unwrap_or("tcp");
        if proto == "tcp" || proto == "udp" {
            out.push((port, proto.to_string()));
        }
    }
    out
}

impl FirewallService {
    /// Reconcile essential allow entries with the ports Docker currently
    /// publishes. Containers come and go underneath us, so stale rows are
    /// removed and new ones inserted on every startup.
    pub async fn sync_docker_entries(&self) -> ApiResult<()> {
        let output = tokio::time::timeout(
            DOCKER_TIMEOUT,
            Command::new("docker")
                .args(["ps", "--format", "{{.Names}}\t{{.Ports}}"])
                .output(),
        )
        .await
        .map_err(|_| ApiError::Internal("docker introspection timed out".to_string()))?
        .map_err(|e| ApiError::Internal(format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(ApiError::Internal(format!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut desired: HashSet<(String, String)> = HashSet::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let Some((name, ports)) = line.split_once('\t') else {
                continue;
            };
            for (port, proto) in parse_published_ports(ports) {
                desired.insert((port.to_string(), proto.clone()));
                self.create_system_entry(&NewEntry {
                    entry_type: "port".to_string(),
                    value: port.to_string(),
                    action: "allow".to_string(),
                    direction: "inbound".to_string(),
                    protocol: proto,
                    source: "docker".to_string(),
                    reason: format!("published by container {}", name),
                    name: name.to_string(),
                    essential: true,
                    enabled: true,
                    expires_at: None,
                    escalated_from: None,
                })
                .await?;
            }
        }

        // Drop rows for ports no longer published.
        let existing: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT id, value, protocol FROM firewall_entries WHERE source = 'docker'",
        )
        .fetch_all(&self.pool)
        .await?;
        for (id, value, protocol) in existing {
            if !desired.contains(&(value, protocol)) {
                sqlx::query("DELETE FROM firewall_entries WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_ports_column() {
        let ports = parse_published_ports(
            "0.0.0.0:8080->80/tcp, [::]:8080->80/tcp, 127.0.0.1:5432->5432/tcp, 0.0.0.0:51821->51821/udp",
        );
        assert!(ports.contains(&(8080, "tcp".to_string())));
        assert!(ports.contains(&(51821, "udp".to_string())));
        // Loopback binds are not reachable from outside; no allow rule.
        assert!(!ports.iter().any(|(p, _)| *p == 5432));
    }

    #[test]
    fn ignores_unpublished_ports() {
        assert!(parse_published_ports("80/tcp, 443/tcp").is_empty());
        assert!(parse_published_ports("").is_empty());
    }
}
