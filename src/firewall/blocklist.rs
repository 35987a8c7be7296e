use std::time::Duration;

use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::net;

use super::store::NewEntry;
use super::FirewallService;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct BlocklistSource {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub url: Option<&'static str>,
    /// Sources shipped with the binary instead of fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_ranges: Option<&'static [&'static str]>,
}

pub fn catalog() -> Vec<BlocklistSource> {
    vec![
        BlocklistSource {
            id: "censys",
            name: "Censys scanners",
            description: "Published scanner ranges operated by Censys",
            url: None,
            static_ranges: Some(&[
                "162.142.125.0/24",
                "167.94.138.0/24",
                "167.248.133.0/24",
                "74.120.14.0/24",
            ]),
        },
        BlocklistSource {
            id: "blocklist-de",
            name: "blocklist.de",
            description: "Addresses reported for attacks in the last 48 hours",
            url: Some("https://lists.blocklist.de/lists/all.txt"),
            static_ranges: None,
        },
        BlocklistSource {
            id: "feodo",
            name: "Feodo Tracker",
            description: "Botnet C&C servers tracked by abuse.ch",
            url: Some("https://feodotracker.abuse.ch/downloads/ipblocklist.txt"),
            static_ranges: None,
        },
        BlocklistSource {
            id: "firehol-level1",
            name: "FireHOL Level 1",
            description: "Basic protection - low false positive risk",
            url: Some("https://iplists.firehol.org/files/firehol_level1.netset"),
            static_ranges: None,
        },
    ]
}

#[derive(Debug, Serialize)]
pub struct ImportOutcome {
    pub status: &'static str,
    pub added: u64,
    pub skipped: u64,
    pub total: u64,
}

/// Parse one blocklist line into `(value, score)`. Lines are either a bare
/// IP/CIDR or tab-separated `IP\tSCORE`; comments, blanks and anything with
/// embedded spaces are rejected here.
fn parse_line(line: &str) -> Option<(&str, Option<u32>)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    if line.contains(' ') {
        return None;
    }
    let mut fields = line.split('\t');
    let value = fields.next()?;
    let score = fields.next().and_then(|s| s.trim().parse().ok());
    Some((value, score))
}

impl FirewallService {
    /// Import a curated source (by id) or an arbitrary https URL. Each line
    /// is validated independently; failures are skipped and counted. Applies
    /// synchronously when anything was added, so callers observe the kernel
    /// state they just asked for.
    pub async fn import_blocklist(
        &self,
        source_id: Option<&str>,
        url: Option<&str>,
        min_score: Option<u32>,
    ) -> ApiResult<ImportOutcome> {
        let (tag, lines) = match (source_id, url) {
            (Some(id), _) => {
                let source = catalog()
                    .into_iter()
                    .find(|s| s.id == id)
                    .ok_or_else(|| ApiError::NotFound(format!("unknown blocklist source: {}", id)))?;
                match (source.static_ranges, source.url) {
                    (Some(ranges), _) => {
                        (id.to_string(), ranges.iter().map(|s| s.to_string()).collect())
                    }
                    (None, Some(url)) => (id.to_string(), self.fetch_list(url).await?),
                    (None, None) => {
                        return Err(ApiError::Internal(format!(
                            "source {} has neither a URL nor static ranges",
                            id
                        )))
                    }
                }
            }
            (None, Some(raw)) => {
                let url = net::sanitize_fetch_url(raw).await?;
                let tag = url.host_str().unwrap_or("blocklist").to_string();
                (tag, self.fetch_list(url.as_str()).await?)
            }
            (None, None) => {
                return Err(ApiError::Validation(
                    "either a source id or a url is required".to_string(),
                ))
            }
        };

        let mut added = 0u64;
        let mut skipped = 0u64;
        let mut total = 0u64;

        for raw_line in &lines {
            let Some((value, score)) = parse_line(raw_line) else {
                continue;
            };
            total += 1;

            if let (Some(min), Some(score)) = (min_score, score) {
                if score < min {
                    skipped += 1;
                    continue;
                }
            }

            let entry_type = if value.contains('/') { "range" } else { "ip" };
            let normalized = match super::store::normalize_value(entry_type, value) {
                Ok(v) => v,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let reserved = match entry_type {
                "ip" => normalized
                    .parse()
                    .map(net::is_reserved)
                    .unwrap_or(true),
                _ => normalized
                    .parse::<ipnetwork::Ipv4Network>()
                    .map(|n| net::is_reserved(n.network()))
                    .unwrap_or(true),
            };
            if reserved {
                skipped += 1;
                continue;
            }

            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM firewall_entries WHERE type = ? AND value = ? AND protocol = 'both'",
            )
            .bind(entry_type)
            .bind(&normalized)
            .fetch_optional(&self.pool)
            .await?;
            if exists.is_some() {
                skipped += 1;
                continue;
            }

            self.create_system_entry(&NewEntry {
                entry_type: entry_type.to_string(),
                value: normalized,
                action: "block".to_string(),
                direction: "inbound".to_string(),
                protocol: "both".to_string(),
                source: tag.clone(),
                reason: format!("imported from {}", tag),
                name: String::new(),
                essential: false,
                enabled: true,
                expires_at: None,
                escalated_from: None,
            })
            .await?;
            added += 1;
        }

        if added > 0 {
            if let Err(e) = self.apply_rules().await {
                tracing::error!(error = %e, source = %tag, "applying imported blocklist failed");
            }
        }

        tracing::info!(source = %tag, added, skipped, total, "blocklist import finished");
        Ok(ImportOutcome {
            status: "imported",
            added,
            skipped,
            total,
        })
    }

    async fn fetch_list(&self, url: &str) -> ApiResult<Vec<String>> {
        let response = tokio::time::timeout(FETCH_TIMEOUT, self.http.get(url).send())
            .await
            .map_err(|_| ApiError::Internal(format!("blocklist fetch timed out: {}", url)))??
            .error_for_status()?;
        let body = response.text().await?;
        Ok(body.lines().map(str::to_string).collect())
    }
}
