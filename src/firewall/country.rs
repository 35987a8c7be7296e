use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use crate::db;
use crate::error::{ApiError, ApiResult};

use super::store::now_ts;
use super::FirewallService;

const ZONE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Catch-up margin: if the service slept through its window, refresh anyway
/// once this much time has passed since the last run.
const CATCH_UP_SECS: i64 = 25 * 3600;

fn zone_url(country_code: &str) -> String {
    format!(
        "https://www.ipdeny.com/ipblocks/data/countries/{}.zone",
        country_code.to_lowercase()
    )
}

impl FirewallService {
    /// Download the CIDR list for one country and upsert the cache row.
    pub async fn fetch_country_zones(&self, country_code: &str) -> ApiResult<Vec<String>> {
        let url = zone_url(country_code);
        let response = tokio::time::timeout(ZONE_FETCH_TIMEOUT, self.http.get(&url).send())
            .await
            .map_err(|_| ApiError::Internal(format!("zone fetch for {} timed out", country_code)))??
            .error_for_status()?;
        let body = response.text().await?;

        let zones: Vec<String> = body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter(|l| l.parse::<ipnetwork::Ipv4Network>().is_ok())
            .map(str::to_string)
            .collect();

        if zones.is_empty() {
            return Err(ApiError::Validation(format!(
                "zone list for {} is empty",
                country_code
            )));
        }

        sqlx::query(
            "INSERT INTO country_zones (country_code, zones, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (country_code) DO UPDATE SET
                 zones = excluded.zones, updated_at = excluded.updated_at",
        )
        .bind(country_code)
        .bind(zones.join("\n"))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        tracing::info!(country = %country_code, cidrs = zones.len(), "country zones cached");
        Ok(zones)
    }

    pub async fn cached_zones(&self, country_code: &str) -> ApiResult<Option<Vec<String>>> {
        let zones: Option<String> =
            sqlx::query_scalar("SELECT zones FROM country_zones WHERE country_code = ?")
                .bind(country_code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(zones.map(|z| z.lines().map(str::to_string).collect()))
    }

    /// Make the kernel reflect a country block. Cold cache fetches the zones
    /// and recompiles; a warm cache takes the incremental set path, falling
    /// back to a full recompile if the kernel rejects a batch.
    pub async fn activate_country(&self, country_code: &str, direction: &str) -> ApiResult<()> {
        match self.cached_zones(country_code).await? {
            None => {
                self.fetch_country_zones(country_code).await?;
                self.apply_rules().await?;
            }
            Some(zones) => {
                let mut result = self.add_set_elements("blocked_countries", &zones).await;
                if result.is_ok() && direction == "both" {
                    result = self.add_set_elements("blocked_countries_out", &zones).await;
                } else if result.is_ok() {
                    // Direction narrowed: make sure stale outbound elements go.
                    result = self.delete_set_elements("blocked_countries_out", &zones).await;
                }
                if let Err(e) = result {
                    tracing::warn!(country = %country_code, error = %e, "incremental set update failed; recompiling");
                    self.request_apply();
                }
            }
        }
        Ok(())
    }

    /// Drop a country's elements from the live sets; recompile on any error.
    pub async fn deactivate_country(&self, country_code: &str) {
        let zones = match self.cached_zones(country_code).await {
            Ok(Some(zones)) => zones,
            _ => {
                self.request_apply();
                return;
            }
        };
        let removed = self.delete_set_elements("blocked_countries", &zones).await;
        let removed_out = self.delete_set_elements("blocked_countries_out", &zones).await;
        if removed.is_err() || removed_out.is_err() {
            self.request_apply();
        }
    }

    /// Re-fetch zones for every currently-blocked country; one apply at the
    /// end if anything changed.
    pub async fn refresh_all_countries(&self) -> ApiResult<u64> {
        let codes: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT value FROM firewall_entries
             WHERE type = 'country' AND action = 'block' AND enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut updated = 0u64;
        for code in &codes {
            match self.fetch_country_zones(code).await {
                Ok(_) => updated += 1,
                Err(e) => tracing::warn!(country = %code, error = %e, "zone refresh failed"),
            }
        }
        if updated > 0 {
            self.request_apply();
        }
        Ok(updated)
    }

    pub async fn refresh_schedule(&self) -> ApiResult<(bool, u32)> {
        let enabled = db::get_setting(&self.pool, "country_refresh_enabled")
            .await?
            .map(|v| v == "true")
            .unwrap_or(true);
        let hour = db::get_setting(&self.pool, "country_refresh_hour")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        Ok((enabled, hour))
    }

    async fn last_refresh(&self) -> ApiResult<Option<DateTime<Utc>>> {
        Ok(db::get_setting(&self.pool, "country_refresh_last_run")
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// One scheduler tick. A run is due at the configured hour once 24 h have
    /// passed, or unconditionally after the catch-up margin so a suspended
    /// service does not skip its window.
    pub async fn country_refresh_tick(&self, now: DateTime<Utc>) -> ApiResult<bool> {
        let (enabled, hour) = self.refresh_schedule().await?;
        if !enabled {
            return Ok(false);
        }

        let due = match self.last_refresh().await? {
            None => now.hour() == hour,
            Some(last) => {
                let elapsed = (now - last).num_seconds();
                (elapsed >= 24 * 3600 && now.hour() == hour) || elapsed >= CATCH_UP_SECS
            }
        };
        if !due {
            return Ok(false);
        }

        db::set_setting(&self.pool, "country_refresh_last_run", &now.to_rfc3339()).await?;
        let updated = self.refresh_all_countries().await?;
        tracing::info!(updated, "scheduled country zone refresh complete");
        Ok(true)
    }
}

pub async fn run_country_scheduler(svc: Arc<FirewallService>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = svc.country_refresh_tick(Utc::now()).await {
            tracing::warn!(error = %e, "country refresh tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::test_service;
    use chrono::TimeZone;

    #[tokio::test]
    async fn tick_waits_for_configured_hour_then_runs() {
        let svc = test_service().await;
        // 02:30 UTC with default hour 3: nothing happens.
        let early = Utc.with_ymd_and_hms(2026, 3, 10, 2, 30, 0).unwrap();
        assert!(!svc.country_refresh_tick(early).await.unwrap());

        // 03:00 with no prior run: due. No countries are blocked, so the
        // refresh itself is a no-op, but the run is recorded.
        let on_time = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        assert!(svc.country_refresh_tick(on_time).await.unwrap());

        // A minute later: not due again.
        let next_minute = Utc.with_ymd_and_hms(2026, 3, 10, 3, 1, 0).unwrap();
        assert!(!svc.country_refresh_tick(next_minute).await.unwrap());
    }

    #[tokio::test]
    async fn tick_catches_up_after_suspension() {
        let svc = test_service().await;
        let first = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        assert!(svc.country_refresh_tick(first).await.unwrap());

        // Service suspended through the next 03:00 window; at 05:00 the
        // catch-up margin has passed and the run happens anyway.
        let resumed = Utc.with_ymd_and_hms(2026, 3, 11, 5, 0, 0).unwrap();
        assert!(svc.country_refresh_tick(resumed).await.unwrap());
    }

    #[tokio::test]
    async fn tick_respects_disabled_schedule() {
        let svc = test_service().await;
        db::set_setting(svc.pool(), "country_refresh_enabled", "false")
            .await
            .unwrap();
        let on_time = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        assert!(!svc.country_refresh_tick(on_time).await.unwrap());
    }
}
