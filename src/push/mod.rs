pub mod events;
pub mod webpush;

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;

use crate::crypto::SecretBox;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::PushSubscription;

/// Notification types with their built-in defaults; an absent preference row
/// means the default applies.
pub const PREF_DEFAULTS: &[(&str, bool)] = &[
    ("node_status", true),
    ("firewall_block", true),
    ("new_login", true),
    ("test", true),
];

const MAX_ENDPOINT_LEN: usize = 2048;
const MAX_KEY_LEN: usize = 512;
/// Bounded delivery concurrency.
const DELIVERY_PERMITS: usize = 10;

/// Push-service hosts we will POST to, by exact name or suffix.
const ENDPOINT_HOSTS_EXACT: &[&str] = &["fcm.googleapis.com", "updates.push.services.mozilla.com"];
const ENDPOINT_HOSTS_SUFFIX: &[&str] = &[
    ".push.apple.com",
    ".notify.windows.com",
    ".push.services.mozilla.com",
    ".fcm.googleapis.com",
];

#[derive(Clone)]
pub struct VapidKeys {
    /// PKCS#8 document for the P-256 signing key.
    pub pkcs8_der: Vec<u8>,
    /// Uncompressed public point, base64url, as handed to browsers.
    pub public_key: String,
    pub subject: String,
}

pub struct NotifierService {
    pool: SqlitePool,
    secrets: SecretBox,
    http: reqwest::Client,
    /// VAPID material, or the init failure every caller gets to see.
    vapid: Result<VapidKeys, String>,
    delivery_permits: Arc<Semaphore>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

fn endpoint_host_allowed(host: &str) -> bool {
    ENDPOINT_HOSTS_EXACT.contains(&host)
        || ENDPOINT_HOSTS_SUFFIX.iter().any(|s| host.ends_with(s))
}

impl NotifierService {
    /// Load or create the VAPID identity. Generation failures are captured,
    /// not propagated: every later accessor returns the same error so the
    /// service fails consistently instead of half-working.
    pub async fn init(pool: SqlitePool, secrets: SecretBox, ssl_domain: &str) -> Arc<Self> {
        let vapid = Self::load_or_create_vapid(&pool, &secrets, ssl_domain)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "VAPID initialization failed");
                e.to_string()
            });

        Arc::new(NotifierService {
            pool,
            secrets,
            http: reqwest::Client::new(),
            vapid,
            delivery_permits: Arc::new(Semaphore::new(DELIVERY_PERMITS)),
        })
    }

    async fn load_or_create_vapid(
        pool: &SqlitePool,
        secrets: &SecretBox,
        ssl_domain: &str,
    ) -> ApiResult<VapidKeys> {
        let subject = if ssl_domain.is_empty() {
            "mailto:admin@localhost".to_string()
        } else {
            format!("https://{}", ssl_domain)
        };

        if let (Some(private_enc), Some(public)) = (
            db::get_setting(pool, "vapid_private_key").await?,
            db::get_setting(pool, "vapid_public_key").await?,
        ) {
            let pkcs8_b64 = secrets.decrypt(&private_enc)?;
            let pkcs8_der = URL_SAFE_NO_PAD
                .decode(pkcs8_b64)
                .map_err(|_| ApiError::Internal("stored VAPID key is corrupt".to_string()))?;
            let subject = db::get_setting(pool, "vapid_subject")
                .await?
                .unwrap_or(subject);
            return Ok(VapidKeys {
                pkcs8_der,
                public_key: public,
                subject,
            });
        }

        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| ApiError::Internal("VAPID keypair generation failed".to_string()))?;
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|_| ApiError::Internal("generated VAPID key does not parse".to_string()))?;

        use ring::signature::KeyPair as _;
        let public_key = URL_SAFE_NO_PAD.encode(key_pair.public_key().as_ref());
        let private_enc = secrets.encrypt(&URL_SAFE_NO_PAD.encode(pkcs8.as_ref()))?;

        // All three settings land in one transaction so no caller ever sees a
        // half-initialized identity.
        let mut tx = pool.begin().await?;
        for (key, value) in [
            ("vapid_private_key", private_enc.as_str()),
            ("vapid_public_key", public_key.as_str()),
            ("vapid_subject", subject.as_str()),
        ] {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES (?, ?)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::info!("VAPID keypair generated");

        Ok(VapidKeys {
            pkcs8_der: pkcs8.as_ref().to_vec(),
            public_key,
            subject,
        })
    }

    pub fn vapid(&self) -> ApiResult<&VapidKeys> {
        self.vapid
            .as_ref()
            .map_err(|e| ApiError::Internal(e.clone()))
    }

    pub fn public_key(&self) -> ApiResult<String> {
        Ok(self.vapid()?.public_key.clone())
    }

    // ============ SUBSCRIPTIONS ============

    pub async fn subscribe(
        &self,
        user_id: i64,
        req: SubscribeRequest,
        user_agent: &str,
    ) -> ApiResult<i64> {
        if req.endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(ApiError::Validation("endpoint is too long".to_string()));
        }
        if !req.endpoint.starts_with("https://") {
            return Err(ApiError::Validation(
                "endpoint must be an https URL".to_string(),
            ));
        }
        let url = reqwest::Url::parse(&req.endpoint)
            .map_err(|_| ApiError::Validation("endpoint is not a valid URL".to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ApiError::Validation("endpoint has no host".to_string()))?;
        if !endpoint_host_allowed(host) {
            return Err(ApiError::Validation(format!(
                "endpoint host is not a known push service: {}",
                host
            )));
        }
        if req.keys.p256dh.len() > MAX_KEY_LEN || req.keys.auth.len() > MAX_KEY_LEN {
            return Err(ApiError::Validation("subscription keys are too long".to_string()));
        }
        if req.keys.p256dh.is_empty() || req.keys.auth.is_empty() {
            return Err(ApiError::Validation("subscription keys are required".to_string()));
        }

        let p256dh = self.secrets.encrypt(&req.keys.p256dh)?;
        let auth = self.secrets.encrypt(&req.keys.auth)?;

        // Re-subscribing the same endpoint updates owner and key material.
        sqlx::query(
            r#"
            INSERT INTO push_subscriptions
                (user_id, device_name, endpoint, key_p256dh, key_auth, user_agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (endpoint) DO UPDATE SET
                user_id = excluded.user_id,
                device_name = excluded.device_name,
                key_p256dh = excluded.key_p256dh,
                key_auth = excluded.key_auth,
                user_agent = excluded.user_agent
            "#,
        )
        .bind(user_id)
        .bind(&req.device_name)
        .bind(&req.endpoint)
        .bind(&p256dh)
        .bind(&auth)
        .bind(user_agent)
        .bind(crate::firewall::store::now_ts())
        .execute(&self.pool)
        .await?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM push_subscriptions WHERE endpoint = ?")
                .bind(&req.endpoint)
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    pub async fn unsubscribe(&self, user_id: i64, endpoint: &str) -> ApiResult<()> {
        let result =
            sqlx::query("DELETE FROM push_subscriptions WHERE user_id = ? AND endpoint = ?")
                .bind(user_id)
                .bind(endpoint)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("no such subscription".to_string()));
        }
        Ok(())
    }

    pub async fn get_user_subscriptions(&self, user_id: i64) -> ApiResult<Vec<PushSubscription>> {
        Ok(sqlx::query_as(
            "SELECT * FROM push_subscriptions WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_subscription(&self, id: i64) {
        if let Err(e) = sqlx::query("DELETE FROM push_subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(subscription = id, error = %e, "failed to delete dead subscription");
        }
    }

    // ============ PREFERENCES ============

    /// The user's effective preference map: stored rows over built-in
    /// defaults.
    pub async fn preferences(&self, user_id: i64) -> ApiResult<Vec<(String, bool)>> {
        let stored: Vec<(String, bool)> = sqlx::query_as(
            "SELECT pref_key, enabled FROM notification_prefs WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(PREF_DEFAULTS
            .iter()
            .map(|(key, default)| {
                let value = stored
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| *v)
                    .unwrap_or(*default);
                (key.to_string(), value)
            })
            .collect())
    }

    /// Replace the user's preference rows in one transaction.
    pub async fn set_preferences(
        &self,
        user_id: i64,
        prefs: &[(String, bool)],
    ) -> ApiResult<()> {
        for (key, _) in prefs {
            if !PREF_DEFAULTS.iter().any(|(k, _)| k == key) {
                return Err(ApiError::Validation(format!(
                    "unknown notification type: {}",
                    key
                )));
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM notification_prefs WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for (key, enabled) in prefs {
            sqlx::query(
                "INSERT INTO notification_prefs (user_id, pref_key, enabled) VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(key)
            .bind(enabled)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Subscriptions whose owner has the given notification type on (stored
    /// row wins, otherwise the built-in default).
    async fn recipients(&self, pref_key: &str) -> ApiResult<Vec<PushSubscription>> {
        let default = PREF_DEFAULTS
            .iter()
            .find(|(k, _)| *k == pref_key)
            .map(|(_, d)| *d)
            .unwrap_or(false);

        Ok(sqlx::query_as(
            r#"
            SELECT s.* FROM push_subscriptions s
            LEFT JOIN notification_prefs p
                ON p.user_id = s.user_id AND p.pref_key = ?
            WHERE COALESCE(p.enabled, ?) = 1
            "#,
        )
        .bind(pref_key)
        .bind(default)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_notifier() -> Arc<NotifierService> {
        let pool = db::test_pool().await;
        NotifierService::init(pool, SecretBox::new("test-secret-test-secret"), "vpn.example.com")
            .await
    }

    fn subscribe_req(endpoint: &str) -> SubscribeRequest {
        SubscribeRequest {
            endpoint: endpoint.to_string(),
            keys: SubscriptionKeys {
                p256dh: "BM5evD0Wy8qxUTF4x0aFrwM4dvTZCkwMkLL5qAGkqbS9zl2g3CbnVzAKTIVGUc6Gnb1eZAC3b6PqqOZ78rrmRlI"
                    .to_string(),
                auth: "dGVzdC1hdXRoLXNlY3JldA".to_string(),
            },
            device_name: "phone".to_string(),
        }
    }

    #[tokio::test]
    async fn vapid_init_is_stable_across_restarts() {
        let pool = db::test_pool().await;
        let secrets = SecretBox::new("stable-secret-stable-secret");
        let first = NotifierService::init(pool.clone(), secrets.clone(), "vpn.example.com").await;
        let key_a = first.public_key().unwrap();

        let second = NotifierService::init(pool, secrets, "vpn.example.com").await;
        assert_eq!(second.public_key().unwrap(), key_a);
        assert_eq!(second.vapid().unwrap().subject, "https://vpn.example.com");
    }

    #[tokio::test]
    async fn endpoint_allowlist_is_enforced() {
        let svc = test_notifier().await;

        assert!(svc
            .subscribe(1, subscribe_req("https://fcm.googleapis.com/fcm/send/abc"), "ua")
            .await
            .is_ok());
        assert!(svc
            .subscribe(1, subscribe_req("https://web.push.apple.com/QOdwJ"), "ua")
            .await
            .is_ok());

        let err = svc
            .subscribe(1, subscribe_req("https://evil.example.com/push"), "ua")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let err = svc
            .subscribe(1, subscribe_req("http://fcm.googleapis.com/fcm/send/abc"), "ua")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn resubscribe_same_endpoint_upserts() {
        let svc = test_notifier().await;
        let endpoint = "https://updates.push.services.mozilla.com/wpush/v2/token";

        let a = svc.subscribe(1, subscribe_req(endpoint), "firefox").await.unwrap();
        let mut again = subscribe_req(endpoint);
        again.device_name = "laptop".to_string();
        let b = svc.subscribe(2, again, "firefox-2").await.unwrap();
        assert_eq!(a, b);

        let subs = svc.get_user_subscriptions(2).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].device_name, "laptop");
        // Key material is never stored in the clear.
        assert!(!subs[0].key_p256dh.starts_with("BM5evD0"));
        assert!(svc.get_user_subscriptions(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preferences_fall_back_to_defaults() {
        let svc = test_notifier().await;
        let prefs = svc.preferences(7).await.unwrap();
        assert!(prefs.iter().all(|(_, enabled)| *enabled));

        svc.set_preferences(7, &[("firewall_block".to_string(), false)])
            .await
            .unwrap();
        let prefs = svc.preferences(7).await.unwrap();
        assert_eq!(
            prefs.iter().find(|(k, _)| k == "firewall_block").unwrap().1,
            false
        );
        assert_eq!(prefs.iter().find(|(k, _)| k == "new_login").unwrap().1, true);

        let err = svc
            .set_preferences(7, &[("bogus".to_string(), true)])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn recipients_respect_preferences() {
        let svc = test_notifier().await;
        svc.subscribe(1, subscribe_req("https://fcm.googleapis.com/fcm/send/u1"), "ua1")
            .await
            .unwrap();
        svc.subscribe(2, subscribe_req("https://fcm.googleapis.com/fcm/send/u2"), "ua2")
            .await
            .unwrap();

        svc.set_preferences(2, &[("firewall_block".to_string(), false)])
            .await
            .unwrap();

        let recipients = svc.recipients("firewall_block").await.unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].user_id, 1);
    }
}
