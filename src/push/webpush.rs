use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{aead, agreement, hkdf};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};

use super::{NotifierService, VapidKeys};

const TTL_SECONDS: u32 = 86_400;
/// RFC 8188 record size; a notification payload always fits in one record.
const RECORD_SIZE: u32 = 4096;
const JWT_LIFETIME_SECS: i64 = 12 * 3600;

#[derive(Debug, Serialize)]
struct VapidClaims {
    aud: String,
    exp: i64,
    sub: String,
}

/// `Authorization: vapid t=<jwt>, k=<public key>` for one push endpoint.
/// The JWT audience is the endpoint's origin, per RFC 8292.
pub fn vapid_authorization(keys: &VapidKeys, endpoint: &reqwest::Url) -> ApiResult<String> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| ApiError::Validation("endpoint has no host".to_string()))?;
    let claims = VapidClaims {
        aud: format!("{}://{}", endpoint.scheme(), host),
        exp: Utc::now().timestamp() + JWT_LIFETIME_SECS,
        sub: keys.subject.clone(),
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::ES256),
        &claims,
        &EncodingKey::from_ec_der(&keys.pkcs8_der),
    )
    .map_err(|e| ApiError::Internal(format!("VAPID JWT signing failed: {}", e)))?;
    Ok(format!("vapid t={}, k={}", token, keys.public_key))
}

/// Subscription keys arrive base64url from browsers, but some clients pad or
/// use the standard alphabet.
fn decode_key(value: &str) -> ApiResult<Vec<u8>> {
    let trimmed = value.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(value))
        .map_err(|_| ApiError::Validation("subscription key is not valid base64".to_string()))
}

struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_derive(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> ApiResult<Vec<u8>> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
    let info_arr = [info];
    let okm = prk
        .expand(&info_arr, HkdfLen(len))
        .map_err(|_| ApiError::Internal("HKDF expand failed".to_string()))?;
    let mut out = vec![0u8; len];
    okm.fill(&mut out)
        .map_err(|_| ApiError::Internal("HKDF fill failed".to_string()))?;
    Ok(out)
}

/// RFC 8291 `aes128gcm` message encryption: ECDH over P-256 against the
/// browser's subscription key, HKDF key schedule, one AES-128-GCM record with
/// the RFC 8188 binary header up front.
pub fn encrypt_payload(p256dh: &str, auth: &str, plaintext: &[u8]) -> ApiResult<Vec<u8>> {
    let ua_public = decode_key(p256dh)?;
    let auth_secret = decode_key(auth)?;
    if ua_public.len() != 65 || auth_secret.len() != 16 {
        return Err(ApiError::Validation(
            "subscription key material has the wrong length".to_string(),
        ));
    }

    let rng = SystemRandom::new();
    let as_private = agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
        .map_err(|_| ApiError::Internal("ephemeral key generation failed".to_string()))?;
    let as_public = as_private
        .compute_public_key()
        .map_err(|_| ApiError::Internal("ephemeral public key derivation failed".to_string()))?;

    let peer = agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, ua_public.clone());
    let shared = agreement::agree_ephemeral(as_private, &peer, |secret| secret.to_vec())
        .map_err(|_| ApiError::Validation("subscription p256dh key is invalid".to_string()))?;

    let mut key_info = Vec::with_capacity(14 + 65 + 65);
    key_info.extend_from_slice(b"WebPush: info\x00");
    key_info.extend_from_slice(&ua_public);
    key_info.extend_from_slice(as_public.as_ref());
    let ikm = hkdf_derive(&auth_secret, &shared, &key_info, 32)?;

    let mut salt = [0u8; 16];
    rng.fill(&mut salt)
        .map_err(|_| ApiError::Internal("salt generation failed".to_string()))?;
    let cek = hkdf_derive(&salt, &ikm, b"Content-Encoding: aes128gcm\x00", 16)?;
    let nonce = hkdf_derive(&salt, &ikm, b"Content-Encoding: nonce\x00", 12)?;

    // Single record: payload plus the last-record delimiter.
    let mut record = plaintext.to_vec();
    record.push(0x02);

    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &cek)
            .map_err(|_| ApiError::Internal("AEAD key setup failed".to_string()))?,
    );
    let nonce = aead::Nonce::try_assume_unique_for_key(&nonce)
        .map_err(|_| ApiError::Internal("AEAD nonce setup failed".to_string()))?;
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut record)
        .map_err(|_| ApiError::Internal("payload encryption failed".to_string()))?;

    let mut body = Vec::with_capacity(16 + 4 + 1 + 65 + record.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(65);
    body.extend_from_slice(as_public.as_ref());
    body.extend_from_slice(&record);
    Ok(body)
}

#[derive(Debug, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    /// 404 or 410: the endpoint is permanently dead.
    Gone,
    Failed,
}

pub async fn deliver(
    http: &reqwest::Client,
    keys: &VapidKeys,
    endpoint: &str,
    p256dh: &str,
    auth: &str,
    payload: &[u8],
) -> DeliveryOutcome {
    let url = match reqwest::Url::parse(endpoint) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, "stored endpoint does not parse");
            return DeliveryOutcome::Failed;
        }
    };
    let authorization = match vapid_authorization(keys, &url) {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "VAPID header build failed");
            return DeliveryOutcome::Failed;
        }
    };
    let body = match encrypt_payload(p256dh, auth, payload) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "payload encryption failed");
            return DeliveryOutcome::Failed;
        }
    };

    let response = http
        .post(url)
        .header("Authorization", authorization)
        .header("Content-Encoding", "aes128gcm")
        .header("Content-Type", "application/octet-stream")
        .header("TTL", TTL_SECONDS.to_string())
        .header("Urgency", "normal")
        .body(body)
        .send()
        .await;

    match response {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                DeliveryOutcome::Delivered
            } else if status.as_u16() == 404 || status.as_u16() == 410 {
                DeliveryOutcome::Gone
            } else {
                tracing::warn!(status = %status, "push endpoint rejected delivery");
                DeliveryOutcome::Failed
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "push delivery failed");
            DeliveryOutcome::Failed
        }
    }
}

impl NotifierService {
    /// Fan a payload out to every opted-in subscription through the bounded
    /// worker pool. Returns how many deliveries succeeded.
    pub async fn send_notification(
        &self,
        pref_key: &str,
        payload: serde_json::Value,
    ) -> ApiResult<u64> {
        let recipients = self.recipients(pref_key).await?;
        self.dispatch(recipients, payload).await
    }

    /// New-login alert to the user's other devices: the subscription whose
    /// user agent matches the just-authenticated request is excluded.
    pub async fn notify_new_login(
        &self,
        user_id: i64,
        user_agent: &str,
        source_ip: &str,
    ) -> ApiResult<u64> {
        let recipients: Vec<_> = self
            .recipients("new_login")
            .await?
            .into_iter()
            .filter(|s| s.user_id == user_id && s.user_agent != user_agent)
            .collect();

        let payload = serde_json::json!({
            "type": "new_login",
            "title": "New login",
            "body": format!("New login to your account from {}", source_ip),
        });
        self.dispatch(recipients, payload).await
    }

    pub async fn dispatch(
        &self,
        recipients: Vec<crate::models::PushSubscription>,
        payload: serde_json::Value,
    ) -> ApiResult<u64> {
        let keys = self.vapid()?.clone();
        let body = serde_json::to_vec(&payload)
            .map_err(|e| ApiError::Internal(format!("payload serialization failed: {}", e)))?;

        let mut tasks = tokio::task::JoinSet::new();
        for sub in recipients {
            let p256dh = match self.secrets.decrypt(&sub.key_p256dh) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(subscription = sub.id, error = %e, "stored key does not decrypt");
                    continue;
                }
            };
            let auth = match self.secrets.decrypt(&sub.key_auth) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!(subscription = sub.id, error = %e, "stored key does not decrypt");
                    continue;
                }
            };

            let http = self.http.clone();
            let keys = keys.clone();
            let permits = self.delivery_permits.clone();
            let body = body.clone();
            let endpoint = sub.endpoint.clone();
            let id = sub.id;
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = deliver(&http, &keys, &endpoint, &p256dh, &auth, &body).await;
                (id, outcome)
            });
        }

        let mut delivered = 0u64;
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, outcome)) = joined else { continue };
            match outcome {
                DeliveryOutcome::Delivered => {
                    delivered += 1;
                    let _ = sqlx::query(
                        "UPDATE push_subscriptions SET last_used_at = ? WHERE id = ?",
                    )
                    .bind(crate::firewall::store::now_ts())
                    .bind(id)
                    .execute(&self.pool)
                    .await;
                }
                DeliveryOutcome::Gone => {
                    tracing::info!(subscription = id, "push endpoint gone; removing subscription");
                    self.delete_subscription(id).await;
                }
                DeliveryOutcome::Failed => {}
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

    fn test_keys() -> VapidKeys {
        let rng = SystemRandom::new();
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        VapidKeys {
            pkcs8_der: pkcs8.as_ref().to_vec(),
            public_key: URL_SAFE_NO_PAD.encode(pair.public_key().as_ref()),
            subject: "https://vpn.example.com".to_string(),
        }
    }

    /// A browser-side subscription keypair for encryption tests.
    fn test_subscription_keys() -> (String, String) {
        let rng = SystemRandom::new();
        let private =
            agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng).unwrap();
        let public = private.compute_public_key().unwrap();
        let mut auth = [0u8; 16];
        rng.fill(&mut auth).unwrap();
        (
            URL_SAFE_NO_PAD.encode(public.as_ref()),
            URL_SAFE_NO_PAD.encode(auth),
        )
    }

    #[test]
    fn vapid_header_shape() {
        let keys = test_keys();
        let url = reqwest::Url::parse("https://fcm.googleapis.com/fcm/send/abc123").unwrap();
        let header = vapid_authorization(&keys, &url).unwrap();
        assert!(header.starts_with("vapid t="));
        assert!(header.contains(&format!("k={}", keys.public_key)));
        // Three JWT segments.
        let token = header
            .split("t=")
            .nth(1)
            .unwrap()
            .split(',')
            .next()
            .unwrap();
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn encrypted_payload_has_rfc8188_header() {
        let (p256dh, auth) = test_subscription_keys();
        let body = encrypt_payload(&p256dh, &auth, b"{\"title\":\"hi\"}").unwrap();

        // salt(16) + rs(4) + idlen(1) + keyid(65) + ciphertext(payload + delimiter + tag)
        assert_eq!(u32::from_be_bytes(body[16..20].try_into().unwrap()), 4096);
        assert_eq!(body[20], 65);
        assert_eq!(body[21], 0x04); // uncompressed point marker
        let expected = 16 + 4 + 1 + 65 + (14 + 1 + 16);
        assert_eq!(body.len(), expected);
    }

    #[test]
    fn encryption_rejects_bad_key_material() {
        assert!(encrypt_payload("not-base64!!!", "AAAA", b"x").is_err());
        let (p256dh, _) = test_subscription_keys();
        // auth secret of the wrong length
        assert!(encrypt_payload(&p256dh, "c2hvcnQ", b"x").is_err());
    }

    #[test]
    fn key_decoding_accepts_padded_and_standard() {
        let (p256dh, _) = test_subscription_keys();
        let decoded = decode_key(&p256dh).unwrap();
        assert_eq!(decoded.len(), 65);

        let padded = format!("{}=", p256dh);
        assert_eq!(decode_key(&padded).unwrap(), decoded);
    }
}
