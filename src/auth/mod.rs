use chrono::{Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::{Session, User};

const SESSION_DURATION_HOURS: i64 = 4;

pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub async fn create_session(
    pool: &SqlitePool,
    user_id: i64,
    user_agent: Option<&str>,
    ip_address: Option<&str>,
) -> Result<String, sqlx::Error> {
    let token = generate_token();
    let token_hash = hash_token(&token);
    let expires_at = (Utc::now() + Duration::hours(SESSION_DURATION_HOURS)).to_rfc3339();

    sqlx::query(
        "INSERT INTO sessions (user_id, token_hash, expires_at, user_agent, ip_address)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&token_hash)
    .bind(&expires_at)
    .bind(user_agent)
    .bind(ip_address)
    .execute(pool)
    .await?;

    Ok(token)
}

pub async fn validate_session(pool: &SqlitePool, token: &str) -> Result<Option<User>, sqlx::Error> {
    let token_hash = hash_token(token);
    let now = Utc::now().to_rfc3339();

    let session: Option<Session> = sqlx::query_as(
        "SELECT id, user_id, token_hash, created_at, expires_at, user_agent, ip_address
         FROM sessions WHERE token_hash = ? AND expires_at > ?",
    )
    .bind(&token_hash)
    .bind(&now)
    .fetch_optional(pool)
    .await?;

    match session {
        Some(s) => {
            sqlx::query_as::<_, User>("SELECT id, username FROM users WHERE id = ?")
                .bind(s.user_id)
                .fetch_optional(pool)
                .await
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn tokens_are_unique_and_hashes_stable() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(hash_token(&a), hash_token(&a));
        assert_ne!(hash_token(&a), hash_token(&b));
    }

    #[tokio::test]
    async fn session_round_trip() {
        let pool = db::test_pool().await;
        sqlx::query("INSERT INTO users (username) VALUES ('admin')")
            .execute(&pool)
            .await
            .unwrap();

        let token = create_session(&pool, 1, Some("test-agent"), Some("203.0.113.9"))
            .await
            .unwrap();

        let user = validate_session(&pool, &token).await.unwrap();
        assert_eq!(user.unwrap().username, "admin");

        assert!(validate_session(&pool, "bogus").await.unwrap().is_none());
    }
}
