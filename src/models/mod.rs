use serde::{Deserialize, Serialize};

/// Unified firewall rule: a single IP, a CIDR range, a country or a port.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FirewallEntry {
    pub id: i64,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
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
    pub hit_count: i64,
    pub created_at: String,
    pub escalated_from: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Jail {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub log_file: String,
    pub filter_regex: String,
    pub max_retry: i64,
    pub find_time: i64,
    pub ban_time: i64,
    pub port: Option<String>,
    pub action: String,
    pub last_log_pos: i64,
    pub escalate_enabled: bool,
    pub escalate_threshold: i64,
    pub escalate_window: i64,
}

/// One row per matched log line, for auditing. Capped table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attempt {
    pub id: i64,
    pub timestamp: String,
    pub source_ip: String,
    pub dest_port: Option<i64>,
    pub protocol: String,
    pub jail_name: String,
    pub action: String,
}

/// VPN client outbound connection record. Capped table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficLog {
    pub id: i64,
    pub timestamp: String,
    pub client_ip: String,
    pub dest_ip: String,
    pub dest_port: i64,
    pub protocol: String,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PushSubscription {
    pub id: i64,
    pub user_id: i64,
    pub device_name: String,
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub key_p256dh: String,
    #[serde(skip_serializing)]
    pub key_auth: String,
    pub user_agent: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub token_hash: String,
    pub created_at: String,
    pub expires_at: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}
