pub mod blocklist;
pub mod country;
pub mod docker;
pub mod jail;
pub mod nft;
pub mod store;
pub mod traffic;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::ApiResult;

/// One-way event interface into the push notifier; registered at init so the
/// firewall never imports the notifier directly.
#[async_trait]
pub trait BlockEventSink: Send + Sync {
    async fn on_firewall_block(&self, value: &str, jail: &str, reason: &str);
}

/// Shared state for the jail engine, policy store, ruleset compiler and
/// country-zone manager. Functionality is split across the sibling modules;
/// they all hang methods off this one type.
pub struct FirewallService {
    pub(crate) pool: SqlitePool,
    pub(crate) cfg: Settings,
    pub(crate) http: reqwest::Client,
    apply_tx: mpsc::Sender<()>,
    /// Jail id → running tailer task. Only the HTTP layer mutates this.
    pub(crate) jails: Mutex<HashMap<i64, JoinHandle<()>>>,
    pub(crate) dns_cache: traffic::DnsCache,
    block_sink: RwLock<Option<Arc<dyn BlockEventSink>>>,
    pub(crate) last_applied: RwLock<Option<String>>,
    /// Serializes kernel installs: the debounced worker and the synchronous
    /// callers (imports, SSH port changes) must not interleave `nft -f` runs.
    pub(crate) apply_lock: Mutex<()>,
    /// Back-reference handed to spawned monitor tasks.
    pub(crate) weak: Weak<FirewallService>,
}

impl FirewallService {
    /// Returns the service plus the receiving half of the apply-signal
    /// channel; the caller hands the receiver to [`nft::run_apply_worker`].
    pub fn new(pool: SqlitePool, cfg: Settings) -> (Arc<Self>, mpsc::Receiver<()>) {
        // Single-slot channel: any number of request_apply calls while a
        // rebuild is in flight coalesce into one more rebuild.
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let dns_cache = traffic::DnsCache::new(traffic::DNS_CACHE_CAPACITY);
        let svc = Arc::new_cyclic(|weak| FirewallService {
            pool,
            cfg,
            http: reqwest::Client::new(),
            apply_tx,
            jails: Mutex::new(HashMap::new()),
            dns_cache,
            block_sink: RwLock::new(None),
            last_applied: RwLock::new(None),
            apply_lock: Mutex::new(()),
            weak: weak.clone(),
        });
        (svc, apply_rx)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Non-blocking signal that the kernel ruleset is stale.
    pub fn request_apply(&self) {
        let _ = self.apply_tx.try_send(());
    }

    pub async fn register_block_sink(&self, sink: Arc<dyn BlockEventSink>) {
        *self.block_sink.write().await = Some(sink);
    }

    pub(crate) async fn notify_block(&self, value: &str, jail: &str, reason: &str) {
        let sink = self.block_sink.read().await.clone();
        if let Some(sink) = sink {
            sink.on_firewall_block(value, jail, reason).await;
        }
    }

    /// Startup sequence: seed system-owned rows, reconcile docker-published
    /// ports, then request the first compile.
    pub async fn init(&self) -> ApiResult<()> {
        self.seed_essential_entries().await?;
        self.seed_default_jails().await?;
        if let Err(e) = self.sync_docker_entries().await {
            tracing::warn!(error = %e, "docker introspection failed; continuing without container entries");
        }
        self.request_apply();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_service() -> Arc<FirewallService> {
    let pool = crate::db::test_pool().await;
    let (svc, _rx) = FirewallService::new(pool, crate::config::test_settings());
    svc
}
