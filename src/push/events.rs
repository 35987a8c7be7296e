use async_trait::async_trait;
use serde_json::json;

use crate::firewall::BlockEventSink;

use super::NotifierService;

/// The notifier's inbound event surface. Other subsystems reach it through
/// these hooks (registered at init), never by importing the notifier.
impl NotifierService {
    pub async fn on_node_status_change(&self, node_name: &str, online: bool) {
        let state = if online { "online" } else { "offline" };
        let payload = json!({
            "type": "node_status",
            "title": format!("Node {}", state),
            "body": format!("{} is now {}", node_name, state),
        });
        if let Err(e) = self.send_notification("node_status", payload).await {
            tracing::warn!(error = %e, node = %node_name, "node status notification failed");
        }
    }

    pub async fn on_login_new_device(&self, user_id: i64, user_agent: &str, source_ip: &str) {
        if let Err(e) = self.notify_new_login(user_id, user_agent, source_ip).await {
            tracing::warn!(error = %e, user = user_id, "new-login notification failed");
        }
    }
}

#[async_trait]
impl BlockEventSink for NotifierService {
    async fn on_firewall_block(&self, value: &str, jail: &str, reason: &str) {
        let payload = json!({
            "type": "firewall_block",
            "title": "Address blocked",
            "body": format!("{} blocked by {}: {}", value, jail, reason),
        });
        if let Err(e) = self.send_notification("firewall_block", payload).await {
            tracing::warn!(error = %e, value = %value, "block notification failed");
        }
    }
}
