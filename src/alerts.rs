// =============================================================================
// AlertManager — multi-channel webhook fan-out with per-key dedup.
// =============================================================================
//
// Ported from `backend/alerts.py`. Every alert is persisted regardless of
// delivery outcome (`channel="none"` if nothing is configured, `"disabled"`
// if alerting is off globally); a dedup window suppresses repeat sends for
// the same `dedup_key` within `dedup_ttl_ms`.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;

use crate::config::AlertsConfig;
use crate::db::Database;
use crate::models::Alert;

pub struct AlertManager {
    db: std::sync::Arc<Database>,
    config: AlertsConfig,
    client: reqwest::Client,
    dedup: Mutex<HashMap<String, i64>>,
}

impl AlertManager {
    pub fn new(db: std::sync::Arc<Database>, config: AlertsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build alert http client");
        Self { db, config, client, dedup: Mutex::new(HashMap::new()) }
    }

    pub async fn alert(&self, level: &str, title: &str, message: &str, dedup_key: Option<&str>) {
        let now_ms = now_millis();

        if let Some(key) = dedup_key {
            let mut dedup = self.dedup.lock();
            if let Some(&last) = dedup.get(key) {
                if now_ms - last < self.config.dedup_ttl_ms {
                    return;
                }
            }
            dedup.insert(key.to_string(), now_ms);
        }

        let full_message = if title.is_empty() { message.to_string() } else { format!("{title}: {message}") };

        if !self.config.enabled {
            self.insert_alert("disabled", level, &full_message, dedup_key, now_ms).await;
            return;
        }

        let mut channels_sent = 0u32;

        if self.config.telegram.enabled {
            let ok = self.send_telegram(&full_message).await;
            channels_sent += ok as u32;
            self.insert_alert("telegram", level, &full_message, dedup_key, now_ms).await;
        }

        if self.config.bark.enabled {
            let ok = self.send_bark(title, message).await;
            channels_sent += ok as u32;
            self.insert_alert("bark", level, &full_message, dedup_key, now_ms).await;
        }

        if self.config.wecom.enabled {
            let ok = self.send_wecom(&full_message).await;
            channels_sent += ok as u32;
            self.insert_alert("wecom", level, &full_message, dedup_key, now_ms).await;
        }

        if channels_sent == 0 {
            self.insert_alert("none", level, &full_message, dedup_key, now_ms).await;
        }
    }

    async fn insert_alert(&self, channel: &str, level: &str, message: &str, dedup_key: Option<&str>, now_ms: i64) {
        let record = Alert {
            timestamp: now_ms,
            channel: channel.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            dedup_key: dedup_key.map(str::to_string),
            created_at: now_ms,
        };
        if let Err(err) = self.db.insert_alert(&record).await {
            warn!(%err, "insert alert failed");
        }
    }

    async fn send_telegram(&self, message: &str) -> bool {
        let (token, chat_id) = (&self.config.telegram.token, &self.config.telegram.chat_id);
        if token.is_empty() || chat_id.is_empty() {
            warn!("telegram alert enabled but token/chat_id missing");
            return false;
        }
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        self.post_json(&url, &json!({"chat_id": chat_id, "text": message}), "telegram").await
    }

    async fn send_bark(&self, title: &str, message: &str) -> bool {
        let (url, key) = (self.config.bark.url.trim_end_matches('/'), &self.config.bark.key);
        if url.is_empty() || key.is_empty() {
            warn!("bark alert enabled but url/key missing");
            return false;
        }
        let endpoint = format!("{url}/{key}");
        self.post_json(&endpoint, &json!({"title": title, "body": message}), "bark").await
    }

    async fn send_wecom(&self, message: &str) -> bool {
        if self.config.wecom.webhook.is_empty() {
            warn!("wecom alert enabled but webhook missing");
            return false;
        }
        let payload = json!({"msgtype": "text", "text": {"content": message}});
        self.post_json(&self.config.wecom.webhook, &payload, "wecom").await
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value, channel: &str) -> bool {
        match self.client.post(url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(channel, status = %resp.status(), "alert send failed");
                false
            }
            Err(err) => {
                warn!(channel, %err, "alert send failed");
                false
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_suppresses_repeat_alert_within_ttl() {
        let db = std::sync::Arc::new(Database::connect_in_memory().await.unwrap());
        db.init_schema().await.unwrap();
        let config = AlertsConfig { enabled: false, dedup_ttl_ms: 60_000, ..Default::default() };
        let mgr = AlertManager::new(db.clone(), config);

        mgr.alert("INFO", "TEST", "first", Some("k1")).await;
        mgr.alert("INFO", "TEST", "second", Some("k1")).await;

        let dedup = mgr.dedup.lock();
        assert_eq!(dedup.len(), 1);
    }
}
