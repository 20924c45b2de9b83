/// notify.rs — Telegram notifications
///
///   POST {api}/bot{token}/sendMessage   chat_id, text   (form encoded)
///
/// Sent by the relay after every forwarded order, whatever its outcome.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::config::AppConfig;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Fire-and-forget Telegram messages. Disabled when token or chat id is
/// missing; delivery failures are logged, never returned.
pub struct TelegramNotifier {
    client:   Client,
    api_base: String,
    token:    String,
    chat_id:  String,
}

impl TelegramNotifier {
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: TELEGRAM_API.into(),
            token:    cfg.telegram_token.clone(),
            chat_id:  cfg.telegram_chat_id.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty() && !self.chat_id.is_empty()
    }

    /// Returns whether the message was accepted by Telegram.
    pub async fn send(&self, text: &str) -> bool {
        if !self.is_enabled() {
            debug!("telegram disabled, dropping: {text}");
            return false;
        }
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let form = [("chat_id", self.chat_id.as_str()), ("text", text)];
        match self.client.post(&url).form(&form).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("telegram sendMessage returned HTTP {}", resp.status());
                false
            }
            Err(e) => {
                warn!("telegram sendMessage failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_without_credentials() {
        let notifier = TelegramNotifier::new(&AppConfig::default()).unwrap();
        assert!(!notifier.is_enabled());
        assert!(!notifier.send("hello").await);
    }

    #[test]
    fn enabled_with_token_and_chat() {
        let cfg = AppConfig {
            telegram_token: "123:abc".into(),
            telegram_chat_id: "42".into(),
            ..AppConfig::default()
        };
        assert!(TelegramNotifier::new(&cfg).unwrap().is_enabled());
    }
}
