//! Alert delivery — where watchdog and supervisor escalations go.

use std::fmt;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::TelegramConfig;
use crate::error::NotifyError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// A message for a human.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub body: String,
    pub session_id: Option<String>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            body: body.into(),
            session_id: None,
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn render(&self) -> String {
        match &self.session_id {
            Some(sid) => format!("[{}] {} (session {sid})\n\n{}", self.level, self.title, self.body),
            None => format!("[{}] {}\n\n{}", self.level, self.title, self.body),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log. The fallback when nothing else is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.level {
            AlertLevel::Warning => tracing::warn!(
                session_id = alert.session_id.as_deref().unwrap_or("-"),
                title = %alert.title,
                "{}", alert.body
            ),
            AlertLevel::Critical => tracing::error!(
                session_id = alert.session_id.as_deref().unwrap_or("-"),
                title = %alert.title,
                "{}", alert.body
            ),
        }
        Ok(())
    }
}

/// Forwards alerts into an in-process channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    fn name(&self) -> &str {
        "channel"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.tx.send(alert.clone()).map_err(|_| NotifyError::SendFailed {
            notifier: "channel".into(),
            reason: "receiver dropped".into(),
        })
    }
}

/// Sends alerts to a Telegram chat through the Bot API.
pub struct TelegramNotifier {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.config.bot_token.expose_secret()
        )
    }

    async fn send_chunk(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                notifier: "telegram".into(),
                // reqwest errors embed the URL, which carries the token
                reason: e.without_url().to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed {
                notifier: "telegram".into(),
                reason: format!("sendMessage returned {status}: {detail}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        for chunk in split_message(&alert.render(), TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(&chunk).await?;
        }
        tracing::debug!(title = %alert.title, "Alert delivered to Telegram");
        Ok(())
    }
}

/// Telegram when configured, the log otherwise.
pub fn notifier_from_env() -> Result<Box<dyn Notifier>, crate::error::ConfigError> {
    Ok(match TelegramConfig::from_env()? {
        Some(config) => Box::new(TelegramNotifier::new(config)),
        None => Box::new(LogNotifier),
    })
}

/// Split on newlines or spaces so each chunk fits `max_len` bytes.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_level_and_session() {
        let alert = Alert::new(AlertLevel::Critical, "Session looping", "5 identical calls")
            .for_session("s1");
        let text = alert.render();
        assert!(text.starts_with("[CRITICAL] Session looping (session s1)"));
        assert!(text.ends_with("5 identical calls"));
    }

    #[tokio::test]
    async fn channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new();
        let alert = Alert::new(AlertLevel::Warning, "t", "b");
        notifier.notify(&alert).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), alert);
    }

    #[tokio::test]
    async fn channel_notifier_errors_without_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        let err = notifier
            .notify(&Alert::new(AlertLevel::Warning, "t", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::SendFailed { .. }));
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello", 4096), vec!["Hello"]);
    }

    #[test]
    fn split_message_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_hard_cut() {
        let chunks = split_message(&"a".repeat(5000), 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "é".repeat(3000);
        let chunks = split_message(&msg, 4096);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), msg);
    }
}
