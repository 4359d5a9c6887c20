//! Operator notifications (`SPEC_FULL.md` §4.9, grounded on the stack's
//! own `notify.py`).
//!
//! Every channel is fire-and-forget: a failed send is logged and
//! swallowed, never propagated, so a flaky mail relay or Telegram outage
//! can never stall the Scheduler, Watchdog, or Auto-Reoptimizer loops
//! that call into this module.

use std::env;

use async_trait::async_trait;
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{error, info, warn};

/// One outbound channel an event can be sent over.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `subject`/`body`. Implementations must never return an error
    /// to the caller -- log and return instead.
    async fn notify(&self, subject: &str, body: &str);
}

/// SMTP configuration read from the environment, mirroring the stack's
/// own `SMTP_SERVER`/`SMTP_PORT`/`SMTP_USER`/`SMTP_PASSWORD`/`EMAIL_FROM`/
/// `EMAIL_TO` variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

impl EmailConfig {
    /// Read from the environment. Returns `None` if any required field
    /// is missing, matching the original's "config missing, skip" check.
    pub fn from_env() -> Option<Self> {
        let server = env::var("SMTP_SERVER").ok()?;
        let user = env::var("SMTP_USER").ok()?;
        let password = env::var("SMTP_PASSWORD").ok()?;
        let from = env::var("EMAIL_FROM").ok()?;
        let to: Vec<String> = env::var("EMAIL_TO")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
        if to.is_empty() {
            return None;
        }
        let port = env::var("SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587);
        Some(Self {
            server,
            port,
            user,
            password,
            from,
            to,
        })
    }
}

/// Sends notifications over SMTP with STARTTLS, via `lettre`.
pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    async fn try_send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let mut builder = Message::builder()
            .from(self.config.from.parse()?)
            .subject(subject);
        for addr in &self.config.to {
            builder = builder.to(addr.parse()?);
        }
        let message = builder.body(body.to_owned())?;

        let creds = Credentials::new(self.config.user.clone(), self.config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.server)?
            .port(self.config.port)
            .credentials(creds)
            .build();

        transport.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        match self.try_send(subject, body).await {
            Ok(()) => info!(subject, "email sent"),
            Err(err) => error!(subject, %err, "failed to send email"),
        }
    }
}

/// Telegram configuration read from the environment.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn from_env() -> Option<Self> {
        let bot_token = env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(Self { bot_token, chat_id })
    }
}

/// Sends notifications to a Telegram chat via the Bot HTTP API.
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

    async fn try_send(&self, message: &str) -> anyhow::Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.config.bot_token
        );
        let resp = self
            .client
            .post(url)
            .form(&[("chat_id", self.config.chat_id.as_str()), ("text", message)])
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram API returned an error: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let message = format!("{subject}\n{body}");
        match self.try_send(&message).await {
            Ok(()) => info!(preview = &message[..message.len().min(80)], "telegram sent"),
            Err(err) => error!(%err, "failed to send telegram message"),
        }
    }
}

/// Fans a single notification out to every configured channel. Channels
/// with missing configuration are skipped with a warning rather than
/// included, matching the original's per-channel guard.
pub struct CompositeNotifier {
    channels: Vec<Box<dyn Notifier>>,
}

impl CompositeNotifier {
    /// Build from the environment, warning for each channel left
    /// unconfigured. Always succeeds, even with zero channels.
    pub fn from_env() -> Self {
        let mut channels: Vec<Box<dyn Notifier>> = Vec::new();

        match EmailConfig::from_env() {
            Some(config) => channels.push(Box::new(EmailNotifier::new(config))),
            None => warn!("email notifications disabled: SMTP/recipient config missing"),
        }

        match TelegramConfig::from_env() {
            Some(config) => channels.push(Box::new(TelegramNotifier::new(config))),
            None => warn!("telegram notifications disabled: bot token or chat id missing"),
        }

        Self { channels }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        for channel in &self.channels {
            channel.notify(subject, body).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_config_requires_every_field() {
        // SAFETY: single-threaded test, no other test in this module
        // touches these env vars.
        unsafe {
            env::remove_var("SMTP_SERVER");
            env::remove_var("SMTP_USER");
            env::remove_var("SMTP_PASSWORD");
            env::remove_var("EMAIL_FROM");
            env::remove_var("EMAIL_TO");
        }
        assert!(EmailConfig::from_env().is_none());
    }

    #[test]
    fn email_config_parses_comma_separated_recipients() {
        unsafe {
            env::set_var("SMTP_SERVER", "smtp.example.com");
            env::set_var("SMTP_USER", "bot");
            env::set_var("SMTP_PASSWORD", "secret");
            env::set_var("EMAIL_FROM", "bot@example.com");
            env::set_var("EMAIL_TO", " a@example.com, b@example.com ,");
        }
        let config = EmailConfig::from_env().expect("config should be present");
        assert_eq!(config.to, vec!["a@example.com", "b@example.com"]);
        assert_eq!(config.port, 587);
        unsafe {
            env::remove_var("SMTP_SERVER");
            env::remove_var("SMTP_USER");
            env::remove_var("SMTP_PASSWORD");
            env::remove_var("EMAIL_FROM");
            env::remove_var("EMAIL_TO");
        }
    }

    #[test]
    fn telegram_config_requires_both_fields() {
        unsafe {
            env::remove_var("TELEGRAM_BOT_TOKEN");
            env::remove_var("TELEGRAM_CHAT_ID");
        }
        assert!(TelegramConfig::from_env().is_none());
    }
}
