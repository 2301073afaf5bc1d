//! SMTP ban-notification mailer (spec §4.5 step 7, §4.8 "Mail config
//! API surface").
//!
//! Config-driven: when disabled or unconfigured, `notify_ban` is a no-op
//! so the Ban Orchestrator never blocks a ban on mail delivery.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use tokio::sync::RwLock;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_addresses: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            to_addresses: Vec::new(),
        }
    }
}

pub struct Mailer {
    path: PathBuf,
    config: RwLock<MailConfig>,
    templates: Tera,
}

const BAN_NOTIFICATION_TEMPLATE: &str = r#"
<html>
<body>
<h2>IP banned</h2>
<p><strong>IP:</strong> {{ ip }}</p>
<p><strong>Reason:</strong> {{ reason }}</p>
<p><strong>Timestamp:</strong> {{ timestamp }}</p>
</body>
</html>
"#;

impl Mailer {
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        let config = Self::read_or_create(&path).await?;
        let mut templates = Tera::default();
        templates.add_raw_template("ban_notification.html", BAN_NOTIFICATION_TEMPLATE)?;
        Ok(Arc::new(Self {
            path,
            config: RwLock::new(config),
            templates,
        }))
    }

    async fn read_or_create(path: &Path) -> anyhow::Result<MailConfig> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, serde_json::to_vec_pretty(&MailConfig::default())?).await?;
        }
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub async fn get_config(&self) -> MailConfig {
        self.config.read().await.clone()
    }

    pub async fn replace_config(&self, config: MailConfig) -> AppResult<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&config).map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::write(&tmp, bytes).await.map_err(|e| AppError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| AppError::Store(e.to_string()))?;
        *self.config.write().await = config;
        Ok(())
    }

    /// Best-effort: a mail failure never fails the ban it's reporting.
    pub async fn notify_ban(&self, ip: &str, reason: &str) {
        let config = self.config.read().await.clone();
        if !config.enabled || config.smtp_host.is_empty() || config.to_addresses.is_empty() {
            return;
        }
        if let Err(e) = self.send_ban_notification(&config, ip, reason).await {
            tracing::warn!(%ip, error = %e, "ban notification e-mail failed");
        }
    }

    async fn send_ban_notification(&self, config: &MailConfig, ip: &str, reason: &str) -> anyhow::Result<()> {
        let mut ctx = Context::new();
        ctx.insert("ip", ip);
        ctx.insert("reason", reason);
        ctx.insert("timestamp", &chrono::Utc::now().to_rfc3339());
        let body = self.templates.render("ban_notification.html", &ctx)?;

        let mut builder = Message::builder()
            .from(config.from_address.parse()?)
            .subject(format!("nginx-shield: banned {ip}"));
        for to in &config.to_addresses {
            builder = builder.to(to.parse()?);
        }
        let email = builder.header(ContentType::TEXT_HTML).body(body)?;

        let creds = SmtpCredentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        transport.send(email).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_config_skips_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mailer = Mailer::load(dir.path().join("mail.json")).await.unwrap();
        mailer.notify_ban("1.2.3.4", "test").await;
    }

    #[tokio::test]
    async fn replace_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mailer = Mailer::load(dir.path().join("mail.json")).await.unwrap();
        let mut config = mailer.get_config().await;
        config.enabled = true;
        config.smtp_host = "smtp.example.com".into();
        mailer.replace_config(config).await.unwrap();
        assert!(mailer.get_config().await.enabled);
    }
}
