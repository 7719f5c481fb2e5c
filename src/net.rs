//! External collaborators: game transport, alerting, reporting.
//!
//! Defines the `GameClient` trait the trading logic is written against,
//! plus thin production implementations: a cookie-carrying reqwest
//! session for the game server, a Discord webhook alert sink, and a
//! tracing-backed reporter. Tests substitute deterministic in-memory
//! implementations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::types::AgentError;

// ---------------------------------------------------------------------------
// Game transport
// ---------------------------------------------------------------------------

/// Abstraction over the game's HTTP surface.
///
/// Paths are relative to the world base URL, e.g.
/// `game.php?village=555&screen=market&mode=own_offer`. State-mutating
/// posts must carry the session validation token (`h`).
#[async_trait]
pub trait GameClient: Send + Sync {
    /// Fetch a game screen and return its raw page text.
    async fn get_screen(&self, path: &str) -> Result<String>;

    /// Post a form to a game action and return the raw response body.
    async fn post_action(&self, path: &str, form: &[(String, String)]) -> Result<String>;

    /// Session validation token required on mutating posts.
    fn csrf_token(&self) -> &str;
}

/// Authenticated browser session against one game world.
///
/// Session establishment (login flow) is outside this crate; the session
/// cookie and csrf token are injected from the environment.
pub struct HttpSession {
    http: Client,
    base_url: String,
    cookie: String,
    csrf_token: String,
}

impl HttpSession {
    pub fn new(base_url: &str, cookie: String, csrf_token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) QUARTERMASTER/0.1.0")
            .build()
            .context("Failed to build HTTP client for game session")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookie,
            csrf_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl GameClient for HttpSession {
    async fn get_screen(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        debug!(url = %url, "GET game screen");

        let resp = self
            .http
            .get(&url)
            .header("Cookie", &self.cookie)
            .send()
            .await
            .context("Game screen request failed")?;

        if !resp.status().is_success() {
            return Err(AgentError::Http {
                status: resp.status().as_u16(),
                url,
            }
            .into());
        }

        resp.text().await.context("Failed to read game screen body")
    }

    async fn post_action(&self, path: &str, form: &[(String, String)]) -> Result<String> {
        let url = self.url(path);
        debug!(url = %url, "POST game action");

        let resp = self
            .http
            .post(&url)
            .header("Cookie", &self.cookie)
            .form(form)
            .send()
            .await
            .context("Game action post failed")?;

        if !resp.status().is_success() {
            return Err(AgentError::Http {
                status: resp.status().as_u16(),
                url,
            }
            .into());
        }

        resp.text().await.context("Failed to read game action response")
    }

    fn csrf_token(&self) -> &str {
        &self.csrf_token
    }
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

/// Sink for human-facing alerts (favourable premium rates).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Discord webhook alert delivery.
pub struct DiscordWebhook {
    http: Client,
    webhook_url: String,
}

impl DiscordWebhook {
    pub fn new(webhook_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client for Discord webhook")?;
        Ok(Self { http, webhook_url })
    }
}

#[async_trait]
impl AlertSink for DiscordWebhook {
    async fn send(&self, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await
            .context("Discord webhook request failed")?;

        if !resp.status().is_success() {
            return Err(AgentError::Alert(format!(
                "webhook returned {}",
                resp.status()
            ))
            .into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Sink for per-settlement activity reports.
pub trait Reporter: Send + Sync {
    fn report(&self, settlement_id: u64, tag: &str, message: &str);
}

/// Reporter that emits structured log records.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, settlement_id: u64, tag: &str, message: &str) {
        info!(settlement_id, tag, "{message}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url_joining() {
        let session = HttpSession::new(
            "https://en130.example-world.net/",
            "sid=abc".to_string(),
            "1a2b3c".to_string(),
        )
        .unwrap();
        assert_eq!(
            session.url("/game.php?village=1&screen=market"),
            "https://en130.example-world.net/game.php?village=1&screen=market"
        );
        assert_eq!(session.csrf_token(), "1a2b3c");
    }
}
