//! Bearer tokens for the speech socket
//!
//! Tokens come from the STS `issueToken` endpoint and are valid for 10 minutes.
//! A renewal task refetches them on an interval; a session only reads the
//! current token when it connects.

use reqwest::Client;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::streaming::SpeechError;

const STS_PATH: &str = "sts/v1.0/issueToken";
const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// Source of the bearer token used at connect time
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> Option<String>;
}

/// A token obtained out of band (e.g. `--token` on the command line)
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn current_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Token issuing endpoint for a region (legacy: the global endpoint)
pub fn sts_url(region: &str, legacy: bool) -> String {
    if legacy {
        format!("https://api.cognitive.microsoft.com/{}", STS_PATH)
    } else {
        format!("https://{}.api.cognitive.microsoft.com/{}", region, STS_PATH)
    }
}

/// Exchanges a subscription key for bearer tokens
#[derive(Clone)]
pub struct StsTokenClient {
    http: Client,
    url: String,
    subscription_key: String,
    token: Arc<RwLock<String>>,
}

impl StsTokenClient {
    /// Fetch the first token for `region`
    ///
    /// # Returns
    /// * `Ok(StsTokenClient)` - Holding a valid token
    /// * `Err(SpeechError::Auth)` - Key rejected or endpoint unreachable
    pub async fn authenticate(
        subscription_key: &str,
        region: &str,
        legacy: bool,
    ) -> Result<Self, SpeechError> {
        Self::authenticate_at(sts_url(region, legacy), subscription_key).await
    }

    pub async fn authenticate_at(
        url: impl Into<String>,
        subscription_key: &str,
    ) -> Result<Self, SpeechError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SpeechError::Auth(e.to_string()))?;

        let client = Self {
            http,
            url: url.into(),
            subscription_key: subscription_key.to_string(),
            token: Arc::new(RwLock::new(String::new())),
        };
        client.refresh().await?;
        Ok(client)
    }

    /// Fetch a new token and replace the current one
    pub async fn refresh(&self) -> Result<(), SpeechError> {
        log::debug!("Requesting token from {}", self.url);

        let response = self
            .http
            .post(&self.url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .body("")
            .send()
            .await
            .map_err(|e| SpeechError::Auth(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SpeechError::Auth(e.to_string()))?;

        if !status.is_success() {
            return Err(SpeechError::Auth(format!(
                "token request failed ({}): {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let token = body.trim();
        if token.is_empty() {
            return Err(SpeechError::Auth("empty token in response".to_string()));
        }

        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token.to_string();
        log::info!("Speech token refreshed ({} chars)", token.len());
        Ok(())
    }

    /// Refetch the token every `interval` until the handle is aborted.
    /// Failures are logged and the previous token stays in place.
    pub fn spawn_renewal(&self, interval: Duration) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = client.refresh().await {
                    log::warn!("Token renewal failed, keeping previous token: {}", e);
                }
            }
        })
    }
}

impl TokenProvider for StsTokenClient {
    fn current_token(&self) -> Option<String> {
        let token = self.token.read().unwrap_or_else(|e| e.into_inner());
        (!token.is_empty()).then(|| token.clone())
    }
}
