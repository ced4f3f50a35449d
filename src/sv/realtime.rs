//! Client for the upstream realtime-voice session API.

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
  pub api_url: String,
  pub api_key: String,
  pub model: String,
  pub voice: String,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      api_url: String::from("https://api.openai.com/v1"),
      api_key: String::new(),
      model: String::from("gpt-4o-realtime-preview"),
      voice: String::from("verse"),
    }
  }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
  client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
  value: String,
}

pub struct Realtime<'a> {
  client: &'a Client,
  config: &'a RealtimeConfig,
}

impl<'a> Realtime<'a> {
  pub fn new(client: &'a Client, config: &'a RealtimeConfig) -> Self {
    Self { client, config }
  }

  /// Mints an ephemeral key the browser uses to talk to the voice API
  /// directly. Our own key never leaves the server.
  pub async fn ephemeral_key(&self) -> Result<String> {
    if self.config.api_key.is_empty() {
      return Err(Error::UpstreamAuth);
    }

    let base = self.config.api_url.trim_end_matches('/');
    let url = format!("{base}/realtime/sessions");

    let response = self
      .client
      .post(&url)
      .bearer_auth(&self.config.api_key)
      .json(&json::json!({
        "model": self.config.model,
        "voice": self.config.voice,
      }))
      .send()
      .await
      .map_err(|err| Error::Upstream(err.to_string()))?;

    match response.status() {
      StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
        warn!("Realtime API rejected our credentials");
        Err(Error::UpstreamAuth)
      }
      status if !status.is_success() => {
        warn!("Realtime API answered {status}");
        Err(Error::Upstream(format!("status {status}")))
      }
      _ => {
        let body: SessionResponse = response
          .json()
          .await
          .map_err(|err| Error::Upstream(format!("bad session body: {err}")))?;
        Ok(body.client_secret.value)
      }
    }
  }
}
