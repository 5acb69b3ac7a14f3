//! Rate-limited REST transport.
//!
//! Generalizes `scrapers::dome_tracker::DomeClient`: a `reqwest::Client`
//! wrapped with exponential-backoff retry on 5xx/network errors, except the
//! throttle gate is now the shared [`RateLimiter`] (keyed per limit id)
//! instead of a single fixed inter-request delay.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};
use crate::rate_limiter::RateLimiter;

const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(16);

pub struct RestAssistant {
    client: Client,
    rate_limiter: std::sync::Arc<RateLimiter>,
}

impl RestAssistant {
    pub fn new(rate_limiter: std::sync::Arc<RateLimiter>) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Misconfigured(format!("building http client: {e}")))?;
        Ok(Self { client, rate_limiter })
    }

    /// GET `url` after acquiring `limit_id`, retrying transient failures
    /// with exponential backoff. Returns the response body on success.
    pub async fn get(&self, url: &str, limit_id: &str) -> PipelineResult<String> {
        self.rate_limiter.acquire(limit_id).await;

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_RETRIES {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    } else if status.as_u16() == 429 {
                        warn!(url, attempt, "429 from exchange REST, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    } else if status.is_server_error() {
                        warn!(url, attempt, backoff_ms = backoff.as_millis() as u64, "server error, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(PipelineError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "request failed");
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    } else {
                        return Err(e.into());
                    }
                }
            }
        }

        Err(PipelineError::Network(format!("max retries exceeded for {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimit;

    #[tokio::test]
    async fn get_against_unreachable_host_returns_network_error() {
        let limiter = std::sync::Arc::new(RateLimiter::new(
            vec![RateLimit::new("x", 100, Duration::from_secs(1))],
            0.0,
            Duration::from_millis(10),
        ));
        let assistant = RestAssistant::new(limiter).unwrap();
        let result = assistant.get("http://127.0.0.1:1", "x").await;
        assert!(result.is_err());
    }
}
