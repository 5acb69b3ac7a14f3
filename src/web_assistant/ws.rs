//! WebSocket transport with reconnect/backoff and heartbeat monitoring.
//!
//! Backoff-with-jitter is lifted from `scrapers::binance_session::
//! BackoffCalculator` (xorshift64 PRNG, `base * multiplier^attempt` capped
//! and jittered); this module narrows that full session state machine
//! down to what the tracker/funding loops actually need: connect, send,
//! receive, and a staleness/pong timeout that a caller can await on.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Exponential backoff with jitter, reset on every successful connect.
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            multiplier: 2.0,
            jitter_factor: 0.3,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(12345),
        }
    }

    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.base_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.base_ms as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// One WS connection: connect, send, receive with a message timeout,
/// disconnect. Reconnect policy (backoff, resubscribe) is the caller's
/// responsibility — this type owns only the live socket.
pub struct WsAssistant {
    stream: Option<WsStream>,
    message_timeout: Duration,
    last_message_at: Instant,
}

impl WsAssistant {
    pub fn new(message_timeout: Duration) -> Self {
        Self {
            stream: None,
            message_timeout,
            last_message_at: Instant::now(),
        }
    }

    pub async fn connect(&mut self, url: &str, connect_timeout: Duration) -> PipelineResult<()> {
        let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| PipelineError::Timeout(connect_timeout))??;
        self.stream = Some(stream);
        self.last_message_at = Instant::now();
        Ok(())
    }

    pub async fn send(&mut self, payload: String) -> PipelineResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PipelineError::Network("not connected".into()))?;
        stream.send(Message::Text(payload)).await?;
        Ok(())
    }

    /// Wait for the next text frame, replying to pings automatically.
    /// Returns `Ok(None)` on clean close; times out after `message_timeout`
    /// of silence (the caller treats that as data staleness and reconnects).
    pub async fn recv(&mut self) -> PipelineResult<Option<String>> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| PipelineError::Network("not connected".into()))?;

            let next = tokio::time::timeout(self.message_timeout, stream.next())
                .await
                .map_err(|_| PipelineError::Timeout(self.message_timeout))?;

            match next {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    self.last_message_at = Instant::now();
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(payload))) => {
                    stream.send(Message::Pong(payload)).await?;
                    self.last_message_at = Instant::now();
                }
                Some(Ok(Message::Pong(_))) => {
                    self.last_message_at = Instant::now();
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
                    self.last_message_at = Instant::now();
                }
            }
        }
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.last_message_at.elapsed() > threshold
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(error = %e, "ws close errored, dropping anyway");
            }
        }
    }
}

/// Reconnect `connect` in a loop with jittered backoff until it succeeds or
/// `attempts` is exhausted. Used by the tracker's WS listener tasks on
/// every disconnect.
pub async fn reconnect_with_backoff<F, Fut>(
    backoff: &mut BackoffCalculator,
    max_attempts: u32,
    mut connect: F,
) -> PipelineResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PipelineResult<()>>,
{
    for attempt in 0..max_attempts {
        match connect().await {
            Ok(()) => {
                backoff.reset();
                return Ok(());
            }
            Err(e) => {
                let wait = backoff.next_backoff();
                warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "ws reconnect failed, backing off");
                tokio::time::sleep(wait).await;
            }
        }
    }
    Err(PipelineError::Network(format!(
        "exhausted {max_attempts} reconnect attempts"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = BackoffCalculator::new(Duration::from_millis(100), Duration::from_secs(1));
        let first = backoff.next_backoff();
        let second = backoff.next_backoff();
        assert!(first.as_millis() >= 70);
        assert!(second >= first || second.as_millis() <= 1300);
        for _ in 0..10 {
            let d = backoff.next_backoff();
            assert!(d <= Duration::from_millis(1300));
        }
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut backoff = BackoffCalculator::new(Duration::from_millis(100), Duration::from_secs(30));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        let after_reset = backoff.next_backoff();
        assert!(after_reset.as_millis() < 200);
    }
}
