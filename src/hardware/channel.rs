//! The `SerialChannel` capability and the framed request/reply helpers on top of it.

use crate::error::{AppResult, CollectorError};
use crate::protocol::{is_valid, Command};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Byte-oriented link to the collector firmware.
///
/// A channel has a single logical owner at a time; the run loop takes it for the
/// duration of a run and hands it back when it pauses or fails.
#[async_trait]
pub trait SerialChannel: Send {
    /// Write raw bytes to the device.
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Wait for one delimited reply frame and return its payload.
    ///
    /// Returns `CollectorError::Timeout` if no complete frame arrives in time.
    async fn read_frame(&mut self, timeout: Duration) -> AppResult<String>;

    /// Release the underlying transport. Closing twice is not an error.
    async fn close(&mut self) -> AppResult<()>;

    /// Whether the transport is still held.
    fn is_open(&self) -> bool;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// How long to wait for a reply, and how often to keep waiting.
///
/// A timed-out read is retried (the command is never re-sent) after a backoff
/// that doubles on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPolicy {
    /// Per-attempt read timeout
    pub timeout: Duration,
    /// Additional read attempts after the first timeout
    pub retries: u32,
    /// Pause before the first retry
    pub backoff: Duration,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

impl ReplyPolicy {
    /// Upper bound on the time spent waiting for one reply.
    pub fn worst_case(&self) -> Duration {
        let mut total = self.timeout;
        let mut backoff = self.backoff;
        for _ in 0..self.retries {
            total += self.timeout + backoff;
            backoff *= 2;
        }
        total
    }

    /// Read one reply frame, retrying timeouts according to the policy.
    pub async fn await_reply(&self, channel: &mut dyn SerialChannel) -> AppResult<String> {
        let mut backoff = self.backoff;
        let mut attempt = 0;

        loop {
            match channel.read_frame(self.timeout).await {
                Ok(reply) => return Ok(reply),
                Err(CollectorError::Timeout(_)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        retries = self.retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Reply timed out, waiting again"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(CollectorError::Timeout(_)) => {
                    return Err(CollectorError::Timeout(self.worst_case()))
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Send one raw frame and wait for its reply.
///
/// Frames failing [`is_valid`] are dropped without touching the channel and
/// `Ok(None)` is returned.
pub async fn transact_raw(
    channel: &mut dyn SerialChannel,
    frame: &str,
    policy: &ReplyPolicy,
) -> AppResult<Option<String>> {
    if !is_valid(frame) {
        warn!(frame, "Dropping invalid frame");
        return Ok(None);
    }

    channel.write(frame.as_bytes()).await?;
    debug!(frame, "Sent frame");

    let reply = policy.await_reply(channel).await?;
    debug!(frame, reply = %reply, "Reply received");
    Ok(Some(reply))
}

/// Encode a command, send it and wait for the reply.
pub async fn transact(
    channel: &mut dyn SerialChannel,
    command: &Command,
    policy: &ReplyPolicy,
) -> AppResult<Option<String>> {
    transact_raw(channel, &command.encode(), policy).await
}
