//! Simulated Collector Link
//!
//! Provides a channel that stands in for the collector firmware when no hardware
//! is attached. It performs no I/O, answers every read with an empty reply frame
//! immediately, and never fails.
//!
//! Every frame written is appended to a shared [`Transcript`], so tests and dry
//! runs can inspect the exact wire traffic a run produced.

use crate::error::AppResult;
use crate::hardware::channel::SerialChannel;
use crate::protocol::{Command, Mode};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Shared record of frames written to a [`SimulatedChannel`].
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    frames: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    fn push(&self, frame: String) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
    }

    /// Copy of every frame written so far, in order.
    pub fn frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames that parse as commands of the given mode.
    pub fn commands(&self, mode: Mode) -> Vec<Command> {
        self.frames()
            .iter()
            .filter_map(|frame| frame.parse::<Command>().ok())
            .filter(|command| command.mode() == mode)
            .collect()
    }

    /// Number of frames written with the given mode.
    pub fn count(&self, mode: Mode) -> usize {
        self.commands(mode).len()
    }
}

/// Dry-run channel: no device, instant empty replies.
///
/// # Example
///
/// ```
/// use colosseum::hardware::mock::SimulatedChannel;
/// use colosseum::hardware::{transact, ReplyPolicy};
/// use colosseum::protocol::{Command, Mode};
///
/// # tokio_test_block_on(async {
/// let mut channel = SimulatedChannel::new();
/// let transcript = channel.transcript();
/// transact(&mut channel, &Command::stop(), &ReplyPolicy::default()).await.unwrap();
/// assert_eq!(transcript.count(Mode::Stop), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct SimulatedChannel {
    open: bool,
    transcript: Transcript,
}

impl SimulatedChannel {
    /// An open channel with an empty transcript.
    pub fn new() -> Self {
        Self {
            open: true,
            transcript: Transcript::default(),
        }
    }

    /// Handle onto the frames written through this channel.
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

impl Default for SimulatedChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialChannel for SimulatedChannel {
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let frame = String::from_utf8_lossy(bytes).into_owned();
        tracing::trace!(frame = %frame, "SimulatedChannel: write");
        self.transcript.push(frame);
        Ok(())
    }

    async fn read_frame(&mut self, _timeout: Duration) -> AppResult<String> {
        Ok(String::new())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        "SimulatedChannel".to_string()
    }
}
