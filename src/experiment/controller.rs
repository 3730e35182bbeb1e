//! RunController for sequencing a fraction collection run.
//!
//! The controller owns the serial channel and walks the carousel through the RUN
//! sequence on a dedicated Tokio task, so `pause`, `resume`, `stop` and status
//! polls stay responsive while the loop sleeps through dwell periods that can
//! last hours.
//!
//! # Architecture
//!
//! ```text
//! control calls ──> RunRecord (one Mutex) <── run loop task ──> SerialChannel
//!                        │                         ▲
//!                        └── interrupt (watch) ────┘
//! ```
//!
//! - All shared run state lives in a single [`RunRecord`] behind one mutex. The
//!   lock is never held across an `.await`.
//! - The channel sits in a slot while no loop runs. The loop takes it on start
//!   and parks it again before publishing `Paused` or `Failed`, so exactly one
//!   task touches the channel at a time.
//! - The loop checks for pause and stop requests before each dwell, while
//!   dwelling (woken through a `watch` channel) and after each reply. A pause
//!   therefore takes effect within one reply wait.
//! - STOP is sent exactly once: either by `stop()` after the loop has exited,
//!   or by the loop itself when the sequence runs out.

use super::params::RunParameters;
use super::state::{RunState, RunStatus};
use crate::error::{AppResult, CollectorError};
use crate::hardware::{open_channel, transact, ChannelSettings, ReplyPolicy, SerialChannel};
use crate::protocol::Command;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Fixed delays and reply handling used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Wait after opening the port while the firmware boots
    pub boot_delay: Duration,
    /// Bound on the wait for the boot banner
    pub boot_timeout: Duration,
    /// Wait after the setup commands before accepting `start`
    pub settle: Duration,
    /// Pause after every reply before the next frame
    pub command_gap: Duration,
    /// Timeout and retry policy for every reply wait
    pub reply: ReplyPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            boot_delay: Duration::from_secs(5),
            boot_timeout: Duration::from_secs(10),
            settle: Duration::from_secs(1),
            command_gap: Duration::from_millis(100),
            reply: ReplyPolicy::default(),
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

#[derive(Debug)]
struct RunRecord {
    state: RunState,
    position: usize,
    /// Parameters of the first accepted `start`; replayed by `resume`
    cached: Option<RunParameters>,
    active: Option<RunParameters>,
    dwell: Option<Duration>,
    pause_requested: bool,
    /// Loop must exit at its next check-point
    stop_requested: bool,
    /// STOP frame ownership has been taken
    stop_claimed: bool,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl RunRecord {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            position: 0,
            cached: None,
            active: None,
            dwell: None,
            pause_requested: false,
            stop_requested: false,
            stop_claimed: false,
            started_at: None,
            last_error: None,
        }
    }

    fn snapshot(&self) -> RunStatus {
        RunStatus {
            state: self.state,
            position: self.position,
            fraction_count: self.active.map(|p| p.fraction_count),
            dwell: self.dwell,
            started_at: self.started_at,
            pause_requested: self.pause_requested,
            last_error: self.last_error.clone(),
        }
    }

    fn should_yield(&self) -> bool {
        self.stop_requested || self.pause_requested || self.state != RunState::Running
    }
}

struct Shared {
    record: Mutex<RunRecord>,
    /// Empty while the run loop owns the channel. Lock order: record, then slot.
    channel: Mutex<Option<Box<dyn SerialChannel>>>,
    sequence: Vec<Command>,
    settings: ControllerSettings,
    interrupt: watch::Sender<u64>,
    workers: watch::Sender<usize>,
}

impl Shared {
    fn lock_record(&self) -> MutexGuard<'_, RunRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Box<dyn SerialChannel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_channel(&self) -> Option<Box<dyn SerialChannel>> {
        self.lock_slot().take()
    }

    fn park(&self, channel: Box<dyn SerialChannel>) {
        *self.lock_slot() = Some(channel);
    }

    fn interrupt(&self) {
        self.interrupt
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn should_yield(&self) -> bool {
        self.lock_record().should_yield()
    }
}

/// Keeps the worker count raised while a run loop task is alive.
struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    fn enter(shared: Arc<Shared>) -> Self {
        shared.workers.send_modify(|count| *count += 1);
        Self { shared }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared
            .workers
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

// =============================================================================
// RunController
// =============================================================================

/// Drives one collector through a single run.
///
/// # Example
///
/// ```rust,ignore
/// let controller = RunController::open(&channel_settings, build_sequence(&table), settings).await?;
/// controller.start(RunParameters::new(1.0, SizeUnit::Millilitres, 30.0, FlowUnit::MillilitresPerHour, 20))?;
/// // ...
/// controller.pause();
/// controller.resume()?;
/// controller.stop().await;
/// ```
pub struct RunController {
    inner: Arc<Shared>,
}

impl RunController {
    /// Wrap a channel that has already been through the setup sequence.
    pub fn new(
        channel: Box<dyn SerialChannel>,
        sequence: Vec<Command>,
        settings: ControllerSettings,
    ) -> Self {
        let (interrupt, _) = watch::channel(0);
        let (workers, _) = watch::channel(0);
        Self {
            inner: Arc::new(Shared {
                record: Mutex::new(RunRecord::new()),
                channel: Mutex::new(Some(channel)),
                sequence,
                settings,
                interrupt,
                workers,
            }),
        }
    }

    /// Bring up the collector on `channel` and return a controller ready to
    /// `start`.
    ///
    /// Waits for the firmware to boot, reads and discards its banner frame,
    /// sends `SET_ACCEL` and `SET_SPEED`, then lets the motors settle.
    ///
    /// # Errors
    /// `Timeout` if the banner or a setup reply never arrives, `Validation` for
    /// an empty sequence, or any transport error.
    pub async fn connect(
        mut channel: Box<dyn SerialChannel>,
        sequence: Vec<Command>,
        settings: ControllerSettings,
    ) -> AppResult<Self> {
        if sequence.is_empty() {
            return Err(CollectorError::Validation(
                "command sequence must contain at least one RUN command".into(),
            ));
        }

        info!(
            channel = %channel.describe(),
            boot_delay_ms = settings.boot_delay.as_millis() as u64,
            "Waiting for collector to boot"
        );
        sleep(settings.boot_delay).await;

        let banner = channel.read_frame(settings.boot_timeout).await?;
        info!(banner = %banner, "Collector ready");

        for command in Command::setup_sequence() {
            transact(channel.as_mut(), &command, &settings.reply).await?;
            sleep(settings.command_gap).await;
        }
        sleep(settings.settle).await;

        Ok(Self::new(channel, sequence, settings))
    }

    /// Open the channel described by `channel_settings`, then [`connect`](Self::connect).
    pub async fn open(
        channel_settings: &ChannelSettings,
        sequence: Vec<Command>,
        settings: ControllerSettings,
    ) -> AppResult<Self> {
        let channel = open_channel(channel_settings)?;
        Self::connect(channel, sequence, settings).await
    }

    /// Largest fraction count `start` accepts.
    pub fn max_fraction_count(&self) -> usize {
        self.inner.sequence.len().saturating_sub(1)
    }

    /// Snapshot of the run for pollers.
    pub fn status(&self) -> RunStatus {
        self.inner.lock_record().snapshot()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.inner.lock_record().state
    }

    /// Index of the next RUN command to send.
    pub fn position(&self) -> usize {
        self.inner.lock_record().position
    }

    /// Start (or continue) sequencing with `params`.
    ///
    /// Returns as soon as the run loop is spawned. The first accepted call
    /// caches `params`; later calls never update that cache. Starting from
    /// `Paused` continues at the current position.
    ///
    /// # Errors
    /// - `InvalidState` while a run is in progress, after `Done`/`Failed`, or
    ///   outside a Tokio runtime.
    /// - `Validation` if `params` are rejected.
    pub fn start(&self, params: RunParameters) -> AppResult<()> {
        let mut record = self.inner.lock_record();
        if !record.state.can_start() {
            return Err(match record.state {
                RunState::Running => {
                    CollectorError::InvalidState("a run is already in progress".into())
                }
                state => CollectorError::InvalidState(format!("cannot start: run is {}", state)),
            });
        }

        let dwell = params.validate(self.max_fraction_count())?;
        self.launch(&mut record, params, dwell)?;
        record.cached.get_or_insert(params);
        Ok(())
    }

    /// Continue a paused run with the cached parameters.
    ///
    /// Clears a pause request that has not reached a check-point yet.
    ///
    /// # Errors
    /// `InvalidState` if `start` was never called, or the run is `Done`/`Failed`.
    pub fn resume(&self) -> AppResult<()> {
        let mut record = self.inner.lock_record();
        let params = record.cached.ok_or_else(|| {
            CollectorError::InvalidState("cannot resume: no run has been started".into())
        })?;

        if !record.state.can_resume() {
            return Err(CollectorError::InvalidState(format!(
                "cannot resume: run is {}",
                record.state
            )));
        }
        if record.state == RunState::Running {
            if record.pause_requested {
                record.pause_requested = false;
                info!(position = record.position, "Pending pause cancelled");
            }
            return Ok(());
        }

        let dwell = params.validate(self.max_fraction_count())?;
        self.launch(&mut record, params, dwell)
    }

    fn launch(
        &self,
        record: &mut RunRecord,
        params: RunParameters,
        dwell: Duration,
    ) -> AppResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CollectorError::InvalidState("run loop needs a Tokio runtime".into())
        })?;
        let channel = self.inner.take_channel().ok_or_else(|| {
            CollectorError::InvalidState("serial channel is not available".into())
        })?;

        record.active = Some(params);
        record.dwell = Some(dwell);
        record.state = RunState::Running;
        record.pause_requested = false;
        record.last_error = None;
        record.started_at.get_or_insert_with(Utc::now);

        info!(
            position = record.position,
            fraction_count = params.fraction_count,
            dwell_s = dwell.as_secs_f64(),
            "Run started"
        );

        let span = info_span!(
            "run",
            fraction_count = params.fraction_count,
            dwell_s = dwell.as_secs_f64()
        );
        let interrupt = self.inner.interrupt.subscribe();
        let worker = Worker::enter(Arc::clone(&self.inner));
        runtime.spawn(run_loop(worker, channel, interrupt, dwell).instrument(span));
        Ok(())
    }

    /// Request a pause at the next check-point.
    ///
    /// Does nothing unless the run is `Running`.
    pub fn pause(&self) {
        {
            let mut record = self.inner.lock_record();
            if !record.state.can_pause() {
                warn!("Cannot pause: state is {}", record.state);
                return;
            }
            record.pause_requested = true;
        }
        self.inner.interrupt();
        debug!("Pause requested");
    }

    /// End the run: state becomes `Done`, one STOP frame is sent and the channel
    /// is closed.
    ///
    /// Idempotent and infallible. A `Failed` run stays `Failed` instead of
    /// becoming `Done`, keeping its `last_error`. A reply wait in progress is
    /// allowed to finish before STOP goes out. Transport errors while sending
    /// STOP are logged, not returned.
    pub async fn stop(&self) {
        let claimed = {
            let mut record = self.inner.lock_record();
            if record.stop_claimed {
                false
            } else {
                record.stop_claimed = true;
                record.stop_requested = true;
                record.pause_requested = false;
                if record.state != RunState::Failed {
                    record.state = RunState::Done;
                }
                true
            }
        };

        self.inner.interrupt();
        self.wait_idle().await;
        if !claimed {
            return;
        }

        let Some(mut channel) = self.inner.take_channel() else {
            warn!("No serial channel left to send STOP");
            return;
        };
        send_stop(channel.as_mut(), &self.inner.settings.reply).await;
        info!(position = self.position(), "Run stopped");
    }

    /// Wait until no run loop task is alive.
    pub async fn wait_idle(&self) {
        let mut workers = self.inner.workers.subscribe();
        // The sender lives in `inner`, so this cannot fail.
        let _ = workers.wait_for(|count| *count == 0).await;
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        self.inner.lock_record().stop_requested = true;
        self.inner.interrupt();
    }
}

// =============================================================================
// Run loop
// =============================================================================

enum Step {
    Send(usize),
    Complete,
}

async fn send_stop(channel: &mut dyn SerialChannel, policy: &ReplyPolicy) {
    if let Err(e) = transact(channel, &Command::stop(), policy).await {
        warn!(error = %e, "Failed to send STOP");
    }
    if let Err(e) = channel.close().await {
        warn!(error = %e, "Failed to close serial channel");
    }
}

/// Sequencing loop. Runs until a check-point sees a pause or stop request, the
/// sequence is exhausted, or the transport fails.
async fn run_loop(
    worker: Worker,
    mut channel: Box<dyn SerialChannel>,
    mut interrupt: watch::Receiver<u64>,
    dwell: Duration,
) {
    let shared = &worker.shared;

    loop {
        let step = {
            let mut record = shared.lock_record();
            if record.stop_requested || record.state != RunState::Running {
                shared.park(channel);
                debug!(position = record.position, "Run loop exiting");
                return;
            }
            if record.pause_requested {
                shared.park(channel);
                record.pause_requested = false;
                record.state = RunState::Paused;
                info!(position = record.position, "Run paused");
                return;
            }

            let fraction_count = record.active.map_or(0, |p| p.fraction_count);
            if record.position > fraction_count {
                record.stop_claimed = true;
                record.state = RunState::Done;
                Step::Complete
            } else {
                Step::Send(record.position)
            }
        };

        let position = match step {
            Step::Send(position) => position,
            Step::Complete => {
                info!("Sequence complete");
                send_stop(channel.as_mut(), &shared.settings.reply).await;
                return;
            }
        };

        // Dwell precedes every send, including the first after a start or resume.
        let Some(deadline) = Instant::now().checked_add(dwell) else {
            fail(
                shared,
                channel,
                CollectorError::Validation(format!("dwell of {:?} overflows the clock", dwell)),
            );
            return;
        };
        let interrupted = loop {
            tokio::select! {
                _ = sleep_until(deadline) => break false,
                _ = interrupt.changed() => {
                    if shared.should_yield() {
                        break true;
                    }
                }
            }
        };
        if interrupted {
            continue;
        }

        let Some(command) = shared.sequence.get(position).copied() else {
            fail(
                shared,
                channel,
                CollectorError::Validation(format!("no command at position {}", position)),
            );
            return;
        };

        if let Err(e) = transact(channel.as_mut(), &command, &shared.settings.reply).await {
            fail(shared, channel, e);
            return;
        }

        {
            let mut record = shared.lock_record();
            if record.state == RunState::Running {
                record.position += 1;
                info!(
                    position,
                    angle = command.args()[0],
                    "Tube reached"
                );
            }
        }

        sleep(shared.settings.command_gap).await;
    }
}

/// Park the channel and mark the run `Failed`. A run already stopped keeps
/// `Done` and no error is recorded.
fn fail(shared: &Shared, channel: Box<dyn SerialChannel>, error: CollectorError) {
    let mut record = shared.lock_record();
    shared.park(channel);
    if record.state != RunState::Running {
        warn!(
            position = record.position,
            state = %record.state,
            error = %error,
            "Transport error after run ended"
        );
        return;
    }
    error!(position = record.position, error = %error, "Run failed");
    record.state = RunState::Failed;
    record.last_error = Some(error.to_string());
}
