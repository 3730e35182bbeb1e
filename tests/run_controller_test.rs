//! Integration tests for the RunController state machine
//!
//! Runs execute against the simulated channel (or a silent device) with Tokio's
//! clock paused, so dwell periods elapse instantly while ordering stays real.

use async_trait::async_trait;
use colosseum::error::{AppResult, CollectorError};
use colosseum::experiment::{ControllerSettings, RunController, RunParameters, RunState};
use colosseum::hardware::mock::{SimulatedChannel, Transcript};
use colosseum::hardware::{ChannelSettings, ReplyPolicy, SerialChannel};
use colosseum::protocol::{Command, Mode};
use colosseum::sequence::{build_sequence, AngleTable};
use colosseum::timing::{FlowUnit, SizeUnit};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

// =============================================================================
// Helpers
// =============================================================================

/// About one second per tube.
fn quick_params(fraction_count: usize) -> RunParameters {
    RunParameters::new(
        10.0,
        SizeUnit::Microlitres,
        36.0,
        FlowUnit::MillilitresPerHour,
        fraction_count,
    )
}

async fn connect_simulated() -> (RunController, Transcript) {
    let channel = SimulatedChannel::new();
    let transcript = channel.transcript();
    let controller = RunController::connect(
        Box::new(channel),
        build_sequence(&AngleTable::default()),
        ControllerSettings::default(),
    )
    .await
    .unwrap();
    (controller, transcript)
}

async fn wait_for_position(controller: &RunController, position: usize) {
    while controller.position() < position {
        sleep(Duration::from_millis(100)).await;
    }
}

fn run_angles(transcript: &Transcript) -> Vec<f64> {
    transcript
        .commands(Mode::Run)
        .iter()
        .map(|command| command.args()[0])
        .collect()
}

fn table_angles(count: usize) -> Vec<f64> {
    AngleTable::default().angles()[..count]
        .iter()
        .map(|&angle| f64::from(angle))
        .collect()
}

/// Records writes but never answers.
#[derive(Clone, Default)]
struct SilentDevice {
    written: Arc<Mutex<Vec<String>>>,
}

impl SilentDevice {
    fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl SerialChannel for SilentDevice {
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.written
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }

    async fn read_frame(&mut self, timeout: Duration) -> AppResult<String> {
        sleep(timeout).await;
        Err(CollectorError::Timeout(timeout))
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "SilentDevice".into()
    }
}

fn impatient_settings() -> ControllerSettings {
    ControllerSettings {
        boot_timeout: Duration::from_secs(2),
        reply: ReplyPolicy {
            timeout: Duration::from_secs(1),
            retries: 1,
            backoff: Duration::from_millis(100),
        },
        ..ControllerSettings::default()
    }
}

// =============================================================================
// Setup
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_setup_frames_sent_on_connect() {
    let started = Instant::now();
    let (controller, transcript) = connect_simulated().await;

    assert_eq!(
        transcript.frames(),
        vec![
            "<SET_ACCEL,111,1000.0,1000.0,1000.0>",
            "<SET_SPEED,111,1000.0,1000.0,1000.0>",
        ]
    );
    assert_eq!(controller.state(), RunState::Idle);
    // Boot delay plus settle interval.
    assert!(started.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_missing_boot_banner_times_out() {
    let result = RunController::connect(
        Box::new(SilentDevice::default()),
        build_sequence(&AngleTable::default()),
        impatient_settings(),
    )
    .await;

    assert!(matches!(result, Err(CollectorError::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_open_simulated_channel_from_settings() {
    let settings = ChannelSettings {
        simulate: true,
        ..Default::default()
    };
    let controller = RunController::open(
        &settings,
        build_sequence(&AngleTable::default()),
        ControllerSettings::default(),
    )
    .await
    .unwrap();

    assert_eq!(controller.state(), RunState::Idle);
    assert_eq!(controller.max_fraction_count(), 21);
}

// =============================================================================
// Sequencing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_run_sends_inclusive_range_then_done() {
    let (controller, transcript) = connect_simulated().await;

    controller.start(quick_params(5)).unwrap();
    controller.wait_idle().await;

    assert_eq!(run_angles(&transcript), table_angles(6));
    assert_eq!(controller.state(), RunState::Done);
    assert_eq!(controller.position(), 6);
    assert_eq!(transcript.count(Mode::Stop), 1);
    assert_eq!(
        transcript.frames().last().map(String::as_str),
        Some("<STOP,111,0.0,0.0,0.0>")
    );
}

#[tokio::test(start_paused = true)]
async fn test_dwell_precedes_first_send() {
    let (controller, transcript) = connect_simulated().await;

    controller.start(quick_params(3)).unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(transcript.count(Mode::Run), 0);
    assert_eq!(controller.status().state, RunState::Running);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(transcript.count(Mode::Run), 1);
    assert_eq!(controller.position(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_active_run() {
    let (controller, _transcript) = connect_simulated().await;

    controller.start(quick_params(4)).unwrap();
    let status = controller.status();

    assert_eq!(status.state, RunState::Running);
    assert_eq!(status.fraction_count, Some(4));
    assert_eq!(status.remaining(), Some(5));
    assert!(status.started_at.is_some());
    assert!(status.dwell.is_some());
    assert!(status.last_error.is_none());
}

// =============================================================================
// Pause / Resume
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_at_every_position() {
    let fraction_count = 5;

    for pause_at in 0..=fraction_count {
        let (controller, transcript) = connect_simulated().await;

        controller.start(quick_params(fraction_count)).unwrap();
        wait_for_position(&controller, pause_at).await;
        controller.pause();
        controller.wait_idle().await;

        assert_eq!(controller.state(), RunState::Paused, "pause at {}", pause_at);
        assert_eq!(controller.position(), pause_at);
        assert_eq!(transcript.count(Mode::Run), pause_at);

        // Nothing moves while paused.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(transcript.count(Mode::Run), pause_at);

        controller.resume().unwrap();
        controller.wait_idle().await;

        assert_eq!(controller.state(), RunState::Done, "pause at {}", pause_at);
        assert_eq!(controller.position(), fraction_count + 1);
        assert_eq!(run_angles(&transcript), table_angles(fraction_count + 1));
        assert_eq!(transcript.count(Mode::Stop), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_resume_replays_first_parameters() {
    let (controller, transcript) = connect_simulated().await;

    controller.start(quick_params(3)).unwrap();
    wait_for_position(&controller, 1).await;
    controller.pause();
    controller.wait_idle().await;

    // A new start from Paused runs with the new parameters...
    controller.start(quick_params(5)).unwrap();
    assert_eq!(controller.status().fraction_count, Some(5));
    wait_for_position(&controller, 3).await;
    controller.pause();
    controller.wait_idle().await;

    // ...but resume goes back to the ones cached by the first start.
    controller.resume().unwrap();
    assert_eq!(controller.status().fraction_count, Some(3));
    controller.wait_idle().await;

    assert_eq!(controller.state(), RunState::Done);
    assert_eq!(controller.position(), 4);
    assert_eq!(run_angles(&transcript), table_angles(4));
}

#[tokio::test(start_paused = true)]
async fn test_resume_without_start_is_invalid_state() {
    let (controller, transcript) = connect_simulated().await;

    let err = controller.resume().unwrap_err();
    assert!(matches!(err, CollectorError::InvalidState(_)));
    assert_eq!(controller.state(), RunState::Idle);
    assert_eq!(transcript.count(Mode::Run), 0);
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_twice_from_idle_sends_one_stop() {
    let (controller, transcript) = connect_simulated().await;

    controller.stop().await;
    assert_eq!(controller.state(), RunState::Done);
    controller.stop().await;
    assert_eq!(controller.state(), RunState::Done);

    assert_eq!(transcript.commands(Mode::Stop), vec![Command::stop()]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_running_freezes_position() {
    let (controller, transcript) = connect_simulated().await;

    controller.start(quick_params(10)).unwrap();
    wait_for_position(&controller, 2).await;
    controller.stop().await;
    controller.stop().await;

    let position = controller.position();
    let sent = transcript.count(Mode::Run);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(controller.state(), RunState::Done);
    assert_eq!(controller.position(), position);
    assert_eq!(transcript.count(Mode::Run), sent);
    assert_eq!(transcript.count(Mode::Stop), 1);
    assert_eq!(
        transcript.frames().last().map(String::as_str),
        Some("<STOP,111,0.0,0.0,0.0>")
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_reply_wait_sends_stop_after_run() {
    let device = SilentDevice::default();
    let settings = ControllerSettings {
        reply: ReplyPolicy {
            timeout: Duration::from_secs(5),
            retries: 0,
            backoff: Duration::from_millis(100),
        },
        ..ControllerSettings::default()
    };
    let controller = RunController::new(
        Box::new(device.clone()),
        build_sequence(&AngleTable::default()),
        settings,
    );

    controller.start(quick_params(3)).unwrap();
    // One second of dwell, then the RUN frame goes out and the reply wait begins.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(device.written(), vec!["<RUN,111,84.0,84.0,84.0>"]);

    let stopping = Instant::now();
    controller.stop().await;
    // The pending read ran to its deadline before STOP was written.
    assert!(stopping.elapsed() >= Duration::from_millis(4500));

    let status = controller.status();
    assert_eq!(status.state, RunState::Done);
    assert_eq!(status.position, 0);
    assert!(status.last_error.is_none(), "{:?}", status.last_error);
    assert_eq!(
        device.written(),
        vec!["<RUN,111,84.0,84.0,84.0>", "<STOP,111,0.0,0.0,0.0>"]
    );

    controller.stop().await;
    assert_eq!(device.written().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_paused() {
    let (controller, transcript) = connect_simulated().await;

    controller.start(quick_params(5)).unwrap();
    wait_for_position(&controller, 2).await;
    controller.pause();
    controller.wait_idle().await;
    controller.stop().await;

    assert_eq!(controller.state(), RunState::Done);
    assert_eq!(controller.position(), 2);
    assert_eq!(transcript.count(Mode::Stop), 1);
    assert!(matches!(
        controller.resume(),
        Err(CollectorError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_after_done_is_invalid_state() {
    let (controller, transcript) = connect_simulated().await;

    controller.start(quick_params(2)).unwrap();
    controller.wait_idle().await;
    assert_eq!(controller.state(), RunState::Done);

    let err = controller.start(quick_params(2)).unwrap_err();
    assert!(matches!(err, CollectorError::InvalidState(_)));
    assert!(matches!(
        controller.resume(),
        Err(CollectorError::InvalidState(_))
    ));

    // The natural completion already sent STOP.
    controller.stop().await;
    assert_eq!(transcript.count(Mode::Stop), 1);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reply_timeout_fails_run() {
    let device = SilentDevice::default();
    let controller = RunController::new(
        Box::new(device.clone()),
        build_sequence(&AngleTable::default()),
        impatient_settings(),
    );

    controller.start(quick_params(3)).unwrap();
    controller.wait_idle().await;

    let status = controller.status();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.position, 0);
    let message = status.last_error.unwrap();
    assert!(message.contains("No reply frame"), "{}", message);

    assert!(matches!(
        controller.start(quick_params(3)),
        Err(CollectorError::InvalidState(_))
    ));

    // Stop still attempts the STOP frame and leaves the failure visible.
    controller.stop().await;
    assert_eq!(controller.state(), RunState::Failed);
    assert_eq!(
        device.written(),
        vec!["<RUN,111,84.0,84.0,84.0>", "<STOP,111,0.0,0.0,0.0>"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_parameters_rejected_before_any_frame() {
    let (controller, transcript) = connect_simulated().await;
    let before = transcript.frames().len();

    let too_many = quick_params(22);
    assert!(matches!(
        controller.start(too_many),
        Err(CollectorError::Validation(_))
    ));

    let mut no_flow = quick_params(3);
    no_flow.flow_value = 0.0;
    assert!(matches!(
        controller.start(no_flow),
        Err(CollectorError::Validation(_))
    ));

    assert_eq!(controller.state(), RunState::Idle);
    assert_eq!(transcript.frames().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_vanishing_flow_rate_rejected_at_start() {
    let (controller, transcript) = connect_simulated().await;
    let before = transcript.frames().len();

    let params = RunParameters::new(
        1000.0,
        SizeUnit::Microlitres,
        3e-13,
        FlowUnit::MicrolitresPerHour,
        3,
    );
    let err = controller.start(params).unwrap_err();
    assert!(matches!(err, CollectorError::Validation(_)), "{}", err);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(controller.state(), RunState::Idle);
    assert_eq!(transcript.frames().len(), before);

    // The controller still accepts a sane run afterwards.
    controller.start(quick_params(2)).unwrap();
    controller.wait_idle().await;
    assert_eq!(controller.state(), RunState::Done);
}
