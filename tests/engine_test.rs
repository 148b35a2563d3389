//! End-to-end engine scenarios against the simulated hardware.

use gasrig::config::Settings;
use gasrig::core::{AnalyzerClient, Feedback, MotionDriver, SilentFeedback};
use gasrig::engine::{
    ChannelState, CycleStrategy, EngineDeps, RunEngine, RunStrategy, SharedChannelMask,
    SweepStrategy, TaskEvent,
};
use gasrig::error::CommandError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Rig {
    engine: Arc<RunEngine>,
    analyzer: Arc<gasrig::sim::SimAnalyzer>,
    motion: Arc<gasrig::sim::SimMotion>,
    _logs: TempDir,
}

fn fast_settings(logs: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.measure_seconds = 0.05;
    settings.acquisition.pause_seconds = 0.02;
    settings.acquisition.switch_settle_seconds = 0.02;
    settings.acquisition.repeat_count = 1;
    settings.acquisition.channel_count = 3;
    settings.cycle.move_timeout_seconds = 0.02;
    settings.device.command_settle_seconds = 0.005;
    settings.storage.log_root = logs.path().to_path_buf();
    settings
}

fn build_rig(settings: Settings, strategy: Arc<dyn RunStrategy>, logs: TempDir) -> Rig {
    let analyzer = Arc::new(gasrig::sim::SimAnalyzer::new());
    let motion = Arc::new(gasrig::sim::SimMotion::new());
    let deps = EngineDeps {
        device: Arc::clone(&analyzer) as Arc<dyn AnalyzerClient>,
        motion: Arc::clone(&motion) as Arc<dyn MotionDriver>,
        feedback: Arc::new(SilentFeedback) as Arc<dyn Feedback>,
    };
    Rig {
        engine: Arc::new(RunEngine::new(strategy, deps, &settings)),
        analyzer,
        motion,
        _logs: logs,
    }
}

fn sweep_rig(mask: Vec<ChannelState>, tweak: impl FnOnce(&mut Settings)) -> Rig {
    let logs = TempDir::new().unwrap();
    let mut settings = fast_settings(&logs);
    settings.acquisition.channel_count = mask.len();
    tweak(&mut settings);
    let shared: SharedChannelMask = Arc::new(Mutex::new(mask));
    let strategy = Arc::new(SweepStrategy::new(settings.clone(), Arc::clone(&shared)));
    build_rig(settings, strategy, logs)
}

fn cycle_rig(tweak: impl FnOnce(&mut Settings)) -> Rig {
    let logs = TempDir::new().unwrap();
    let mut settings = fast_settings(&logs);
    tweak(&mut settings);
    let strategy = Arc::new(CycleStrategy::new(settings.clone()));
    build_rig(settings, strategy, logs)
}

async fn wait_for_event(rx: &mut broadcast::Receiver<TaskEvent>, wanted: TaskEvent) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx.recv().await.unwrap() == wanted {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

async fn wait_until_armed(engine: &Arc<RunEngine>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.can_finish_now() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("engine never armed");
}

#[tokio::test]
async fn test_sweep_visits_enabled_channels_and_finishes() {
    use ChannelState::{Active, Inactive};
    let rig = sweep_rig(vec![Active, Inactive, Active], |_| {});
    let mut events = rig.engine.subscribe_events();

    rig.engine.start().await.unwrap();
    wait_for_event(&mut events, TaskEvent::TaskFinished).await;

    let progress = rig.engine.progress().await;
    assert_eq!(progress.repeat_index, 1);
    assert_eq!(progress.step_index, 2);
    assert_eq!(progress.enabled_count, 2);
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.overall_percent, 100);

    // One home per repeat, one step past the disabled channel plus one onto
    // the last enabled channel.
    assert_eq!(rig.motion.count("home"), 1);
    assert_eq!(rig.motion.count("step"), 2);
    assert_eq!(rig.motion.count("reset"), 3);

    let commands = rig.analyzer.command_log();
    assert_eq!(commands[0], "online_mode true");
    assert_eq!(commands[1], "start 11");
    assert_eq!(commands.last().unwrap(), "stop");
}

#[tokio::test]
async fn test_sweep_marks_channels_sampled_in_shared_mask() {
    use ChannelState::{Active, Inactive};
    let logs = TempDir::new().unwrap();
    let mut settings = fast_settings(&logs);
    settings.acquisition.channel_count = 3;
    let shared: SharedChannelMask = Arc::new(Mutex::new(vec![Active, Inactive, Active]));
    let strategy = Arc::new(SweepStrategy::new(settings.clone(), Arc::clone(&shared)));
    let rig = build_rig(settings, strategy, logs);

    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();
    wait_for_event(&mut events, TaskEvent::TaskFinished).await;

    let mask = shared.lock().unwrap();
    assert_eq!(
        *mask,
        vec![ChannelState::Sampled, Inactive, ChannelState::Sampled]
    );
}

#[tokio::test]
async fn test_zero_repeat_sweep_performs_no_steps() {
    let rig = sweep_rig(vec![ChannelState::Active; 2], |s| {
        s.acquisition.repeat_count = 0;
    });
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();
    wait_for_event(&mut events, TaskEvent::TaskFinished).await;

    let progress = rig.engine.progress().await;
    assert_eq!(progress.total_steps, 0);
    assert_eq!(progress.step_index, 0);
    assert_eq!(progress.repeat_index, 0);

    // No repeats, no motion.
    assert_eq!(rig.motion.count("home"), 0);
    assert_eq!(rig.motion.count("step"), 0);
}

#[tokio::test]
async fn test_start_rejected_when_no_channels_enabled() {
    let rig = sweep_rig(vec![ChannelState::Inactive; 3], |_| {});
    let err = rig.engine.start().await.unwrap_err();
    assert!(matches!(err, CommandError::InvalidConfig(_)));
    assert!(!rig.engine.is_running().await);
}

#[tokio::test]
async fn test_concurrent_starts_exactly_one_wins() {
    let rig = sweep_rig(vec![ChannelState::Active; 2], |s| {
        s.acquisition.measure_seconds = 5.0;
    });

    // Race two starts; the control mutex must admit exactly one.
    let first = Arc::clone(&rig.engine);
    let second = Arc::clone(&rig.engine);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.start().await }),
        tokio::spawn(async move { second.start().await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one start must lose the race");
    assert_eq!(*loser, CommandError::AlreadyRunning);
    assert_eq!(loser.to_string(), "measurement already running");

    rig.engine.abort().await.unwrap();
}

#[tokio::test]
async fn test_abort_when_idle_is_rejected() {
    let rig = sweep_rig(vec![ChannelState::Active; 2], |_| {});
    let err = rig.engine.abort().await.unwrap_err();
    assert!(matches!(err, CommandError::NotRunning));
    assert_eq!(err.to_string(), "not running");
}

#[tokio::test]
async fn test_abort_latency_bounded_by_wait_slice() {
    // A long dwell uses the 1 s polling slice; abort must not wait out the
    // full measurement.
    let rig = sweep_rig(vec![ChannelState::Active; 2], |s| {
        s.acquisition.measure_seconds = 30.0;
    });
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let requested = Instant::now();
    let message = rig.engine.abort().await.unwrap();
    assert!(requested.elapsed() < Duration::from_secs(2));
    assert_eq!(message, "run aborted");

    wait_for_event(&mut events, TaskEvent::TaskAborted).await;
    assert!(!rig.engine.is_running().await);
    assert_eq!(rig.analyzer.command_log().last().unwrap(), "stop");
}

#[tokio::test]
async fn test_device_stop_mid_run_aborts() {
    let rig = sweep_rig(vec![ChannelState::Active; 2], |_| {});
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();

    // Simulate the analyzer being stopped behind the engine's back.
    rig.analyzer.set_status_code(1);

    wait_for_event(&mut events, TaskEvent::Error).await;
    wait_for_event(&mut events, TaskEvent::TaskAborted).await;
}

#[tokio::test]
async fn test_trigger_rejected_for_sweep() {
    let rig = sweep_rig(vec![ChannelState::Active; 2], |s| {
        s.acquisition.measure_seconds = 5.0;
    });
    rig.engine.start().await.unwrap();

    let err = rig.engine.trigger_repeat().await.unwrap_err();
    assert!(matches!(err, CommandError::TriggerUnsupported));

    rig.engine.abort().await.unwrap();
}

#[tokio::test]
async fn test_cycle_trigger_runs_one_cycle_then_rearms() {
    let rig = cycle_rig(|_| {});
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();

    wait_until_armed(&rig.engine).await;
    rig.engine.trigger_repeat().await.unwrap();
    wait_for_event(&mut events, TaskEvent::CycleStarted).await;
    wait_for_event(&mut events, TaskEvent::CycleFinished).await;

    let progress = rig.engine.progress().await;
    assert_eq!(progress.repeat_index, 1);
    assert_eq!(progress.repeat_total, 1);
    assert_eq!(progress.step_index, 2);
    assert_eq!(progress.percent, 100);

    // Two actuators, each extended then homed.
    assert_eq!(rig.motion.count("step"), 2);
    assert_eq!(rig.motion.count("home"), 2);

    // A second trigger after completion is accepted and adds exactly one.
    wait_until_armed(&rig.engine).await;
    rig.engine.trigger_repeat().await.unwrap();
    wait_for_event(&mut events, TaskEvent::CycleFinished).await;
    assert_eq!(rig.engine.progress().await.repeat_index, 2);

    wait_until_armed(&rig.engine).await;
    rig.engine.finish().await.unwrap();
    wait_for_event(&mut events, TaskEvent::TaskFinished).await;
    assert!(!rig.engine.is_running().await);
}

#[tokio::test]
async fn test_trigger_while_cycle_in_flight_is_rejected() {
    let rig = cycle_rig(|s| {
        s.acquisition.measure_seconds = 5.0;
    });
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();

    wait_until_armed(&rig.engine).await;
    rig.engine.trigger_repeat().await.unwrap();
    wait_for_event(&mut events, TaskEvent::CycleStarted).await;

    let err = rig.engine.trigger_repeat().await.unwrap_err();
    assert!(matches!(err, CommandError::CycleInProgress));
    assert_eq!(err.to_string(), "cycle already in progress");

    rig.engine.abort().await.unwrap();
}

#[tokio::test]
async fn test_finish_rejected_while_cycle_in_flight() {
    let rig = cycle_rig(|s| {
        s.acquisition.measure_seconds = 5.0;
    });
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();

    wait_until_armed(&rig.engine).await;
    rig.engine.trigger_repeat().await.unwrap();
    wait_for_event(&mut events, TaskEvent::CycleStarted).await;

    let err = rig.engine.finish().await.unwrap_err();
    assert!(matches!(err, CommandError::NotArmed));

    rig.engine.abort().await.unwrap();
}

#[tokio::test]
async fn test_finish_between_cycles_ends_run_gracefully() {
    let rig = cycle_rig(|_| {});
    let mut events = rig.engine.subscribe_events();
    rig.engine.start().await.unwrap();

    wait_until_armed(&rig.engine).await;
    rig.engine.finish().await.unwrap();
    wait_for_event(&mut events, TaskEvent::TaskFinished).await;

    let progress = rig.engine.progress().await;
    assert_eq!(progress.repeat_index, 0);
    assert!(!rig.engine.is_running().await);
}

#[tokio::test]
async fn test_duplicate_live_reading_rejected_once_logged() {
    let rig = sweep_rig(vec![ChannelState::Active; 2], |s| {
        s.acquisition.measure_seconds = 5.0;
    });
    rig.engine.start().await.unwrap();

    let reading = rig.analyzer.next_reading();
    assert!(rig.engine.ingest_live(&reading).await);
    assert!(!rig.engine.ingest_live(&reading).await);
    assert!(rig.engine.ingest_live(&rig.analyzer.next_reading()).await);

    rig.engine.abort().await.unwrap();
}
