//! Acquisition run engine.
//!
//! The engine owns a measurement run from start to finish: one spawned
//! worker task executes the run loop while control operations (`start`,
//! `abort`, `finish`, `trigger_repeat`) arrive from arbitrary tasks and are
//! serialized through a single control mutex.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────────┐  start()   ┌──────────────────────────────┐
//! │ NotRunning  │───────────▶│ Running                      │
//! │ (Idle)      │            │  Homing/Switching/Paused/    │
//! └─────────────┘            │  Measuring (+Armed for the   │
//!        ▲                   │  triggered-cycle variant)    │
//!        │   worker exits    └──────────────┬───────────────┘
//!        │   (finalize runs exactly once)   │ abort()/finish()
//!        └───────────────────────────────────┘
//! ```
//!
//! The two run variants (deterministic channel sweep, user-triggered
//! actuator cycle) are [`RunStrategy`] implementations sharing this
//! lifecycle; they differ only in the loop body and a handful of hooks.
//!
//! # Observer contract
//!
//! Progress and event fan-out goes through `tokio::sync::broadcast`
//! channels. This is a push model, not a queue: a slow subscriber may miss
//! intermediate snapshots and must read the latest value, never assume
//! delivery of every phase.

pub mod cycle;
pub mod progress;
pub mod sweep;
pub mod timer;

pub use cycle::CycleStrategy;
pub use progress::{Phase, Progress, TaskEvent};
pub use sweep::{full_channel_mask, ChannelState, SharedChannelMask, SweepStrategy};
pub use timer::RunTimer;

use crate::config::Settings;
use crate::core::{AnalyzerClient, Cue, Feedback, LiveReading, MotionDriver};
use crate::error::CommandError;
use crate::logger::MeasurementLogger;
use anyhow::Result;
use async_trait::async_trait;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `abort()` waits for the worker task to confirm exit.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra hold after the last measurement of a sweep, flushing the final
/// reading out of the analyzer's pipeline.
pub(crate) const FINAL_FLUSH_HOLD: Duration = Duration::from_secs(1);

/// Broadcast depth for progress and event subscribers.
const SUBSCRIBER_CHANNEL_DEPTH: usize = 256;

/// Outcome of waiting in the armed state.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The user trigger fired; run one cycle.
    Triggered,
    /// Abort or graceful finish was requested.
    Interrupted,
}

/// Control signal flags plus the wake channel that unblocks waiters.
struct Signals {
    abort: AtomicBool,
    finish: AtomicBool,
    trigger: AtomicBool,
    wake: Notify,
}

impl Signals {
    fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            finish: AtomicBool::new(false),
            trigger: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    fn raise_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn raise_finish(&self) {
        self.finish.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn raise_trigger(&self) {
        self.trigger.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn abort_raised(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn finish_raised(&self) -> bool {
        self.finish.load(Ordering::SeqCst)
    }

    fn trigger_pending(&self) -> bool {
        self.trigger.load(Ordering::SeqCst)
    }

    fn take_trigger(&self) -> bool {
        self.trigger.swap(false, Ordering::SeqCst)
    }

    fn clear(&self) {
        self.trigger.store(false, Ordering::SeqCst);
        self.finish.store(false, Ordering::SeqCst);
        // Abort is cleared last so observers racing against finalization
        // never see a cleared abort flag with a stale phase.
        self.abort.store(false, Ordering::SeqCst);
    }
}

/// Shared engine state and helpers, owned behind an `Arc` by both the
/// control plane and the worker task.
///
/// Progress is written only by the worker; every external read goes through
/// a cloned snapshot.
pub struct EngineCore {
    device: Arc<dyn AnalyzerClient>,
    motion: Arc<dyn MotionDriver>,
    feedback: Arc<dyn Feedback>,
    signals: Signals,
    progress: Mutex<Progress>,
    run_timer: Mutex<RunTimer>,
    logger: Mutex<Option<MeasurementLogger>>,
    progress_tx: broadcast::Sender<Progress>,
    event_tx: broadcast::Sender<TaskEvent>,
    armed: AtomicBool,
    last_notified_unit: AtomicIsize,
    task_id: String,
    cmd_settle: Duration,
}

impl EngineCore {
    fn new(
        device: Arc<dyn AnalyzerClient>,
        motion: Arc<dyn MotionDriver>,
        feedback: Arc<dyn Feedback>,
        task_id: String,
        cmd_settle: Duration,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(SUBSCRIBER_CHANNEL_DEPTH);
        let (event_tx, _) = broadcast::channel(SUBSCRIBER_CHANNEL_DEPTH);
        Self {
            device,
            motion,
            feedback,
            signals: Signals::new(),
            progress: Mutex::new(Progress::default()),
            run_timer: Mutex::new(RunTimer::new()),
            logger: Mutex::new(None),
            progress_tx,
            event_tx,
            armed: AtomicBool::new(false),
            last_notified_unit: AtomicIsize::new(-1),
            task_id,
            cmd_settle,
        }
    }

    // ---------------------------------------------------------------------
    // Signals
    // ---------------------------------------------------------------------

    pub(crate) fn abort_requested(&self) -> bool {
        self.signals.abort_raised()
    }

    pub(crate) fn finish_requested(&self) -> bool {
        self.signals.finish_raised()
    }

    pub(crate) fn raise_abort(&self) {
        self.signals.raise_abort();
    }

    pub(crate) fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }

    /// True while the triggered-cycle variant idles between cycles.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Block until the trigger fires or the run is interrupted.
    ///
    /// The wake registration happens before the flag checks, so a signal
    /// raised between check and sleep is never lost.
    pub(crate) async fn wait_for_wake(&self) -> Wake {
        loop {
            let notified = self.signals.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.signals.abort_raised() || self.signals.finish_raised() {
                return Wake::Interrupted;
            }
            if self.signals.take_trigger() {
                return Wake::Triggered;
            }
            notified.await;
        }
    }

    // ---------------------------------------------------------------------
    // Progress
    // ---------------------------------------------------------------------

    /// Current progress snapshot.
    pub async fn snapshot(&self) -> Progress {
        self.progress.lock().await.clone()
    }

    pub(crate) async fn update_progress(&self, update: impl FnOnce(&mut Progress)) {
        let mut progress = self.progress.lock().await;
        update(&mut progress);
    }

    /// Transition to `phase`, coalescing redundant emissions: a repeated
    /// phase on the same unit is a no-op.
    pub(crate) async fn set_phase(&self, phase: Phase) {
        {
            let mut progress = self.progress.lock().await;
            let unit = progress.current_unit as isize;
            if progress.phase == phase && self.last_notified_unit.load(Ordering::SeqCst) == unit {
                return;
            }
            progress.phase = phase;
            self.last_notified_unit.store(unit, Ordering::SeqCst);
        }
        info!(%phase, "phase transition");
        self.notify().await;
    }

    /// Refresh the elapsed time and push a snapshot to all subscribers.
    pub(crate) async fn notify(&self) {
        let snapshot = {
            let elapsed = self.run_timer.lock().await.elapsed();
            let mut progress = self.progress.lock().await;
            progress.elapsed_seconds = elapsed.as_secs_f64();
            progress.clone()
        };
        // Lagging subscribers drop the oldest snapshots; that is the
        // documented contract.
        let _ = self.progress_tx.send(snapshot);
    }

    pub(crate) fn emit_event(&self, event: TaskEvent) {
        debug!(?event, "task event");
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn cue(&self, cue: Cue) {
        self.feedback.cue(cue);
    }

    // ---------------------------------------------------------------------
    // Timer
    // ---------------------------------------------------------------------

    pub(crate) async fn restart_timer(&self) {
        let mut timer = self.run_timer.lock().await;
        timer.reset();
        timer.start();
    }

    pub(crate) async fn pause_timer(&self) {
        self.run_timer.lock().await.pause();
    }

    pub(crate) async fn overwrite_timer(&self, elapsed: Duration) {
        self.run_timer.lock().await.set_elapsed(elapsed);
    }

    // ---------------------------------------------------------------------
    // Waiting
    // ---------------------------------------------------------------------

    /// Dwell for `duration`, polling the abort signal in short slices.
    ///
    /// The slice is 0.5 s for dwells under 10 s and 1.0 s otherwise, so
    /// abort latency is bounded by one slice regardless of the configured
    /// duration. Emits a progress snapshot once per slice when `emit` is
    /// set. Returns `false` the instant abort is observed, `true` on
    /// natural timeout.
    pub(crate) async fn wait_for(&self, duration: Duration, emit: bool) -> bool {
        let slice = if duration < Duration::from_secs(10) {
            Duration::from_millis(500)
        } else {
            Duration::from_secs(1)
        };
        let deadline = Instant::now() + duration;
        loop {
            if self.signals.abort_raised() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            if emit {
                self.notify().await;
            }
            tokio::time::sleep(remaining.min(slice)).await;
        }
    }

    // ---------------------------------------------------------------------
    // Motion helpers
    // ---------------------------------------------------------------------

    /// Step the unit, dwell for the move timeout, release the drive.
    ///
    /// Completion is inferred by the wait; `false` only means the wait was
    /// aborted, in which case the drive is still released by the caller.
    pub(crate) async fn move_and_wait(&self, unit: &str, timeout: Duration) -> bool {
        self.motion.step(unit).await;
        if !self.wait_for(timeout, true).await {
            return false;
        }
        self.motion.reset(unit).await;
        true
    }

    /// Home the unit, dwell for the move timeout, release the drive.
    pub(crate) async fn home_and_wait(&self, unit: &str, timeout: Duration) -> bool {
        self.motion.home(unit).await;
        if !self.wait_for(timeout, true).await {
            return false;
        }
        self.motion.reset(unit).await;
        true
    }

    pub(crate) async fn step_unit(&self, unit: &str) {
        self.motion.step(unit).await;
    }

    pub(crate) async fn home_unit(&self, unit: &str) {
        self.motion.home(unit).await;
    }

    // ---------------------------------------------------------------------
    // Device helpers
    // ---------------------------------------------------------------------

    /// True when the analyzer reports online and ready for a new task.
    pub(crate) async fn device_idle(&self) -> bool {
        matches!(self.device.status().await, Some(st) if st.is_idle())
    }

    /// True when the analyzer reports one of the not-measuring states.
    ///
    /// Checked after every measurement dwell: seeing this mid-run means the
    /// device faulted or was stopped externally.
    pub(crate) async fn device_reports_stopped(&self) -> bool {
        matches!(self.device.status().await, Some(st) if st.is_stopped())
    }

    /// Start the device measurement task, then hold the settle delay.
    pub(crate) async fn start_device(&self) -> std::result::Result<(), String> {
        if !self.device_idle().await {
            warn!("analyzer not idle; refusing to start measurement");
            return Err("analyzer not idle".to_string());
        }
        self.device
            .start_measurement(&self.task_id)
            .await
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(self.cmd_settle).await;
        Ok(())
    }

    /// Best-effort device stop; true when the device ends up stopped.
    pub(crate) async fn stop_device(&self) -> bool {
        if self.device_idle().await {
            debug!("analyzer already idle");
            return true;
        }
        match self.device.stop_measurement().await {
            Ok(()) => {
                tokio::time::sleep(self.cmd_settle).await;
                true
            }
            Err(e) => {
                error!(error = %e, "analyzer stop_measurement failed");
                false
            }
        }
    }

    async fn apply_online_mode(&self, enabled: bool) -> std::result::Result<(), String> {
        self.device
            .set_online_mode(enabled)
            .await
            .map_err(|e| e.to_string())?;
        info!(online_mode = enabled, "applied analyzer online mode");
        // The firmware needs time to process the mode change before it
        // accepts further commands.
        tokio::time::sleep(self.cmd_settle).await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Live data
    // ---------------------------------------------------------------------

    /// Feed one live reading into the measurement log.
    ///
    /// Returns true when the reading was newly accepted; duplicates and
    /// empty readings return false.
    pub(crate) async fn on_live_data(&self, reading: &LiveReading) -> bool {
        if reading.components.is_empty() {
            return false;
        }
        let (phase, unit, repeat) = {
            let progress = self.progress.lock().await;
            (progress.phase, progress.current_unit, progress.repeat_index)
        };
        let mut logger = self.logger.lock().await;
        match logger.as_mut() {
            Some(logger) => logger.write_measurement(reading, phase, unit, repeat),
            None => false,
        }
    }
}

/// One run-loop variant: the deterministic sweep or the triggered cycle.
///
/// Strategies are stateless between runs except for the per-run config
/// snapshot captured in `load_config`. All hardware access goes through the
/// [`EngineCore`] helpers so both variants share the same abort, pacing and
/// logging behavior.
#[async_trait]
pub trait RunStrategy: Send + Sync {
    /// Short name for logs ("sweep" or "cycle").
    fn kind(&self) -> &'static str;

    /// Whether `trigger_repeat()` applies to this variant.
    fn supports_trigger(&self) -> bool {
        false
    }

    /// True while a triggered cycle is executing.
    fn cycle_in_flight(&self) -> bool {
        false
    }

    /// Validate and snapshot the configuration; seed the Progress totals
    /// and time estimate. An `Err` rejects the start without spawning a
    /// worker.
    async fn load_config(&self, core: &EngineCore) -> std::result::Result<(), String>;

    /// Runs after configuration, before the worker spawns. The sweep
    /// variant starts the device measurement here; the cycle variant may
    /// defer to per-cycle start.
    async fn on_start_prepare(&self, core: &EngineCore) -> std::result::Result<(), String>;

    /// The run body, executed on the worker task. Returning `Err` is
    /// treated as an implicit abort.
    async fn run(&self, core: &EngineCore) -> Result<()>;
}

/// External collaborators injected into the engine.
pub struct EngineDeps {
    pub device: Arc<dyn AnalyzerClient>,
    pub motion: Arc<dyn MotionDriver>,
    pub feedback: Arc<dyn Feedback>,
}

/// The acquisition run engine.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RunEngine {
    core: Arc<EngineCore>,
    strategy: Arc<dyn RunStrategy>,
    worker: Mutex<Option<JoinHandle<()>>>,
    log_root: PathBuf,
    segment_rotation: Duration,
    desired_online_mode: bool,
}

impl RunEngine {
    /// Build an engine for the given run variant.
    pub fn new(strategy: Arc<dyn RunStrategy>, deps: EngineDeps, settings: &Settings) -> Self {
        let core = EngineCore::new(
            deps.device,
            deps.motion,
            deps.feedback,
            settings.device.task_id.clone(),
            Duration::from_secs_f64(settings.device.command_settle_seconds),
        );
        Self {
            core: Arc::new(core),
            strategy,
            worker: Mutex::new(None),
            log_root: settings.storage.log_root.clone(),
            segment_rotation: Duration::from_secs(settings.storage.segment_rotation_seconds),
            // Storing results on the device inverts the streaming mode.
            desired_online_mode: !settings.acquisition.save_on_device,
        }
    }

    /// Start a run. Returns immediately after spawning the worker; the
    /// caller never blocks on run completion.
    pub async fn start(&self) -> std::result::Result<String, CommandError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("start requested but a run is already active");
            self.core.cue(Cue::Busy);
            return Err(CommandError::AlreadyRunning);
        }
        *worker = None;

        self.core.signals.clear();
        self.core.set_armed(false);
        self.core.last_notified_unit.store(-1, Ordering::SeqCst);
        self.core.update_progress(Progress::reset_all).await;

        if let Err(reason) = self.strategy.load_config(&self.core).await {
            warn!(reason = %reason, "start rejected: invalid configuration");
            self.core.cue(Cue::Invalid);
            return Err(CommandError::InvalidConfig(reason));
        }

        if let Err(reason) = self.core.apply_online_mode(self.desired_online_mode).await {
            warn!(reason = %reason, "failed to apply analyzer online mode");
            self.core.cue(Cue::Error);
            return Err(CommandError::Device(reason));
        }

        if let Err(reason) = self.strategy.on_start_prepare(&self.core).await {
            error!(reason = %reason, "start preparation failed");
            self.core.cue(Cue::Error);
            return Err(CommandError::Device(reason));
        }

        let logger = MeasurementLogger::create(&self.log_root, self.segment_rotation)
            .map_err(|e| CommandError::Logger(e.to_string()))?;
        info!(run_id = logger.run_id(), "measurement log opened");
        *self.core.logger.lock().await = Some(logger);

        self.core.restart_timer().await;
        self.core.emit_event(TaskEvent::TaskStarted);

        let core = Arc::clone(&self.core);
        let strategy = Arc::clone(&self.strategy);
        *worker = Some(tokio::spawn(async move {
            run_worker(core, strategy).await;
        }));

        info!(kind = self.strategy.kind(), "measurement task started");
        Ok("measurement task started".to_string())
    }

    /// Abort the current run.
    ///
    /// Raises the abort signal (which also unblocks any wait) and joins the
    /// worker with a bounded timeout. When the worker fails to confirm exit
    /// in time the call still succeeds, but the message says so explicitly;
    /// finalization will still stop the device on the worker's way out.
    pub async fn abort(&self) -> std::result::Result<String, CommandError> {
        let mut worker = self.worker.lock().await;
        let Some(mut handle) = worker.take() else {
            return Err(CommandError::NotRunning);
        };
        if handle.is_finished() {
            return Err(CommandError::NotRunning);
        }

        warn!("abort requested");
        self.core.signals.raise_abort();

        match tokio::time::timeout(WORKER_JOIN_TIMEOUT, &mut handle).await {
            Ok(join_result) => {
                if let Err(e) = join_result {
                    error!(error = %e, "worker join failed during abort");
                }
                Ok("run aborted".to_string())
            }
            Err(_) => {
                warn!(timeout = ?WORKER_JOIN_TIMEOUT, "worker did not confirm exit in time");
                *worker = Some(handle);
                Ok("abort signalled; worker exit not yet confirmed".to_string())
            }
        }
    }

    /// Request a graceful end of a triggered-cycle run.
    ///
    /// Accepted only while the engine is armed between cycles, so a cycle in
    /// flight is never truncated; use `abort()` for that.
    pub async fn finish(&self) -> std::result::Result<String, CommandError> {
        if !self.is_running().await {
            return Err(CommandError::NotRunning);
        }
        if !self.core.is_armed() {
            return Err(CommandError::NotArmed);
        }
        info!("finish requested");
        self.core.signals.raise_finish();
        Ok("finish requested".to_string())
    }

    /// Trigger one cycle of a triggered-cycle run.
    pub async fn trigger_repeat(&self) -> std::result::Result<String, CommandError> {
        if !self.strategy.supports_trigger() {
            warn!(kind = self.strategy.kind(), "repeat trigger not applicable");
            return Err(CommandError::TriggerUnsupported);
        }

        // Same mutex as start(): a second cycle must not slip in between
        // the in-flight check and the signal raise.
        let worker = self.worker.lock().await;
        if !worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(CommandError::NotRunning);
        }
        if self.strategy.cycle_in_flight() || self.core.signals.trigger_pending() {
            self.core.cue(Cue::Busy);
            return Err(CommandError::CycleInProgress);
        }

        self.core.signals.raise_trigger();
        self.core.cue(Cue::Step);
        Ok("repeat triggered".to_string())
    }

    /// True iff the worker task exists and has not exited.
    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// True while the run can be ended gracefully without truncating work.
    pub fn can_finish_now(&self) -> bool {
        self.core.is_armed()
    }

    /// Subscribe to progress snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.core.progress_tx.subscribe()
    }

    /// Subscribe to discrete lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.core.event_tx.subscribe()
    }

    /// Current progress snapshot.
    pub async fn progress(&self) -> Progress {
        self.core.snapshot().await
    }

    /// Feed one live analyzer reading into the measurement log.
    ///
    /// Returns true when the reading was newly accepted.
    pub async fn ingest_live(&self, reading: &LiveReading) -> bool {
        self.core.on_live_data(reading).await
    }
}

/// Worker wrapper: runs the strategy body, converts any escape (error or
/// panic) into an implicit abort, then finalizes exactly once.
async fn run_worker(core: Arc<EngineCore>, strategy: Arc<dyn RunStrategy>) {
    use futures::FutureExt;

    let outcome = AssertUnwindSafe(strategy.run(&core)).catch_unwind().await;
    let aborted = match outcome {
        Ok(Ok(())) => core.abort_requested(),
        Ok(Err(e)) => {
            error!(error = %e, "run loop failed; treating as abort");
            core.emit_event(TaskEvent::Error);
            core.raise_abort();
            true
        }
        Err(_) => {
            error!("run loop panicked; treating as abort");
            core.emit_event(TaskEvent::Error);
            core.raise_abort();
            true
        }
    };

    finalize(&core, aborted).await;
}

async fn finalize(core: &EngineCore, aborted: bool) {
    core.set_armed(false);

    if !core.device_idle().await && !core.stop_device().await {
        warn!("failed to stop analyzer during finalization");
    }

    let logger = core.logger.lock().await.take();
    if let Some(logger) = logger {
        match logger.close(!aborted) {
            Ok(Some(path)) => info!(path = %path.display(), "measurement log finished"),
            Ok(None) => debug!("measurement log closed without merged output"),
            Err(e) => warn!(error = %e, "closing measurement log failed"),
        }
    }

    if aborted {
        core.set_phase(Phase::Aborted).await;
        core.cue(Cue::Cancel);
        core.emit_event(TaskEvent::TaskAborted);
        warn!("measurement run aborted");
    } else {
        core.cue(Cue::Completed);
        core.emit_event(TaskEvent::TaskFinished);
        info!("measurement run complete");
    }

    core.pause_timer().await;
    core.set_phase(Phase::Idle).await;
    core.signals.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SilentFeedback;
    use crate::sim::{SimAnalyzer, SimMotion};

    fn test_core() -> EngineCore {
        EngineCore::new(
            Arc::new(SimAnalyzer::new()),
            Arc::new(SimMotion::new()),
            Arc::new(SilentFeedback),
            "11".to_string(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_wait_for_completes_on_timeout() {
        let core = test_core();
        let started = Instant::now();
        assert!(core.wait_for(Duration::from_millis(200), false).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_wait_for_unblocks_within_one_slice_of_abort() {
        let core = Arc::new(test_core());
        let waiter = Arc::clone(&core);
        let task = tokio::spawn(async move { waiter.wait_for(Duration::from_secs(30), false).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let abort_at = Instant::now();
        core.raise_abort();

        let completed = task.await.unwrap();
        assert!(!completed, "abort must cut the wait short");
        // One polling slice for a >=10s dwell is 1.0s.
        assert!(abort_at.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_wake_wait_returns_trigger() {
        let core = Arc::new(test_core());
        let waiter = Arc::clone(&core);
        let task = tokio::spawn(async move { waiter.wait_for_wake().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.signals.raise_trigger();
        assert_eq!(task.await.unwrap(), Wake::Triggered);
    }

    #[tokio::test]
    async fn test_wake_wait_interrupted_by_finish() {
        let core = Arc::new(test_core());
        let waiter = Arc::clone(&core);
        let task = tokio::spawn(async move { waiter.wait_for_wake().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.signals.raise_finish();
        assert_eq!(task.await.unwrap(), Wake::Interrupted);
    }

    #[tokio::test]
    async fn test_set_phase_coalesces_repeats() {
        let core = test_core();
        let mut rx = core.progress_tx.subscribe();

        core.set_phase(Phase::Homing).await;
        core.set_phase(Phase::Homing).await;
        core.set_phase(Phase::Paused).await;

        assert_eq!(rx.recv().await.unwrap().phase, Phase::Homing);
        // The duplicate Homing transition must not have been emitted.
        assert_eq!(rx.recv().await.unwrap().phase, Phase::Paused);
    }
}
