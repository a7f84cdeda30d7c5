//! Background scheduler for ingestion runs.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --(timer tick | trigger_now)--> Running --(run done)--> Idle
//!                                         |
//!              trigger while Running: one pending follow-up (coalesced)
//! ```
//!
//! Runs never overlap. Every run executes on a spawned task, so a caller that
//! stops waiting never cancels it. [`Scheduler::stop`] rejects new triggers,
//! drops the pending follow-up and waits for the in-flight run to finish.
//!
//! A run that panics is recorded as failed for its ticket and the scheduler
//! returns to Idle (or starts the queued follow-up).

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result, panic_message};
use crate::models::{Trigger, UpdateRun};

/// Something that performs one complete ingestion run.
#[async_trait]
pub trait UpdateRunner: Send + Sync + 'static {
    /// Run every source once. Per-source failures belong in the returned run.
    async fn run_update(&self, trigger: Trigger, cancel: CancellationToken) -> UpdateRun;
}

/// Externally visible scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPhase {
    Idle,
    Running,
    Stopped,
}

/// Result of asking for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A run started immediately
    Accepted { ticket: u64 },
    /// A run is in progress; a single follow-up run is queued
    Coalesced { ticket: u64 },
    /// The scheduler has been stopped
    Stopped,
}

impl TriggerOutcome {
    /// Sequence number of the run that will satisfy the trigger.
    pub fn ticket(&self) -> Option<u64> {
        match self {
            Self::Accepted { ticket } | Self::Coalesced { ticket } => Some(*ticket),
            Self::Stopped => None,
        }
    }
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    /// A follow-up run is queued behind the current one
    pub pending: bool,
    pub completed_runs: u64,
    /// Timer interval, once started
    pub interval_secs: Option<u64>,
    pub last_run: Option<UpdateRun>,
}

/// Finished runs kept for [`Scheduler::wait_for`].
const RECENT_RUNS: usize = 16;

type RunOutcome = std::result::Result<UpdateRun, String>;

#[derive(Debug, Clone, Default)]
struct Progress {
    completed: u64,
    /// `(ticket, outcome)` of the latest runs, oldest first
    recent: VecDeque<(u64, RunOutcome)>,
    stopped: bool,
}

impl Progress {
    fn record(&mut self, ticket: u64, outcome: RunOutcome) {
        self.completed = ticket;
        if self.recent.len() == RECENT_RUNS {
            self.recent.pop_front();
        }
        self.recent.push_back((ticket, outcome));
    }
}

#[derive(Default)]
struct State {
    running: bool,
    stopped: bool,
    pending: Option<Trigger>,
    /// Runs started so far; the running run has this sequence number
    started: u64,
    completed: u64,
    last_run: Option<UpdateRun>,
    interval: Option<Duration>,
    driver: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

struct Shared<R> {
    runner: Arc<R>,
    state: Mutex<State>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
}

impl<R: UpdateRunner> Shared<R> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger(self: &Arc<Self>, kind: Trigger) -> TriggerOutcome {
        let mut state = self.state();
        if state.stopped {
            return TriggerOutcome::Stopped;
        }

        let ticket = state.started + 1;
        if state.running {
            state.pending = Some(match (state.pending, kind) {
                (Some(Trigger::Manual), _) | (_, Trigger::Manual) => Trigger::Manual,
                _ => Trigger::Scheduled,
            });
            log::debug!("Run #{} in progress, follow-up #{} queued", state.started, ticket);
            return TriggerOutcome::Coalesced { ticket };
        }

        state.running = true;
        state.started = ticket;
        log::info!("Starting run #{} ({:?})", ticket, kind);
        state.driver = Some(tokio::spawn(Arc::clone(self).drive(kind)));
        TriggerOutcome::Accepted { ticket }
    }

    /// Execute runs until no follow-up is pending.
    async fn drive(self: Arc<Self>, mut trigger: Trigger) {
        loop {
            let outcome = AssertUnwindSafe(
                self.runner
                    .run_update(trigger, self.cancel.child_token()),
            )
            .catch_unwind()
            .await
            .map_err(|payload| panic_message(payload.as_ref()));

            let next = {
                let mut state = self.state();
                state.completed += 1;
                let ticket = state.completed;
                match &outcome {
                    Ok(run) => state.last_run = Some(run.clone()),
                    Err(message) => log::error!("Run #{} panicked: {}", ticket, message),
                }
                self.progress.send_modify(|p| p.record(ticket, outcome));

                match state.pending.take() {
                    Some(next) if !state.stopped => {
                        state.started += 1;
                        log::info!("Starting queued run #{} ({:?})", state.started, next);
                        Some(next)
                    }
                    _ => {
                        state.running = false;
                        None
                    }
                }
            };

            match next {
                Some(next) => trigger = next,
                None => break,
            }
        }
    }
}

/// Single-process ingestion scheduler.
pub struct Scheduler<R: UpdateRunner> {
    shared: Arc<Shared<R>>,
}

impl<R: UpdateRunner> Scheduler<R> {
    pub fn new(runner: Arc<R>) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            shared: Arc::new(Shared {
                runner,
                state: Mutex::new(State::default()),
                progress,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the background timer. The first tick fires immediately when
    /// `run_on_start` is set, otherwise after one interval.
    pub fn start(&self, interval: Duration, run_on_start: bool) {
        let mut state = self.shared.state();
        if state.stopped || state.ticker.is_some() {
            log::warn!("Scheduler already started or stopped; ignoring start");
            return;
        }

        state.interval = Some(interval);
        let shared = Arc::clone(&self.shared);
        state.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !run_on_start {
                ticker.tick().await;
            }
            loop {
                ticker.tick().await;
                if shared.trigger(Trigger::Scheduled) == TriggerOutcome::Stopped {
                    break;
                }
            }
        }));
        log::info!("Scheduler started (every {}s)", interval.as_secs());
    }

    /// Request a run now.
    pub fn trigger_now(&self) -> TriggerOutcome {
        self.shared.trigger(Trigger::Manual)
    }

    /// Wait for the run that satisfies `ticket`.
    ///
    /// Fails with [`AppError::ShuttingDown`] if the scheduler stops before
    /// that run starts, and with [`AppError::Panicked`] if the run panicked.
    /// Only the last few runs are kept; an older ticket resolves to the most
    /// recent run.
    pub async fn wait_for(&self, ticket: u64) -> Result<UpdateRun> {
        let mut rx = self.shared.progress.subscribe();
        let progress = rx
            .wait_for(|p| p.completed >= ticket || p.stopped)
            .await
            .map_err(|_| AppError::ShuttingDown)?;
        if progress.completed < ticket {
            return Err(AppError::ShuttingDown);
        }

        let outcome = progress
            .recent
            .iter()
            .find(|(t, _)| *t == ticket)
            .or_else(|| progress.recent.back());
        match outcome {
            Some((_, Ok(run))) => Ok(run.clone()),
            Some((_, Err(message))) => Err(AppError::Panicked(message.clone())),
            None => Err(AppError::ShuttingDown),
        }
    }

    /// Trigger a run and wait for the run that satisfies it.
    pub async fn run_now(&self) -> Result<UpdateRun> {
        match self.trigger_now().ticket() {
            Some(ticket) => self.wait_for(ticket).await,
            None => Err(AppError::ShuttingDown),
        }
    }

    /// Ask the in-flight run to skip sources it has not started yet.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Stop the timer and wait for the in-flight run.
    ///
    /// A queued follow-up is dropped. Later triggers return
    /// [`TriggerOutcome::Stopped`].
    pub async fn stop(&self) {
        let (ticker, driver) = {
            let mut state = self.shared.state();
            state.stopped = true;
            if state.pending.take().is_some() {
                log::info!("Dropping queued follow-up run");
            }
            (state.ticker.take(), state.driver.take())
        };

        if let Some(ticker) = ticker {
            ticker.abort();
            let _ = ticker.await;
        }
        if let Some(driver) = driver {
            log::info!("Waiting for the in-flight run to finish");
            if let Err(e) = driver.await {
                log::error!("Run task failed: {}", e);
            }
        }

        self.shared.progress.send_modify(|p| p.stopped = true);
        log::info!("Scheduler stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.shared.state();
        let phase = if state.running {
            SchedulerPhase::Running
        } else if state.stopped {
            SchedulerPhase::Stopped
        } else {
            SchedulerPhase::Idle
        };
        SchedulerStatus {
            phase,
            pending: state.pending.is_some(),
            completed_runs: state.completed,
            interval_secs: state.interval.map(|i| i.as_secs()),
            last_run: state.last_run.clone(),
        }
    }

    /// Most recent completed run.
    pub fn last_run(&self) -> Option<UpdateRun> {
        self.shared.state().last_run.clone()
    }
}

impl<R: UpdateRunner> Drop for Scheduler<R> {
    fn drop(&mut self) {
        if let Some(ticker) = self.shared.state().ticker.take() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowRunner {
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        triggers: Mutex<Vec<Trigger>>,
    }

    impl SlowRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                triggers: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UpdateRunner for SlowRunner {
        async fn run_update(&self, trigger: Trigger, _cancel: CancellationToken) -> UpdateRun {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.triggers.lock().unwrap().push(trigger);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            UpdateRun::begin(trigger).finish()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_while_running_coalesce_into_one_follow_up() {
        let runner = SlowRunner::new(Duration::from_secs(5));
        let scheduler = Scheduler::new(runner.clone());

        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Accepted { ticket: 1 });
        tokio::task::yield_now().await;
        assert_eq!(scheduler.status().phase, SchedulerPhase::Running);

        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Coalesced { ticket: 2 });
        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Coalesced { ticket: 2 });
        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Coalesced { ticket: 2 });
        assert!(scheduler.status().pending);

        let run = scheduler.wait_for(2).await.unwrap();
        assert_eq!(run.triggered_by, Trigger::Manual);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);

        let status = scheduler.status();
        assert_eq!(status.phase, SchedulerPhase::Idle);
        assert_eq!(status.completed_runs, 2);
        assert!(!status.pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_returns_completed_run() {
        let runner = SlowRunner::new(Duration::from_millis(10));
        let scheduler = Scheduler::new(runner);
        let run = scheduler.run_now().await.unwrap();
        assert_eq!(run.triggered_by, Trigger::Manual);
        assert_eq!(scheduler.last_run(), Some(run));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_run_and_drops_follow_up() {
        let runner = SlowRunner::new(Duration::from_secs(5));
        let scheduler = Scheduler::new(runner.clone());

        scheduler.trigger_now();
        tokio::task::yield_now().await;
        let follow_up = scheduler.trigger_now();

        scheduler.stop().await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status().completed_runs, 1);
        assert_eq!(scheduler.status().phase, SchedulerPhase::Stopped);

        assert!(scheduler.wait_for(1).await.is_ok());
        assert!(matches!(
            scheduler.wait_for(follow_up.ticket().unwrap()).await,
            Err(AppError::ShuttingDown)
        ));
        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drives_scheduled_runs() {
        let runner = SlowRunner::new(Duration::from_millis(1));
        let scheduler = Scheduler::new(runner.clone());

        scheduler.start(Duration::from_secs(60), true);
        tokio::time::sleep(Duration::from_secs(125)).await;
        scheduler.stop().await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert!(
            runner
                .triggers
                .lock()
                .unwrap()
                .iter()
                .all(|t| *t == Trigger::Scheduled)
        );
        assert_eq!(scheduler.status().interval_secs, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_returns_the_run_for_that_ticket() {
        let runner = SlowRunner::new(Duration::from_secs(5));
        let scheduler = Scheduler::new(runner);

        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Accepted { ticket: 1 });
        tokio::task::yield_now().await;
        assert_eq!(
            scheduler.shared.trigger(Trigger::Scheduled),
            TriggerOutcome::Coalesced { ticket: 2 }
        );

        let second = scheduler.wait_for(2).await.unwrap();
        let first = scheduler.wait_for(1).await.unwrap();
        assert_eq!(first.triggered_by, Trigger::Manual);
        assert_eq!(second.triggered_by, Trigger::Scheduled);
        assert_eq!(scheduler.last_run(), Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_ticket_resolves_to_latest_kept_run() {
        let runner = SlowRunner::new(Duration::from_millis(1));
        let scheduler = Scheduler::new(runner);

        for _ in 0..RECENT_RUNS + 2 {
            scheduler.run_now().await.unwrap();
        }
        let latest = scheduler.last_run().unwrap();
        assert_eq!(scheduler.wait_for(1).await.unwrap(), latest);
    }

    /// Panics on the given call, completes normally otherwise.
    struct PanicOnCall {
        panic_on: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpdateRunner for PanicOnCall {
        async fn run_update(&self, trigger: Trigger, _cancel: CancellationToken) -> UpdateRun {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
            if call == self.panic_on {
                panic!("run {call} exploded");
            }
            UpdateRun::begin(trigger).finish()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_fails_its_ticket_and_scheduler_recovers() {
        let runner = Arc::new(PanicOnCall {
            panic_on: 1,
            calls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(runner.clone());

        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Accepted { ticket: 1 });
        let err = scheduler.wait_for(1).await.unwrap_err();
        assert!(matches!(&err, AppError::Panicked(m) if m == "run 1 exploded"));

        let status = scheduler.status();
        assert_eq!(status.phase, SchedulerPhase::Idle);
        assert_eq!(status.completed_runs, 1);
        assert!(status.last_run.is_none());

        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Accepted { ticket: 2 });
        let run = scheduler.wait_for(2).await.unwrap();
        assert_eq!(run.triggered_by, Trigger::Manual);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_runs_after_panicking_run() {
        let runner = Arc::new(PanicOnCall {
            panic_on: 1,
            calls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(runner.clone());

        scheduler.trigger_now();
        tokio::task::yield_now().await;
        assert_eq!(scheduler.trigger_now(), TriggerOutcome::Coalesced { ticket: 2 });

        assert!(scheduler.wait_for(2).await.is_ok());
        assert!(scheduler.wait_for(1).await.is_err());
        assert_eq!(scheduler.status().phase, SchedulerPhase::Idle);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_cancel_run() {
        let runner = SlowRunner::new(Duration::from_secs(5));
        let scheduler = Scheduler::new(runner.clone());

        let waited = tokio::time::timeout(Duration::from_secs(1), scheduler.run_now()).await;
        assert!(waited.is_err());

        let run = scheduler.wait_for(1).await.unwrap();
        assert_eq!(run.triggered_by, Trigger::Manual);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }
}
