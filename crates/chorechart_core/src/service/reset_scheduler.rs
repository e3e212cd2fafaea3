//! Daily reset of every child's completion marks.
//!
//! # Responsibility
//! - Decide whether a reset is due against a fixed reference timezone.
//! - Commit the reset through the store's transaction primitive.
//! - Poll on a timer until shut down, logging and retrying failures.
//!
//! # Invariants
//! - The reset mutator re-checks due-ness on the value it is given, so
//!   racing schedulers on several devices produce one reset per day.
//! - `last_reset` never moves backwards, except that a marker ahead of the
//!   reset time is replaced by the reset time.
//! - The in-document marker is authoritative; the device-local legacy
//!   marker is only adopted while the document has none.

use crate::model::state::AppState;
use crate::repo::device_prefs::DevicePrefs;
use crate::service::clock::{Clock, SystemClock};
use crate::store::{StoreAdapter, StoreResult};
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default period between reset checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// When a reset counts as due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPolicy {
    /// Zone whose calendar date defines "today".
    pub timezone: Tz,
    /// Elapsed time after which a reset is due regardless of dates.
    pub max_age: TimeDelta,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl ResetPolicy {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            max_age: TimeDelta::hours(24),
        }
    }

    /// Returns whether a reset is due at `now`.
    ///
    /// Due when no reset ever happened, when `last_reset` falls on another
    /// calendar date in the reference zone, or when more than `max_age` has
    /// elapsed. A marker on a later date (a device whose clock ran ahead)
    /// is due as well, so it cannot hold resets back.
    pub fn is_due(&self, last_reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last_reset) = last_reset else {
            return true;
        };
        let last_day = last_reset.with_timezone(&self.timezone).date_naive();
        let today = now.with_timezone(&self.timezone).date_naive();
        last_day != today || now.signed_duration_since(last_reset) > self.max_age
    }
}

/// Clears every completed set and sets `last_reset` to `now`.
///
/// A marker ahead of `now` on another calendar date is overwritten; one
/// ahead of `now` on the same date is kept.
pub fn apply_reset(mut state: AppState, now: DateTime<Utc>, timezone: Tz) -> AppState {
    for child in state.children.values_mut() {
        child.completed_tasks.clear();
    }
    let today = now.with_timezone(&timezone).date_naive();
    state.last_reset = Some(match state.last_reset {
        Some(previous)
            if previous > now && previous.with_timezone(&timezone).date_naive() == today =>
        {
            previous
        }
        _ => now,
    });
    state
}

/// Result of one reset check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The store holds no document yet.
    NoDocument,
    NotDue,
    /// This check committed the reset.
    Reset { at: DateTime<Utc> },
    /// Another writer reset between our read and our commit.
    AlreadyReset,
    /// A check was already in flight on this scheduler.
    Skipped,
}

/// Timer-driven reset over a store adapter implementation.
pub struct ResetScheduler<S: StoreAdapter + 'static> {
    store: Arc<S>,
    policy: ResetPolicy,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    prefs: Option<Arc<DevicePrefs>>,
    in_flight: AtomicBool,
}

impl<S: StoreAdapter + 'static> ResetScheduler<S> {
    pub fn new(store: Arc<S>, policy: ResetPolicy) -> Self {
        Self {
            store,
            policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock: Arc::new(SystemClock),
            prefs: None,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enables legacy marker adoption and mirroring on this device.
    pub fn with_device_prefs(mut self, prefs: Arc<DevicePrefs>) -> Self {
        self.prefs = Some(prefs);
        self
    }

    pub fn policy(&self) -> ResetPolicy {
        self.policy
    }

    /// Runs one check and resets when due.
    ///
    /// # Errors
    /// - Returns `StoreError` when the read or the transaction fails.
    pub async fn check_once(&self) -> StoreResult<ResetOutcome> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return Ok(ResetOutcome::Skipped);
        };

        let now = self.clock.now();
        let Some(state) = self.store.get().await? else {
            return Ok(ResetOutcome::NoDocument);
        };
        if !self.policy.is_due(state.last_reset, now) {
            return Ok(ResetOutcome::NotDue);
        }

        let policy = self.policy;
        let applied = AtomicBool::new(false);
        let mutator = |current: AppState| {
            let due = policy.is_due(current.last_reset, now);
            applied.store(due, Ordering::SeqCst);
            if due {
                apply_reset(current, now, policy.timezone)
            } else {
                current
            }
        };
        let committed = self.store.transactional_update(&mutator).await?;

        if !applied.load(Ordering::SeqCst) {
            debug!("event=daily_reset module=reset status=skipped reason=already_reset");
            return Ok(ResetOutcome::AlreadyReset);
        }
        info!(
            "event=daily_reset module=reset status=ok children={} timezone={}",
            committed.children.len(),
            self.policy.timezone.name()
        );
        self.mirror_legacy_marker(committed.last_reset.unwrap_or(now));
        Ok(ResetOutcome::Reset { at: now })
    }

    /// Copies the device's legacy marker into the document while the
    /// document has none.
    ///
    /// Returns the adopted marker, or `None` when nothing was adopted.
    pub async fn adopt_legacy_marker(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let Some(prefs) = &self.prefs else {
            return Ok(None);
        };
        let Some(legacy) = prefs.legacy_last_reset()? else {
            return Ok(None);
        };
        if self.store.get().await?.is_none() {
            return Ok(None);
        }

        let adopted = AtomicBool::new(false);
        let mutator = |mut current: AppState| {
            let missing = current.last_reset.is_none();
            adopted.store(missing, Ordering::SeqCst);
            if missing {
                current.last_reset = Some(legacy);
            }
            current
        };
        self.store.transactional_update(&mutator).await?;

        if adopted.load(Ordering::SeqCst) {
            info!("event=legacy_reset_adopt module=reset status=ok");
            Ok(Some(legacy))
        } else {
            Ok(None)
        }
    }

    /// Starts polling: one check right away, then every poll interval.
    pub fn spawn(self: Arc<Self>) -> ResetHandle {
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(self.run(stopped));
        ResetHandle {
            stop,
            task: Some(task),
        }
    }

    async fn run(self: Arc<Self>, mut stopped: watch::Receiver<bool>) {
        info!(
            "event=reset_scheduler module=reset status=start poll_ms={} timezone={}",
            self.poll_interval.as_millis(),
            self.policy.timezone.name()
        );
        if let Err(err) = self.adopt_legacy_marker().await {
            warn!("event=legacy_reset_adopt module=reset status=error error={err}");
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = stopped.changed() => break,
            }
        }
        info!("event=reset_scheduler module=reset status=stopped");
    }

    async fn tick(&self) {
        match self.check_once().await {
            Ok(outcome) => debug!("event=reset_check module=reset status=ok outcome={outcome:?}"),
            Err(err) => warn!(
                "event=reset_check module=reset status=error retry_in_ms={} error={err}",
                self.poll_interval.as_millis()
            ),
        }
    }

    fn mirror_legacy_marker(&self, at: DateTime<Utc>) {
        let Some(prefs) = &self.prefs else {
            return;
        };
        if let Err(err) = prefs.set_legacy_last_reset(at) {
            warn!("event=legacy_reset_mirror module=reset status=error error={err}");
        }
    }
}

/// Running scheduler. Dropping it stops the timer.
pub struct ResetHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ResetHandle {
    /// Stops the timer and waits for an in-flight check to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ResetHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
