//! Interval scheduler (§4.4): fires a trigger handler at a fixed,
//! wall-clock-aligned cadence, with pause/resume, live interval changes, an
//! operator-invoked out-of-band immediate firing, and an optional
//! work-hours gate.
//!
//! Structured the way the pack's own task scheduler separates "when" from
//! "what": a tick loop owns timing state behind a mutex and a
//! `tokio::sync::Notify` wakes it early whenever that state changes
//! out-of-band (`setInterval`, `resume`, `skipNext`). Each firing is handed
//! to a distinct spawned task and awaited to completion before the loop
//! continues, which is what gives the "never overlap" guarantee without an
//! explicit overlap flag.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveTime, TimeZone, Timelike, Utc};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{AppError, AppResult};

/// Data carried to the trigger handler on each firing (§3 TimerTriggerData).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTriggerData {
    pub trigger_count: u64,
    pub interval_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkHoursStatus {
    pub current_hour: u8,
    pub is_open: bool,
    pub opens_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub trigger_count: u64,
    pub last_trigger: Option<DateTime<Utc>>,
    pub next_trigger: DateTime<Utc>,
    pub paused: bool,
    pub interval_minutes: u32,
}

/// Invoked on each accepted firing. A failing handler is logged and does not
/// stop the scheduler (§4.4 failure semantics).
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn on_trigger(&self, data: TimerTriggerData) -> AppResult<()>;
}

struct SchedulerConfig {
    interval_minutes: u32,
    work_hours_enabled: bool,
    work_start_hour: u8,
    work_end_hour: u8,
}

struct RuntimeState {
    paused: bool,
    trigger_count: u64,
    last_trigger: Option<DateTime<Utc>>,
    next_trigger: DateTime<Utc>,
}

pub struct Scheduler {
    config: Mutex<SchedulerConfig>,
    state: Mutex<RuntimeState>,
    handler: Arc<dyn TriggerHandler>,
    notify: Notify,
    execution_lock: Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// `interval_minutes` below 1 is rejected (§4.4: minimum 1).
    pub fn new(
        interval_minutes: u32,
        work_hours_enabled: bool,
        work_start_hour: u8,
        work_end_hour: u8,
        handler: Arc<dyn TriggerHandler>,
    ) -> AppResult<Self> {
        if interval_minutes < 1 {
            return Err(AppError::config_invalid("interval must be at least 1 minute"));
        }

        Ok(Self {
            config: Mutex::new(SchedulerConfig {
                interval_minutes,
                work_hours_enabled,
                work_start_hour,
                work_end_hour,
            }),
            state: Mutex::new(RuntimeState {
                paused: false,
                trigger_count: 0,
                last_trigger: None,
                next_trigger: next_aligned_utc(interval_minutes),
            }),
            handler,
            notify: Notify::new(),
            execution_lock: Mutex::new(()),
            task: Mutex::new(None),
            shutdown: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop(shutdown_rx).await });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        self.notify.notify_one();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let next_trigger = self.state.lock().await.next_trigger;
            let now = Utc::now();
            let sleep_for = (next_trigger - now).to_std().unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.notify.notified() => { continue; }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("scheduler loop exiting");
                        return;
                    }
                    continue;
                }
            }

            self.fire().await;
        }
    }

    /// Gate and advance a regular tick (§4.4 step 3).
    async fn fire(&self) {
        let interval_minutes = {
            let mut state = self.state.lock().await;
            let interval_minutes = self.config.lock().await.interval_minutes;
            state.next_trigger = next_aligned_utc(interval_minutes);
            if state.paused {
                debug!("scheduler tick skipped: paused");
                return;
            }
            interval_minutes
        };

        let status = self.work_hours_status().await;
        if !status.is_open {
            info!(hour = status.current_hour, "scheduler tick skipped: outside work hours");
            return;
        }

        self.invoke(interval_minutes, true).await;
    }

    /// Invoke the handler inside the execution lock, which `forceImmediate`
    /// shares so the two never run concurrently.
    async fn invoke(&self, interval_minutes: u32, advance: bool) {
        let _guard = self.execution_lock.lock().await;

        let trigger_count = {
            let mut state = self.state.lock().await;
            if advance {
                state.trigger_count += 1;
                state.last_trigger = Some(Utc::now());
            }
            state.trigger_count
        };

        let data = TimerTriggerData {
            trigger_count,
            interval_minutes,
        };
        let handler = Arc::clone(&self.handler);
        match tokio::spawn(async move { handler.on_trigger(data).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("scheduler callback failed: {e}"),
            Err(e) => error!("scheduler callback panicked: {e}"),
        }
    }

    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    /// Recomputes `nextTrigger` relative to now (§4.4).
    pub async fn resume(&self) {
        let interval_minutes = self.config.lock().await.interval_minutes;
        {
            let mut state = self.state.lock().await;
            state.paused = false;
            state.next_trigger = next_aligned_utc(interval_minutes);
        }
        self.notify.notify_one();
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    /// Replace the schedule atomically; pause state is preserved (§4.4).
    pub async fn set_interval(&self, minutes: u32) -> AppResult<()> {
        if minutes < 1 {
            return Err(AppError::config_invalid("interval must be at least 1 minute"));
        }
        {
            let mut config = self.config.lock().await;
            config.interval_minutes = minutes;
        }
        {
            let mut state = self.state.lock().await;
            state.next_trigger = next_aligned_utc(minutes);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Fires exactly once, out-of-band, ignoring pause state and the
    /// work-hours gate, without touching the regular cadence (§4.4).
    pub async fn force_immediate(&self) {
        let interval_minutes = self.config.lock().await.interval_minutes;
        self.invoke(interval_minutes, false).await;
    }

    /// Pushes `nextTrigger` forward by exactly one interval (§4.4).
    pub async fn skip_next(&self) {
        let interval_minutes = self.config.lock().await.interval_minutes;
        {
            let mut state = self.state.lock().await;
            state.next_trigger = state.next_trigger + chrono::Duration::minutes(interval_minutes as i64);
        }
        self.notify.notify_one();
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        let interval_minutes = self.config.lock().await.interval_minutes;
        SchedulerStats {
            trigger_count: state.trigger_count,
            last_trigger: state.last_trigger,
            next_trigger: state.next_trigger,
            paused: state.paused,
            interval_minutes,
        }
    }

    /// Reports the gate state, handling midnight rollover when closed
    /// (§4.4).
    pub async fn work_hours_status(&self) -> WorkHoursStatus {
        let config = self.config.lock().await;
        let now = Local::now();
        let hour = now.hour() as u8;

        if !config.work_hours_enabled {
            return WorkHoursStatus {
                current_hour: hour,
                is_open: true,
                opens_at: None,
            };
        }

        let is_open = hour >= config.work_start_hour && hour < config.work_end_hour;
        let opens_at = if is_open {
            None
        } else {
            let today_open = NaiveTime::from_hms_opt(config.work_start_hour as u32, 0, 0).unwrap();
            let mut candidate = Local
                .from_local_datetime(&now.date_naive().and_time(today_open))
                .single()
                .unwrap_or(now);
            if candidate <= now {
                candidate = candidate + chrono::Duration::days(1);
            }
            Some(candidate.with_timezone(&Utc))
        };

        WorkHoursStatus {
            current_hour: hour,
            is_open,
            opens_at,
        }
    }
}

/// The next instant whose local minute is a multiple of `interval_minutes`
/// and whose second is zero, strictly after now (§4.4).
fn next_aligned_utc(interval_minutes: u32) -> DateTime<Utc> {
    next_aligned_local(Local::now(), interval_minutes).with_timezone(&Utc)
}

fn next_aligned_local(now: DateTime<Local>, interval_minutes: u32) -> DateTime<Local> {
    let interval = interval_minutes.max(1) as i64;
    let minutes_since_midnight = now.hour() as i64 * 60 + now.minute() as i64;
    let next_boundary = (minutes_since_midnight / interval + 1) * interval;
    let day_overflow = next_boundary.div_euclid(24 * 60);
    let minute_of_day = next_boundary.rem_euclid(24 * 60);

    let date = now.date_naive() + chrono::Duration::days(day_overflow);
    let time = NaiveTime::from_hms_opt((minute_of_day / 60) as u32, (minute_of_day % 60) as u32, 0)
        .expect("minute_of_day is within a day");

    Local
        .from_local_datetime(&date.and_time(time))
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingHandler {
        calls: StdArc<AtomicU64>,
    }

    #[async_trait]
    impl TriggerHandler for CountingHandler {
        async fn on_trigger(&self, _data: TimerTriggerData) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TriggerHandler for FailingHandler {
        async fn on_trigger(&self, _data: TimerTriggerData) -> AppResult<()> {
            Err(AppError::application("boom"))
        }
    }

    #[test]
    fn rejects_zero_interval() {
        let calls = StdArc::new(AtomicU64::new(0));
        let handler = Arc::new(CountingHandler { calls });
        let err = Scheduler::new(0, false, 9, 18, handler).unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid { .. }));
    }

    #[test]
    fn alignment_lands_on_interval_boundary_with_zero_seconds() {
        let now = Local.with_ymd_and_hms(2026, 8, 1, 10, 17, 42).unwrap();
        let next = next_aligned_local(now, 15);
        assert_eq!(next.minute() % 15, 0);
        assert_eq!(next.second(), 0);
        assert!(next > now);
    }

    #[test]
    fn alignment_rolls_over_midnight() {
        let now = Local.with_ymd_and_hms(2026, 8, 1, 23, 50, 0).unwrap();
        let next = next_aligned_local(now, 30);
        assert_eq!(next.day(), now.day() + 1);
        assert_eq!(next.hour(), 0);
        assert_eq!(next.minute(), 0);
    }

    #[tokio::test]
    async fn force_immediate_does_not_advance_trigger_count() {
        let calls = StdArc::new(AtomicU64::new(0));
        let handler = Arc::new(CountingHandler {
            calls: StdArc::clone(&calls),
        });
        let scheduler = Arc::new(Scheduler::new(60, false, 9, 18, handler).unwrap());

        scheduler.force_immediate().await;
        scheduler.force_immediate().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.get_stats().await.trigger_count, 0);
    }

    #[tokio::test]
    async fn pause_resume_round_trips() {
        let calls = StdArc::new(AtomicU64::new(0));
        let handler = Arc::new(CountingHandler { calls });
        let scheduler = Arc::new(Scheduler::new(60, false, 9, 18, handler).unwrap());

        assert!(!scheduler.is_paused().await);
        scheduler.pause().await;
        assert!(scheduler.is_paused().await);
        scheduler.pause().await; // idempotent
        assert!(scheduler.is_paused().await);
        scheduler.resume().await;
        assert!(!scheduler.is_paused().await);
    }

    #[tokio::test]
    async fn skip_next_advances_by_exactly_one_interval() {
        let calls = StdArc::new(AtomicU64::new(0));
        let handler = Arc::new(CountingHandler { calls });
        let scheduler = Arc::new(Scheduler::new(30, false, 9, 18, handler).unwrap());

        let before = scheduler.get_stats().await.next_trigger;
        scheduler.skip_next().await;
        let after = scheduler.get_stats().await.next_trigger;
        assert_eq!((after - before).num_minutes(), 30);
    }

    #[tokio::test]
    async fn set_interval_preserves_pause_state() {
        let calls = StdArc::new(AtomicU64::new(0));
        let handler = Arc::new(CountingHandler { calls });
        let scheduler = Arc::new(Scheduler::new(60, false, 9, 18, handler).unwrap());

        scheduler.pause().await;
        scheduler.set_interval(15).await.unwrap();
        assert!(scheduler.is_paused().await);
        assert_eq!(scheduler.get_stats().await.interval_minutes, 15);

        let err = scheduler.set_interval(0).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn failing_handler_is_logged_and_swallowed() {
        let scheduler = Arc::new(Scheduler::new(60, false, 9, 18, Arc::new(FailingHandler)).unwrap());
        scheduler.force_immediate().await; // must not panic
    }

    #[tokio::test]
    async fn work_hours_gate_reports_next_open_time_across_midnight() {
        let calls = StdArc::new(AtomicU64::new(0));
        let handler = Arc::new(CountingHandler { calls });
        let scheduler = Arc::new(Scheduler::new(60, true, 9, 18, handler).unwrap());
        let status = scheduler.work_hours_status().await;
        // Either open or has a concrete next-open time; never both closed with no answer.
        assert!(status.is_open || status.opens_at.is_some());
    }
}
