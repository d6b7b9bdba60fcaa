//! Cooperative job scheduler with one shared shutdown signal.
//!
//! Jobs run one at a time from a single loop. Interval jobs fire when their
//! period has elapsed since the last start; calendar jobs fire once per day
//! (or per week) at the first tick at or after their hour.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of periodic work
#[async_trait]
pub trait Job: Send {
    fn name(&self) -> &str;

    async fn run(&mut self) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    /// Once a day at or after `hour` local time
    Daily { hour: u32 },
    /// Once a week on `weekday` at or after `hour` local time
    Weekly { weekday: Weekday, hour: u32 },
}

impl Schedule {
    /// Whether a job last started at `last` should run at `now`
    pub fn is_due(&self, last: Option<DateTime<Local>>, now: DateTime<Local>) -> bool {
        match *self {
            Schedule::Every(period) => match last {
                None => true,
                Some(last) => (now - last)
                    .to_std()
                    .map(|elapsed| elapsed >= period)
                    .unwrap_or(false),
            },
            Schedule::Daily { hour } => {
                now.hour() >= hour && last.map_or(true, |l| l.date_naive() != now.date_naive())
            }
            Schedule::Weekly { weekday, hour } => {
                now.weekday() == weekday
                    && now.hour() >= hour
                    && last.map_or(true, |l| l.date_naive() != now.date_naive())
            }
        }
    }
}

struct Entry {
    job: Box<dyn Job>,
    schedule: Schedule,
    last_run: Option<DateTime<Local>>,
}

pub struct Scheduler {
    entries: Vec<Entry>,
    tick: Duration,
    cooldown: Duration,
}

impl Scheduler {
    pub fn new(tick: Duration, cooldown: Duration) -> Self {
        Self {
            entries: Vec::new(),
            tick,
            cooldown,
        }
    }

    pub fn add(&mut self, job: Box<dyn Job>, schedule: Schedule) {
        info!(job = %job.name(), ?schedule, "job registered");
        self.entries.push(Entry {
            job,
            schedule,
            last_run: None,
        });
    }

    pub fn job_count(&self) -> usize {
        self.entries.len()
    }

    /// Run every job due at `now`; returns how many failed
    pub async fn run_due(&mut self, now: DateTime<Local>) -> usize {
        let mut failures = 0;
        for entry in &mut self.entries {
            if !entry.schedule.is_due(entry.last_run, now) {
                continue;
            }
            entry.last_run = Some(now);
            debug!(job = %entry.job.name(), "running");
            if let Err(e) = entry.job.run().await {
                error!(job = %entry.job.name(), error = %e, "job failed");
                failures += 1;
            }
        }
        failures
    }

    /// Tick until `shutdown` turns true. After a failing tick the loop pauses
    /// for the cooldown before resuming.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(jobs = self.entries.len(), "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let failures = self.run_due(Local::now()).await;
            let pause = if failures > 0 {
                info!(secs = self.cooldown.as_secs(), "cooling down after errors");
                self.cooldown
            } else {
                self.tick
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counter {
        name: String,
        runs: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&mut self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    fn counter(name: &str, fail: bool) -> (Box<dyn Job>, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        (
            Box::new(Counter {
                name: name.to_string(),
                runs: Arc::clone(&runs),
                fail,
            }),
            runs,
        )
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_every() {
        let s = Schedule::Every(Duration::from_secs(10));
        let t0 = at(2024, 6, 3, 9, 0);
        assert!(s.is_due(None, t0));
        assert!(!s.is_due(Some(t0), t0 + chrono::Duration::seconds(9)));
        assert!(s.is_due(Some(t0), t0 + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_daily_once_per_day() {
        let s = Schedule::Daily { hour: 0 };
        let morning = at(2024, 6, 3, 0, 5);
        assert!(s.is_due(None, morning));
        assert!(!s.is_due(Some(morning), at(2024, 6, 3, 23, 0)));
        assert!(s.is_due(Some(morning), at(2024, 6, 4, 0, 1)));
    }

    #[test]
    fn test_weekly_monday_morning() {
        // 2024-06-03 is a Monday
        let s = Schedule::Weekly {
            weekday: Weekday::Mon,
            hour: 8,
        };
        assert!(!s.is_due(None, at(2024, 6, 3, 7, 59)));
        assert!(s.is_due(None, at(2024, 6, 3, 8, 0)));
        assert!(!s.is_due(Some(at(2024, 6, 3, 8, 0)), at(2024, 6, 3, 9, 0)));
        assert!(!s.is_due(None, at(2024, 6, 4, 8, 0)));
        assert!(s.is_due(Some(at(2024, 6, 3, 8, 0)), at(2024, 6, 10, 8, 30)));
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_jobs() {
        let mut scheduler = Scheduler::new(Duration::from_secs(1), Duration::from_secs(10));
        let (bad, bad_runs) = counter("bad", true);
        let (good, good_runs) = counter("good", false);
        scheduler.add(bad, Schedule::Every(Duration::from_secs(5)));
        scheduler.add(good, Schedule::Every(Duration::from_secs(5)));

        let t0 = at(2024, 6, 3, 9, 0);
        assert_eq!(scheduler.run_due(t0).await, 1);
        assert_eq!(scheduler.run_due(t0 + chrono::Duration::seconds(1)).await, 0);
        assert_eq!(scheduler.run_due(t0 + chrono::Duration::seconds(5)).await, 1);
        assert_eq!(bad_runs.load(Ordering::SeqCst), 2);
        assert_eq!(good_runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_honours_shutdown() {
        let mut scheduler = Scheduler::new(Duration::from_millis(10), Duration::from_millis(10));
        let (job, runs) = counter("tick", false);
        scheduler.add(job, Schedule::Every(Duration::ZERO));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            scheduler.run(rx).await;
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
