// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{Error, LOG_TARGET};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Receiver side of the shutdown signal, `true` (or a dropped sender)
/// asks the service to stop.
pub type ShutdownWatch = watch::Receiver<bool>;

/// Formats a duration with one decimal in the largest fitting unit.
pub fn duration_to_string(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else if secs < 86400.0 {
        format!("{:.1}h", secs / 3600.0)
    } else {
        format!("{:.1}d", secs / 86400.0)
    }
}

/// A unified trait for any task that can be run in the background.
#[async_trait]
pub trait BackgroundTask: Sync + Send {
    /// Executes a single iteration of the task.
    ///
    /// # Arguments
    /// * `count` - The current execution cycle number.
    ///
    /// # Returns
    /// * `Ok(true)` if the task performed meaningful work and should be logged as "success".
    /// * `Ok(false)` if the task was skipped or did no work.
    /// * `Err(Error)` if the task failed.
    async fn execute(&self, count: u32) -> Result<bool, Error>;
}

/// Runs one named background task on a fixed interval.
pub struct BackgroundTaskService {
    name: String,
    task_name: String,
    task: Box<dyn BackgroundTask>,
    count: AtomicU32,
    interval: Duration,
    immediately: bool,
}

impl BackgroundTaskService {
    pub fn new(
        name: &str,
        interval: Duration,
        task_name: &str,
        task: Box<dyn BackgroundTask>,
    ) -> Self {
        Self {
            name: name.to_string(),
            task_name: task_name.to_string(),
            task,
            count: AtomicU32::new(0),
            interval,
            immediately: false,
        }
    }
    /// Set whether the service should run immediately or wait for the interval
    pub fn set_immediately(&mut self, immediately: bool) {
        self.immediately = immediately;
    }
    pub fn name(&self) -> String {
        self.name.clone()
    }
    /// Number of cycles started so far.
    pub fn cycles(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Runs the task every interval until the shutdown signal fires.
    ///
    /// A cycle that is already running completes, the signal is only
    /// observed while waiting for the next tick.
    pub async fn run(&self, mut shutdown: ShutdownWatch) {
        info!(
            target: LOG_TARGET,
            name = self.name,
            task = self.task_name,
            interval = duration_to_string(self.interval),
            "background service is running",
        );
        if *shutdown.borrow() {
            return;
        }

        let mut period = interval(self.interval);
        // a long cycle (e.g. an issuance attempt) must not cause a burst
        period.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately, which is often not desired. We skip it.
        if !self.immediately {
            period.tick().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(
                        target: LOG_TARGET,
                        name = self.name,
                        "background service is shutting down"
                    );
                    break;
                }
                _ = period.tick() => {
                    let count = self.count.fetch_add(1, Ordering::Relaxed);
                    let start = Instant::now();
                    match self.task.execute(count).await {
                        Ok(true) => {
                            info!(
                                target: LOG_TARGET,
                                name = self.name,
                                task = self.task_name,
                                cycle = count,
                                elapsed = duration_to_string(start.elapsed()),
                                "background task executed successfully"
                            );
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!(
                                target: LOG_TARGET,
                                name = self.name,
                                task = self.task_name,
                                cycle = count,
                                error = %e,
                                "background task failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct CountTask {
        executed: Arc<AtomicU32>,
    }
    #[async_trait]
    impl BackgroundTask for CountTask {
        async fn execute(&self, _count: u32) -> Result<bool, Error> {
            self.executed.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }
    }

    #[test]
    fn test_duration_to_string() {
        assert_eq!(duration_to_string(Duration::from_secs(1)), "1.0s");
        assert_eq!(duration_to_string(Duration::from_secs(60)), "1.0m");
        assert_eq!(duration_to_string(Duration::from_secs(3600)), "1.0h");
        assert_eq!(duration_to_string(Duration::from_secs(86400)), "1.0d");
    }

    #[test]
    fn new_background_task_service() {
        let executed = Arc::new(AtomicU32::new(0));
        let mut service = BackgroundTaskService::new(
            "test",
            Duration::from_secs(1),
            "task1",
            Box::new(CountTask { executed }),
        );
        assert_eq!(service.name(), "test");
        assert_eq!(service.task_name, "task1");
        assert_eq!(false, service.immediately);
        service.set_immediately(true);
        assert_eq!(true, service.immediately);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let executed = Arc::new(AtomicU32::new(0));
        let mut service = BackgroundTaskService::new(
            "test",
            Duration::from_secs(3600),
            "count",
            Box::new(CountTask {
                executed: executed.clone(),
            }),
        );
        service.set_immediately(true);
        let service = Arc::new(service);
        let (tx, rx) = watch::channel(false);

        let runner = service.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        // immediate tick, then two more intervals
        tokio::time::sleep(Duration::from_secs(2 * 3600 + 10)).await;
        assert_eq!(3, executed.load(Ordering::Relaxed));

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(3, service.cycles());
    }

    #[tokio::test]
    async fn test_run_already_shutdown() {
        let executed = Arc::new(AtomicU32::new(0));
        let service = BackgroundTaskService::new(
            "test",
            Duration::from_millis(10),
            "count",
            Box::new(CountTask {
                executed: executed.clone(),
            }),
        );
        let (_tx, rx) = watch::channel(true);
        service.run(rx).await;
        assert_eq!(0, executed.load(Ordering::Relaxed));
    }

    struct FailTask {
        executed: Arc<AtomicU32>,
    }
    #[async_trait]
    impl BackgroundTask for FailTask {
        async fn execute(&self, count: u32) -> Result<bool, Error> {
            self.executed.fetch_add(1, Ordering::Relaxed);
            Err(Error::Task {
                category: "fail".to_string(),
                message: format!("cycle {count}"),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_keeps_running() {
        let executed = Arc::new(AtomicU32::new(0));
        let mut service = BackgroundTaskService::new(
            "test",
            Duration::from_secs(60),
            "fail",
            Box::new(FailTask {
                executed: executed.clone(),
            }),
        );
        service.set_immediately(true);
        let service = Arc::new(service);
        let (tx, rx) = watch::channel(false);
        let runner = service.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(3, executed.load(Ordering::Relaxed));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
