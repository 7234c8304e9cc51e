//! Initialization reports and the periodic consumer connection check.

use crate::error::{InitSource, MqError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Outcome of an initialization, delivered to the [`InitCallback`].
///
/// The health check reuses it: `check_error` is set when the check found
/// the connection gone, `init_error` when rebuilding it failed.
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub version: Option<String>,
    pub init_error: Option<MqError>,
    pub check_error: Option<MqError>,
}

impl InitReport {
    pub(crate) fn initialized(version: String) -> Self {
        Self {
            version: Some(version),
            ..Default::default()
        }
    }

    pub(crate) fn failed(error: MqError) -> Self {
        Self {
            init_error: Some(error),
            ..Default::default()
        }
    }

    /// True when neither initialization nor the check reported a problem.
    pub fn is_ok(&self) -> bool {
        self.init_error.is_none() && self.check_error.is_none()
    }
}

/// Receives [`InitReport`]s, from `init` and later from the health check.
pub type InitCallback = Arc<dyn Fn(InitReport) + Send + Sync>;

/// Receives errors of operations that also return them.
pub type ErrorCallback = Arc<dyn Fn(&MqError) + Send + Sync>;

/// Result of one connection check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// A live connection exists
    Healthy,
    /// The connection was missing or dead and was rebuilt from `via`;
    /// `error` is set when rebuilding failed
    Reinitialized {
        via: InitSource,
        error: Option<MqError>,
    },
}

impl CheckOutcome {
    /// The report the health check hands to the init callback, if any.
    pub fn report(&self, version: &str) -> Option<InitReport> {
        match self {
            CheckOutcome::Healthy => None,
            CheckOutcome::Reinitialized { via, error } => Some(InitReport {
                version: error.is_none().then(|| version.to_string()),
                init_error: error.clone(),
                check_error: Some(MqError::ConnectionLost { via: via.clone() }),
            }),
        }
    }
}

/// Handle to the background check task.
pub(crate) struct HealthChecker {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HealthChecker {
    /// Run `tick` every `interval` until stopped or until `tick` returns `false`.
    pub(crate) fn spawn<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let (stop, mut stopped) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            debug!("Health check stopped");
        });

        debug!(interval_secs = interval.as_secs(), "Health check started");
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Signal the task, drop the channel and wait for the task to finish.
    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health check task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let checker = HealthChecker::spawn(Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        checker.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_returning_false_ends_loop() {
        let checker = HealthChecker::spawn(Duration::from_secs(1), || async { false });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(checker.task.is_finished());
        checker.stop().await;
    }

    #[test]
    fn test_check_outcome_report() {
        assert!(CheckOutcome::Healthy.report("v1").is_none());

        let report = CheckOutcome::Reinitialized {
            via: InitSource::Config,
            error: None,
        }
        .report("v1")
        .unwrap();
        assert_eq!(report.version.as_deref(), Some("v1"));
        assert!(report.init_error.is_none());
        assert!(matches!(
            report.check_error,
            Some(MqError::ConnectionLost { via: InitSource::Config })
        ));
        assert!(!report.is_ok());

        let report = CheckOutcome::Reinitialized {
            via: InitSource::Location("mq.yml".into()),
            error: Some(MqError::EmptySource),
        }
        .report("v1")
        .unwrap();
        assert!(report.version.is_none());
        assert!(matches!(report.init_error, Some(MqError::EmptySource)));
    }
}
