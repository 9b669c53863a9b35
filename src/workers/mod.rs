pub mod paper_poll;
pub mod session_sweep;
pub mod stale_claim_cleanup;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::bot::TelegramBot;
use crate::config::WorkerConfig;
use crate::pipeline::PollPipeline;
use crate::store::Store;

/// Default timeout for a single worker invocation (5 minutes).
const WORKER_TIMEOUT: Duration = Duration::from_secs(300);

/// A poll round may walk many subscribers, each bounded by arXiv throttling.
const POLL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Drain period before scheduler shutdown to let in-flight tasks complete.
#[cfg(test)]
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
#[cfg(not(test))]
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// 所有 worker 的枚举，消除字符串匹配，编译期保证完整性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerName {
    PaperPoll,
    SessionSweep,
    StaleClaimCleanup,
}

impl WorkerName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaperPoll => "paper_poll",
            Self::SessionSweep => "session_sweep",
            Self::StaleClaimCleanup => "stale_claim_cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: WorkerName,
    pub cron: String,
    pub enabled: bool,
    pub timeout: Duration,
}

pub struct WorkerManager {
    store: Arc<Store>,
    pipeline: Option<Arc<PollPipeline>>,
    bot: Option<Arc<TelegramBot>>,
    shutdown_rx: broadcast::Receiver<()>,
    config: WorkerConfig,
}

impl WorkerManager {
    pub fn new(
        store: Arc<Store>,
        pipeline: Option<Arc<PollPipeline>>,
        bot: Option<Arc<TelegramBot>>,
        shutdown_rx: broadcast::Receiver<()>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            bot,
            shutdown_rx,
            config: config.clone(),
        }
    }

    /// Single source of truth for all planned jobs and their cron schedules.
    pub fn planned_jobs(&self) -> Vec<JobSpec> {
        if !self.config.is_leader {
            return Vec::new();
        }

        vec![
            JobSpec {
                name: WorkerName::PaperPoll,
                cron: self.config.poll_cron.clone(),
                enabled: self.pipeline.is_some(),
                timeout: POLL_TIMEOUT,
            },
            JobSpec {
                name: WorkerName::SessionSweep,
                cron: "*/5 * * * * *".to_string(),
                // 仅在 Telegram bot 运行时需要
                enabled: self.bot.is_some(),
                timeout: SWEEP_TIMEOUT,
            },
            JobSpec {
                name: WorkerName::StaleClaimCleanup,
                cron: "0 */10 * * * *".to_string(),
                enabled: true,
                timeout: WORKER_TIMEOUT,
            },
        ]
    }

    /// Start the worker scheduler. Returns an error if the scheduler cannot be created or started.
    pub async fn start(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.config.is_leader {
            tracing::info!("Worker leader disabled; skipping worker startup");
            return Ok(());
        }

        let mut scheduler = JobScheduler::new().await?;

        self.register_jobs(&scheduler).await;

        scheduler.start().await?;

        tracing::info!("Worker manager started");
        let _ = self.shutdown_rx.recv().await;

        tracing::info!(
            "Worker manager shutting down, draining for {}s",
            DRAIN_TIMEOUT.as_secs()
        );
        tokio::time::sleep(DRAIN_TIMEOUT).await;
        let _ = scheduler.shutdown().await;
        Ok(())
    }

    /// Register all jobs with the scheduler, using `planned_jobs()` as the single source of truth.
    async fn register_jobs(&self, scheduler: &JobScheduler) {
        for spec in &self.planned_jobs() {
            let name_str = spec.name.as_str();
            if !spec.enabled {
                tracing::info!(name = name_str, "Skipping disabled worker");
                continue;
            }

            match spec.name {
                WorkerName::PaperPoll => {
                    let Some(pipeline) = self.pipeline.clone() else {
                        continue;
                    };
                    add_job(scheduler, &spec.cron, name_str, spec.timeout, move || {
                        let pipeline = pipeline.clone();
                        async move {
                            paper_poll::run(&pipeline).await;
                        }
                    })
                    .await;
                }
                WorkerName::SessionSweep => {
                    let Some(bot) = self.bot.clone() else {
                        continue;
                    };
                    add_job(scheduler, &spec.cron, name_str, spec.timeout, move || {
                        let bot = bot.clone();
                        async move {
                            session_sweep::run(&bot).await;
                        }
                    })
                    .await;
                }
                WorkerName::StaleClaimCleanup => {
                    let store = self.store.clone();
                    let stale_after = chrono::Duration::minutes(self.config.stale_claim_minutes);
                    add_job(scheduler, &spec.cron, name_str, spec.timeout, move || {
                        let store = store.clone();
                        async move {
                            stale_claim_cleanup::run(&store, stale_after).await;
                        }
                    })
                    .await;
                }
            }
            tracing::info!(name = name_str, cron = %spec.cron, "Registered worker");
        }
    }
}

/// Add a job to the scheduler with an overlap guard and timeout wrapper.
async fn add_job<Fut, F>(
    scheduler: &JobScheduler,
    cron: &str,
    name: &'static str,
    timeout: Duration,
    mut run: F,
) where
    F: FnMut() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(false));

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let running = running.clone();
        let fut = run();
        Box::pin(async move {
            run_exclusive(running, name, timeout, fut).await;
        })
    });

    match job {
        Ok(job) => {
            if let Err(err) = scheduler.add(job).await {
                tracing::error!(error=%err, cron, worker = name, "Failed to add worker job");
            }
        }
        Err(err) => tracing::error!(error=%err, cron, worker = name, "Failed to create worker job"),
    }
}

/// Clears the overlap flag on every exit path, panics and timeouts included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs one invocation on its own task. Returns `false` if it was skipped
/// because the previous invocation is still in progress.
async fn run_exclusive<Fut>(
    running: Arc<AtomicBool>,
    name: &'static str,
    timeout: Duration,
    fut: Fut,
) -> bool
where
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::warn!(
            worker = name,
            "Skipping worker invocation: previous run still in progress"
        );
        return false;
    }
    let _guard = RunningGuard(running);

    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(worker = name, "Worker panicked");
        }
        Ok(Err(e)) => tracing::error!(worker = name, error = %e, "Worker task failed"),
        Err(_) => {
            abort.abort();
            tracing::error!(
                worker = name,
                timeout_secs = timeout.as_secs(),
                "Worker timed out"
            );
        }
    }
    true
}
