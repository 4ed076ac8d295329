use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use ontos_protocol::{JobId, JobInfo, JobSpec, JobTask, OntosError, OntosResult, SchedulerPort};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

struct JobState {
    info: Mutex<JobInfo>,
    task: JobTask,
}

impl JobState {
    async fn run_once(&self) {
        let name = self.info.lock().name.clone();
        let result = (self.task)().await;
        let mut info = self.info.lock();
        info.run_count += 1;
        info.last_run_at = Some(Utc::now());
        match result {
            Ok(()) => {
                debug!(job = %name, runs = info.run_count, "job ran");
                info.last_error = None;
            }
            Err(error) => {
                warn!(job = %name, %error, "job failed");
                info.last_error = Some(error.to_string());
            }
        }
    }
}

struct ScheduledJob {
    state: Arc<JobState>,
    handle: JoinHandle<()>,
}

/// Interval jobs on the tokio runtime. Each job gets its own task; a paused
/// job keeps ticking but skips its body.
#[derive(Default)]
pub struct TokioScheduler {
    jobs: Mutex<IndexMap<JobId, ScheduledJob>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, job_id: &JobId) -> OntosResult<Arc<JobState>> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|job| job.state.clone())
            .ok_or_else(|| OntosError::not_found("Job", job_id.as_str()))
    }

    fn set_paused(&self, job_id: &JobId, paused: bool) -> OntosResult<()> {
        let state = self.state(job_id)?;
        state.info.lock().paused = paused;
        debug!(job_id = %job_id, paused, "job pause state changed");
        Ok(())
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for job in self.jobs.get_mut().values() {
            job.handle.abort();
        }
    }
}

#[async_trait]
impl SchedulerPort for TokioScheduler {
    async fn add_job(&self, spec: JobSpec, task: JobTask) -> OntosResult<JobId> {
        if spec.interval_secs == 0 {
            return Err(OntosError::Configuration(format!("job {} has a zero interval", spec.name)));
        }
        let job_id = JobId::new_uuid();
        let state = Arc::new(JobState {
            info: Mutex::new(JobInfo {
                job_id: job_id.clone(),
                name: spec.name.clone(),
                interval_secs: spec.interval_secs,
                paused: false,
                run_count: 0,
                last_run_at: None,
                last_error: None,
            }),
            task,
        });

        let period = Duration::from_secs(spec.interval_secs);
        let runner = state.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if runner.info.lock().paused {
                    continue;
                }
                runner.run_once().await;
            }
        });
        info!(job = %spec.name, job_id = %job_id, interval_secs = spec.interval_secs, "job scheduled");
        self.jobs.lock().insert(job_id.clone(), ScheduledJob { state, handle });
        Ok(job_id)
    }

    async fn remove_job(&self, job_id: &JobId) -> OntosResult<()> {
        let job = self
            .jobs
            .lock()
            .shift_remove(job_id)
            .ok_or_else(|| OntosError::not_found("Job", job_id.as_str()))?;
        job.handle.abort();
        info!(job_id = %job_id, "job removed");
        Ok(())
    }

    async fn pause_job(&self, job_id: &JobId) -> OntosResult<()> {
        self.set_paused(job_id, true)
    }

    async fn resume_job(&self, job_id: &JobId) -> OntosResult<()> {
        self.set_paused(job_id, false)
    }

    async fn get_jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .lock()
            .values()
            .map(|job| job.state.info.lock().clone())
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn trigger_job(&self, job_id: &JobId) -> OntosResult<()> {
        let state = self.state(job_id)?;
        state.run_once().await;
        let last_error = state.info.lock().last_error.clone();
        match last_error {
            Some(error) => Err(OntosError::Internal(format!("job failed: {error}"))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use futures_util::FutureExt;

    fn counting(counter: Arc<AtomicUsize>) -> JobTask {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), OntosError>(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn trigger_runs_even_when_paused() -> anyhow::Result<()> {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = scheduler
            .add_job(JobSpec::every("nightly", 86_400), counting(counter.clone()))
            .await?;
        scheduler.pause_job(&id).await?;
        scheduler.trigger_job(&id).await?;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let jobs = scheduler.get_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].paused);
        assert_eq!(jobs[0].run_count, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn interval_jobs_tick_until_removed() -> anyhow::Result<()> {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = scheduler
            .add_job(JobSpec::every("purge", 10), counting(counter.clone()))
            .await?;
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        scheduler.remove_job(&id).await?;
        assert!(scheduler.get_jobs().await.is_empty());
        assert_eq!(scheduler.trigger_job(&id).await.unwrap_err().error_code(), "NOT_FOUND");
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_recorded_and_zero_intervals_rejected() -> anyhow::Result<()> {
        let scheduler = TokioScheduler::new();
        let failing: JobTask = Arc::new(|| async { Err::<(), _>(OntosError::upstream("pms", "down")) }.boxed());
        let id = scheduler.add_job(JobSpec::every("flaky", 60), failing).await?;
        assert!(scheduler.trigger_job(&id).await.is_err());
        assert!(scheduler.get_jobs().await[0].last_error.is_some());

        let zero: JobTask = Arc::new(|| async { Ok::<(), OntosError>(()) }.boxed());
        assert!(scheduler.add_job(JobSpec::every("never", 0), zero).await.is_err());
        Ok(())
    }
}
