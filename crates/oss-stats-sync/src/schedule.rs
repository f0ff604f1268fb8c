//! Named interval jobs. Registering under an existing name replaces it, so a
//! sync that reschedules itself never leaves two recurring jobs behind.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncArgs;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub name: String,
    pub interval: Duration,
    pub args: SyncArgs,
}

/// Emitted each time a registered job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRun {
    pub job_name: String,
    pub args: SyncArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Created,
    Replaced,
}

#[async_trait]
pub trait IntervalScheduler: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ScheduledJob>, SyncError>;

    async fn delete(&self, name: &str) -> Result<bool, SyncError>;

    async fn register(&self, job: ScheduledJob) -> Result<(), SyncError>;

    /// Leaves exactly one job registered under `job.name`.
    async fn replace_or_create(&self, job: ScheduledJob) -> Result<ReplaceOutcome, SyncError> {
        let replaced = self.delete(&job.name).await?;
        self.register(job).await?;
        Ok(if replaced {
            ReplaceOutcome::Replaced
        } else {
            ReplaceOutcome::Created
        })
    }
}

/// Records registrations without running anything.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<ScheduledJob> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<_> = jobs.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[async_trait]
impl IntervalScheduler for InMemoryScheduler {
    async fn get(&self, name: &str) -> Result<Option<ScheduledJob>, SyncError> {
        Ok(self.jobs.lock().await.get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<bool, SyncError> {
        Ok(self.jobs.lock().await.remove(name).is_some())
    }

    async fn register(&self, job: ScheduledJob) -> Result<(), SyncError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.name) {
            return Err(SyncError::Schedule(format!("job `{}` already registered", job.name)));
        }
        jobs.insert(job.name.clone(), job);
        Ok(())
    }

    async fn replace_or_create(&self, job: ScheduledJob) -> Result<ReplaceOutcome, SyncError> {
        let mut jobs = self.jobs.lock().await;
        let previous = jobs.insert(job.name.clone(), job);
        Ok(match previous {
            Some(_) => ReplaceOutcome::Replaced,
            None => ReplaceOutcome::Created,
        })
    }
}

/// Runs jobs on a `tokio-cron-scheduler` instance and hands each firing to
/// whoever holds the receiving end of the run channel.
pub struct CronIntervalScheduler {
    scheduler: JobScheduler,
    namespace: String,
    runs: mpsc::UnboundedSender<ScheduledRun>,
    jobs: Mutex<HashMap<String, (Uuid, ScheduledJob)>>,
}

fn schedule_err(context: &str, err: impl std::fmt::Display) -> SyncError {
    SyncError::Schedule(format!("{context}: {err}"))
}

impl CronIntervalScheduler {
    pub async fn start(
        namespace: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ScheduledRun>), SyncError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| schedule_err("creating scheduler", e))?;
        scheduler
            .start()
            .await
            .map_err(|e| schedule_err("starting scheduler", e))?;
        let (runs, rx) = mpsc::unbounded_channel();
        info!(namespace, "interval scheduler started");
        Ok((
            Self {
                scheduler,
                namespace: namespace.to_string(),
                runs,
                jobs: Mutex::new(HashMap::new()),
            },
            rx,
        ))
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    async fn add_job(&self, job: &ScheduledJob) -> Result<Uuid, SyncError> {
        let run = ScheduledRun {
            job_name: self.qualified(&job.name),
            args: job.args.clone(),
        };
        let runs = self.runs.clone();
        let cron_job = Job::new_repeated_async(job.interval, move |_id, _sched| {
            let run = run.clone();
            let runs = runs.clone();
            Box::pin(async move {
                debug!(job = %run.job_name, "interval job fired");
                if runs.send(run).is_err() {
                    warn!("no sync runner is listening for scheduled runs");
                }
            })
        })
        .map_err(|e| schedule_err("creating interval job", e))?;
        self.scheduler
            .add(cron_job)
            .await
            .map_err(|e| schedule_err("adding interval job", e))
    }

    async fn remove_job(&self, id: &Uuid) -> Result<(), SyncError> {
        self.scheduler
            .remove(id)
            .await
            .map_err(|e| schedule_err("removing interval job", e))
    }

    pub async fn shutdown(mut self) -> Result<(), SyncError> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| schedule_err("stopping scheduler", e))
    }
}

/// Adds the new registration first, then drops the one it replaces. When the
/// old one cannot be removed the new one is withdrawn and `jobs` is untouched.
async fn swap_registration<A, R, F>(
    jobs: &mut HashMap<String, (Uuid, ScheduledJob)>,
    job: ScheduledJob,
    add: A,
    remove: R,
) -> Result<ReplaceOutcome, SyncError>
where
    A: Future<Output = Result<Uuid, SyncError>>,
    R: Fn(Uuid) -> F,
    F: Future<Output = Result<(), SyncError>>,
{
    let id = add.await?;
    let outcome = match jobs.get(&job.name).map(|(old_id, _)| *old_id) {
        Some(old_id) => {
            if let Err(err) = remove(old_id).await {
                if let Err(cleanup) = remove(id).await {
                    warn!(job = %job.name, error = %cleanup, "could not withdraw replacement job");
                }
                return Err(err);
            }
            ReplaceOutcome::Replaced
        }
        None => ReplaceOutcome::Created,
    };
    jobs.insert(job.name.clone(), (id, job));
    Ok(outcome)
}

#[async_trait]
impl IntervalScheduler for CronIntervalScheduler {
    async fn get(&self, name: &str) -> Result<Option<ScheduledJob>, SyncError> {
        Ok(self.jobs.lock().await.get(name).map(|(_, job)| job.clone()))
    }

    async fn delete(&self, name: &str) -> Result<bool, SyncError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(name) {
            Some((id, _)) => {
                self.remove_job(&id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn register(&self, job: ScheduledJob) -> Result<(), SyncError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.name) {
            return Err(SyncError::Schedule(format!("job `{}` already registered", job.name)));
        }
        let id = self.add_job(&job).await?;
        info!(job = %self.qualified(&job.name), interval_secs = job.interval.as_secs(), "job registered");
        jobs.insert(job.name.clone(), (id, job));
        Ok(())
    }

    async fn replace_or_create(&self, job: ScheduledJob) -> Result<ReplaceOutcome, SyncError> {
        let mut jobs = self.jobs.lock().await;
        let outcome = swap_registration(&mut jobs, job.clone(), self.add_job(&job), |id| async move {
            self.remove_job(&id).await
        })
        .await?;
        info!(job = %self.qualified(&job.name), ?outcome, interval_secs = job.interval.as_secs(), "job scheduled");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, owners: &[&str]) -> ScheduledJob {
        ScheduledJob {
            name: name.to_string(),
            interval: Duration::from_secs(3600),
            args: SyncArgs {
                github_access_token: "t".into(),
                github_owners: owners.iter().map(|o| o.to_string()).collect(),
                github_repos: vec![],
                npm_orgs: vec![],
                npm_packages: vec![],
                min_stars: 1,
            },
        }
    }

    #[tokio::test]
    async fn replace_keeps_a_single_registration() {
        let scheduler = InMemoryScheduler::new();
        assert_eq!(scheduler.replace_or_create(job("sync", &["a"])).await.unwrap(), ReplaceOutcome::Created);
        assert_eq!(scheduler.replace_or_create(job("sync", &["b"])).await.unwrap(), ReplaceOutcome::Replaced);

        let jobs = scheduler.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].args.github_owners, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn plain_register_refuses_duplicates() {
        let scheduler = InMemoryScheduler::new();
        scheduler.register(job("sync", &[])).await.unwrap();
        assert!(scheduler.register(job("sync", &[])).await.is_err());
        assert!(scheduler.delete("sync").await.unwrap());
        assert!(!scheduler.delete("sync").await.unwrap());
        assert!(scheduler.get("sync").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn default_replace_goes_through_delete_and_register() {
        struct Plain(InMemoryScheduler);

        #[async_trait]
        impl IntervalScheduler for Plain {
            async fn get(&self, name: &str) -> Result<Option<ScheduledJob>, SyncError> {
                self.0.get(name).await
            }
            async fn delete(&self, name: &str) -> Result<bool, SyncError> {
                self.0.delete(name).await
            }
            async fn register(&self, job: ScheduledJob) -> Result<(), SyncError> {
                self.0.register(job).await
            }
        }

        let scheduler = Plain(InMemoryScheduler::new());
        scheduler.replace_or_create(job("sync", &["a"])).await.unwrap();
        assert_eq!(
            scheduler.replace_or_create(job("sync", &["c"])).await.unwrap(),
            ReplaceOutcome::Replaced
        );
        assert_eq!(scheduler.get("sync").await.unwrap().unwrap().args.github_owners, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn failed_swap_withdraws_the_new_job_and_keeps_the_old_one() {
        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();
        let mut jobs = HashMap::from([("sync".to_string(), (old_id, job("sync", &["a"])))]);
        let removed = std::sync::Mutex::new(Vec::new());

        let result = swap_registration(&mut jobs, job("sync", &["b"]), async { Ok(new_id) }, |id| {
            removed.lock().unwrap().push(id);
            async move {
                if id == old_id {
                    Err(SyncError::Schedule("scheduler unavailable".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Schedule(_))));
        assert_eq!(*removed.lock().unwrap(), vec![old_id, new_id]);
        let (kept_id, kept) = &jobs["sync"];
        assert_eq!(*kept_id, old_id);
        assert_eq!(kept.args.github_owners, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn successful_swap_tracks_the_new_job() {
        let old_id = Uuid::new_v4();
        let new_id = Uuid::new_v4();
        let mut jobs = HashMap::from([("sync".to_string(), (old_id, job("sync", &["a"])))]);

        let outcome = swap_registration(&mut jobs, job("sync", &["b"]), async { Ok(new_id) }, |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::Replaced);
        assert_eq!(jobs["sync"].0, new_id);

        let outcome = swap_registration(&mut jobs, job("other", &[]), async { Ok(Uuid::new_v4()) }, |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, ReplaceOutcome::Created);
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_scheduler_fires_qualified_runs() {
        let (scheduler, mut runs) = CronIntervalScheduler::start("test").await.unwrap();
        let mut every_second = job("sync", &["a"]);
        every_second.interval = Duration::from_secs(1);
        scheduler.replace_or_create(every_second.clone()).await.unwrap();
        every_second.args.github_owners = vec!["b".into()];
        assert_eq!(
            scheduler.replace_or_create(every_second).await.unwrap(),
            ReplaceOutcome::Replaced
        );

        let run = tokio::time::timeout(Duration::from_secs(10), runs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.job_name, "test:sync");
        assert_eq!(run.args.github_owners, vec!["b".to_string()]);
        scheduler.shutdown().await.unwrap();
    }
}
