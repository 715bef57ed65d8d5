use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config;
use crate::errors::resolve_error_result;
use crate::repository::{GeoFilter, ResultRepository, TaskRepository};
use crate::types::{ErrorCode, ModuleName, RetrievalResult, Retriever, Task, TaskResult};

/// A probe engine for one module. Expected failures come back as failed
/// results; only unexpected errors surface as raw `Report`s for the
/// classifier. The shutdown token is the worker's own; probes observe it
/// at their next suspension point.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn do_work(
        &self,
        task: &Task,
        shutdown: &CancellationToken,
    ) -> Result<RetrievalResult>;
}

/// Runs the probe under the outer timer: the task timeout plus a buffer
/// so a wedged probe still yields exactly one result.
pub async fn execute_with_timeout(
    probe: &dyn Probe,
    task: &Task,
    timeout_buffer: Duration,
    shutdown: &CancellationToken,
) -> Result<RetrievalResult> {
    match tokio::time::timeout(task.timeout + timeout_buffer, probe.do_work(task, shutdown)).await
    {
        Err(_) => Ok(RetrievalResult::error(
            ErrorCode::Timeout,
            format!("timed out after {:?}", task.timeout),
        )),
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => match resolve_error_result(&err) {
            Some(result) => Ok(result),
            None => Err(err),
        },
    }
}

/// One worker process: pulls one task at a time, runs the probe, writes
/// one result. Concurrency comes from running several processes.
pub struct TaskWorkerProcess {
    id: Uuid,
    queue: TaskRepository,
    results: ResultRepository,
    probe: Box<dyn Probe>,
    module: ModuleName,
    accepted_countries: Option<GeoFilter>,
    accepted_continents: Option<GeoFilter>,
    poll_interval: Duration,
    timeout_buffer: Duration,
    retriever: Retriever,
}

impl TaskWorkerProcess {
    /// Builds a worker from the environment. The retriever identity is
    /// injected by the supervisor at spawn time.
    pub async fn new_from_env(module: ModuleName, probe: Box<dyn Probe>) -> Result<Self> {
        let queue = TaskRepository::connect(&config::get_required_string(
            config::QUEUE_DATABASE_URL,
        )?)
        .await?;
        let results = ResultRepository::connect(&config::get_required_string(
            config::RESULT_DATABASE_URL,
        )?)
        .await?;

        let retriever = Retriever {
            ip: config::get_required_string(config::PUBLIC_IP)?,
            city: config::get_required_string(config::CITY)?,
            region: config::get_required_string(config::REGION)?,
            country: config::get_required_string(config::COUNTRY)?,
            continent: config::get_required_string(config::CONTINENT)?,
            asn: config::get_required_string(config::ASN)?,
            isp: config::get_required_string(config::ISP)?,
            lat: config::get_required_f32(config::LATITUDE)?,
            long: config::get_required_f32(config::LONGITUDE)?,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            queue,
            results,
            probe,
            module,
            accepted_countries: GeoFilter::parse(&config::get_string(
                config::ACCEPTED_COUNTRIES,
                "",
            )),
            accepted_continents: GeoFilter::parse(&config::get_string(
                config::ACCEPTED_CONTINENTS,
                "",
            )),
            poll_interval: config::get_duration(
                config::TASK_WORKER_POLL_INTERVAL,
                Duration::from_secs(10),
            ),
            timeout_buffer: config::get_duration(
                config::TASK_WORKER_TIMEOUT_BUFFER,
                Duration::from_secs(10),
            ),
            retriever,
        })
    }

    pub async fn poll(&self, shutdown: CancellationToken) -> Result<()> {
        info!(worker = %self.id, module = %self.module, "worker polling for tasks");

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let task = self
                .queue
                .pop_one_matching(
                    self.module,
                    self.accepted_countries.as_ref(),
                    self.accepted_continents.as_ref(),
                )
                .await?;

            let Some(task) = task else {
                debug!("no task found");
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                    _ = shutdown.cancelled() => return Ok(()),
                }
            };

            info!(
                provider = %task.provider.id,
                cid = %task.content.cid,
                "found new task"
            );

            let retrieval = tokio::select! {
                result = execute_with_timeout(
                    self.probe.as_ref(),
                    &task,
                    self.timeout_buffer,
                    &shutdown,
                ) => {
                    match result {
                        Ok(retrieval) => retrieval,
                        Err(err) => {
                            // Unclassifiable: record the context and let the
                            // supervisor restart this process.
                            error!(
                                provider = %task.provider.id,
                                cid = %task.content.cid,
                                "failed to do work: {err:#}"
                            );
                            return Err(err);
                        }
                    }
                }
                _ = shutdown.cancelled() => return Ok(()),
            };

            let result = TaskResult {
                task,
                retriever: self.retriever.clone(),
                result: retrieval,
                created_at: Utc::now(),
            };
            self.results.insert_one(&result).await?;
            info!(success = result.result.success, "inserted result");
        }
    }
}

/// Shared main for the worker binaries.
pub async fn run_worker(module: ModuleName, probe: Box<dyn Probe>) -> Result<()> {
    let shutdown = shutdown_token();
    let worker = TaskWorkerProcess::new_from_env(module, probe).await?;
    worker.poll(shutdown).await
}

/// Cancelled on SIGINT/SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("SIGINT handler");
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        trigger.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, Provider};
    use std::collections::HashMap;

    struct SleepyProbe {
        sleep: Duration,
    }

    #[async_trait]
    impl Probe for SleepyProbe {
        async fn do_work(&self, _: &Task, _: &CancellationToken) -> Result<RetrievalResult> {
            tokio::time::sleep(self.sleep).await;
            Ok(RetrievalResult::success(
                Duration::from_millis(1),
                1,
                Duration::from_millis(2),
            ))
        }
    }

    struct FailingProbe {
        message: &'static str,
    }

    #[async_trait]
    impl Probe for FailingProbe {
        async fn do_work(&self, _: &Task, _: &CancellationToken) -> Result<RetrievalResult> {
            Err(color_eyre::eyre::eyre!(self.message))
        }
    }

    fn task_with_timeout(timeout: Duration) -> Task {
        Task {
            requester: "test".to_string(),
            module: ModuleName::Stub,
            metadata: HashMap::new(),
            provider: Provider {
                id: "f0100".to_string(),
                ..Default::default()
            },
            content: Content {
                cid: "bafy".to_string(),
            },
            timeout,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_probe_yields_timeout_within_buffer() {
        let probe = SleepyProbe {
            sleep: Duration::from_secs(10),
        };
        let task = task_with_timeout(Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let shutdown = CancellationToken::new();
        let result = execute_with_timeout(&probe, &task, Duration::from_secs(1), &shutdown)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::Timeout));
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn fast_probe_result_passes_through() {
        let probe = SleepyProbe {
            sleep: Duration::from_millis(1),
        };
        let task = task_with_timeout(Duration::from_secs(5));

        let shutdown = CancellationToken::new();
        let result = execute_with_timeout(&probe, &task, Duration::from_secs(1), &shutdown)
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn classifiable_raw_errors_become_results() {
        let probe = FailingProbe {
            message: "peer said: Too many retrieval deals received",
        };
        let task = task_with_timeout(Duration::from_secs(5));

        let shutdown = CancellationToken::new();
        let result = execute_with_timeout(&probe, &task, Duration::from_secs(1), &shutdown)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::Throttled));
    }

    #[tokio::test]
    async fn unclassifiable_raw_errors_surface() {
        let probe = FailingProbe {
            message: "novel chaos",
        };
        let task = task_with_timeout(Duration::from_secs(5));

        let shutdown = CancellationToken::new();
        assert!(
            execute_with_timeout(&probe, &task, Duration::from_secs(1), &shutdown)
                .await
                .is_err()
        );
    }
}
