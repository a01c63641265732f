//! # Job Reconciler
//!
//! Maps a verified generation-provider notification onto a job transition and
//! refunds the job's charge when it fails.
//!
//! The job's status is the idempotency token. Only the delivery that wins the
//! `{pending, processing} -> failed` compare-and-swap issues a refund, so
//! duplicate or reordered terminal notifications never refund twice. The first
//! terminal notification to arrive wins; later ones are no-ops.

use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ledger::{EntryRequest, Ledger, LedgerError};
use crate::models::job::{JobKind, JobStatus, Model as Job};
use crate::models::ledger_entry::{LedgerEntryKind, job_ref};
use crate::repositories::job::{JobStore, JobStoreError, TransitionFields};
use crate::webhook_verification::{GenerationEvent, GenerationOutcome};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("job {job_id} has unknown kind '{kind}'")]
    UnknownKind { job_id: i32, kind: String },
}

/// What reconciling a notification did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed { job_id: i32 },
    /// The job failed and `refunded` credits were returned
    Failed { job_id: i32, refunded: i64 },
    /// The job is failed but its refund could not be written; candidate for a forced refund
    RefundPending { job_id: i32 },
    /// The job was already terminal; nothing changed
    AlreadyTerminal { job_id: i32, status: String },
    /// No job carries this provider request id
    UnknownJob { request_id: String },
}

#[derive(Clone)]
pub struct JobReconciler {
    jobs: JobStore,
    ledger: Ledger,
}

impl JobReconciler {
    pub fn new(jobs: JobStore, ledger: Ledger) -> Self {
        Self { jobs, ledger }
    }

    pub async fn reconcile(
        &self,
        event: &GenerationEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(job) = self
            .jobs
            .find_by_provider_request_id(&event.request_id)
            .await?
        else {
            warn!(request_id = %event.request_id, "Generation webhook for unknown job");
            return Ok(ReconcileOutcome::UnknownJob {
                request_id: event.request_id.clone(),
            });
        };

        let Some(kind) = job.job_kind() else {
            error!(job_id = job.id, kind = %job.kind, "Job has unknown kind");
            return Err(ReconcileError::UnknownKind {
                job_id: job.id,
                kind: job.kind,
            });
        };

        match event.outcome {
            GenerationOutcome::Success => match extract_result_url(kind, &event.payload) {
                Some(url) => self.complete(&job, kind, url).await,
                None => {
                    warn!(
                        job_id = job.id,
                        request_id = %event.request_id,
                        "Provider reported success without a result"
                    );
                    self.fail(&job, "Generation completed without a result".to_string())
                        .await
                }
            },
            GenerationOutcome::Failure => {
                let message = event
                    .error
                    .clone()
                    .unwrap_or_else(|| "Generation provider reported failure".to_string());
                self.fail(&job, message).await
            }
        }
    }

    async fn complete(
        &self,
        job: &Job,
        kind: JobKind,
        url: String,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match self
            .jobs
            .transition(
                job.id,
                &JobStatus::ACTIVE,
                JobStatus::Completed,
                TransitionFields::result(kind, url),
            )
            .await
        {
            Ok(_) => {
                info!(job_id = job.id, kind = %kind, "Job completed");
                Ok(ReconcileOutcome::Completed { job_id: job.id })
            }
            Err(JobStoreError::Conflict { job_id, current }) => {
                info!(job_id, status = %current, "Completion for terminal job ignored");
                Ok(ReconcileOutcome::AlreadyTerminal {
                    job_id,
                    status: current,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(&self, job: &Job, message: String) -> Result<ReconcileOutcome, ReconcileError> {
        let failed = match self
            .jobs
            .transition(
                job.id,
                &JobStatus::ACTIVE,
                JobStatus::Failed,
                TransitionFields::error(message),
            )
            .await
        {
            Ok(failed) => failed,
            Err(JobStoreError::Conflict { job_id, current }) => {
                info!(job_id, status = %current, "Failure for terminal job ignored");
                return Ok(ReconcileOutcome::AlreadyTerminal {
                    job_id,
                    status: current,
                });
            }
            Err(e) => return Err(e.into()),
        };

        // The failure is committed; a refund error must not undo or hide it.
        match refund_job(&self.ledger, &failed, "Refund for failed job").await {
            Ok(refunded) => Ok(ReconcileOutcome::Failed {
                job_id: failed.id,
                refunded,
            }),
            Err(e) => {
                error!(
                    job_id = failed.id,
                    account_id = failed.account_id,
                    error = %e,
                    "Refund for failed job could not be recorded"
                );
                counter!("job_refund_failures_total").increment(1);
                Ok(ReconcileOutcome::RefundPending { job_id: failed.id })
            }
        }
    }
}

/// Credit back what the job was charged. Returns the refunded amount, which is
/// zero when nothing was charged or a refund already exists.
pub(crate) async fn refund_job(
    ledger: &Ledger,
    job: &Job,
    description: &str,
) -> Result<i64, LedgerError> {
    if job.credits_charged <= 0 {
        return Ok(0);
    }

    let request = EntryRequest::new(
        job.account_id,
        job.credits_charged,
        LedgerEntryKind::Refund,
        format!("{description} #{}", job.id),
    )
    .with_external_ref(job_ref(job.id));

    match ledger.credit(request).await {
        Ok(_) => {
            counter!("job_refunds_total", "kind" => kind_label(job)).increment(1);
            Ok(job.credits_charged)
        }
        Err(LedgerError::DuplicateEntry { .. }) => {
            info!(job_id = job.id, "Refund already recorded");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

fn kind_label(job: &Job) -> &'static str {
    job.job_kind().map(|k| k.as_str()).unwrap_or("unknown")
}

/// Locate the result reference in a provider payload
pub fn extract_result_url(kind: JobKind, payload: &Value) -> Option<String> {
    let pointers: &[&str] = match kind {
        JobKind::Video => &["/video/url", "/video_url"],
        JobKind::Training => &["/diffusers_lora_file/url", "/model_url"],
    };

    pointers
        .iter()
        .filter_map(|pointer| payload.pointer(pointer))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|url| !url.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_video_url_from_either_shape() {
        assert_eq!(
            extract_result_url(JobKind::Video, &json!({"video": {"url": "https://cdn/a.mp4"}})),
            Some("https://cdn/a.mp4".to_string())
        );
        assert_eq!(
            extract_result_url(JobKind::Video, &json!({"video_url": "https://cdn/b.mp4"})),
            Some("https://cdn/b.mp4".to_string())
        );
    }

    #[test]
    fn extracts_training_artifact() {
        assert_eq!(
            extract_result_url(
                JobKind::Training,
                &json!({"diffusers_lora_file": {"url": "https://cdn/lora.safetensors"}})
            ),
            Some("https://cdn/lora.safetensors".to_string())
        );
    }

    #[test]
    fn missing_or_blank_result_is_none() {
        assert_eq!(extract_result_url(JobKind::Video, &Value::Null), None);
        assert_eq!(
            extract_result_url(JobKind::Video, &json!({"video": {"url": "  "}})),
            None
        );
        // A training artifact does not satisfy a video job
        assert_eq!(
            extract_result_url(JobKind::Video, &json!({"model_url": "https://cdn/x"})),
            None
        );
    }
}
