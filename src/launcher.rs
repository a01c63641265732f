//! # Job Launcher
//!
//! Opens the job flow: the pending job and its consumption entry are written in
//! one transaction, then the job is submitted to the generation provider.
//! A failed submission leaves the job `pending` and charged; the provider's
//! webhook or an admin refund settles it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use sea_orm::{DatabaseConnection, DbErr, TransactionTrait};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::config::{AppConfig, GenerationConfig};
use crate::ledger::{EntryRequest, Ledger, LedgerError};
use crate::models::job::{JobKind, JobStatus, Model as Job};
use crate::models::ledger_entry::{LedgerEntryKind, job_ref};
use crate::repositories::job::{JobStore, JobStoreError, NewJob};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IMAGE_URL_LEN: usize = 2048;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("generation provider API key is not configured")]
    MissingApiKey,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("generation provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("generation provider response carried no request id")]
    MissingRequestId,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0}")]
    Validation(String),

    #[error("job {0} not found")]
    ModelJobNotFound(i32),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    /// The job was created and charged but the provider rejected the submission
    #[error("job {job_id} could not be submitted: {source}")]
    UpstreamFailure {
        job_id: i32,
        #[source]
        source: ProviderError,
    },

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// What is sent to the generation provider
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: JobKind,
    pub input: Value,
    pub webhook_url: String,
}

/// Submits jobs to the generation provider and returns its request id
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// Generation provider reached over its HTTP queue API
pub struct HttpGenerationProvider {
    client: reqwest::Client,
    config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: Option<String>,
}

impl HttpGenerationProvider {
    pub fn new(config: GenerationConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    fn model_path(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::Training => &self.config.training_model,
            JobKind::Video => &self.config.video_model,
        }
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey)?;
        let url = format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.model_path(request.kind).trim_start_matches('/')
        );

        let response = self
            .client
            .post(url)
            .query(&[("fal_webhook", request.webhook_url.as_str())])
            .header("Authorization", format!("Key {api_key}"))
            .json(&request.input)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: SubmitResponse = response.json().await?;
        body.request_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ProviderError::MissingRequestId)
    }
}

/// Training launch parameters
#[derive(Debug, Clone)]
pub struct TrainingLaunch {
    pub display_name: String,
    pub trigger_token: String,
    pub image_urls: Vec<String>,
}

/// Video launch parameters
#[derive(Debug, Clone)]
pub struct VideoLaunch {
    pub source_image_url: String,
    pub motion_prompt: String,
    /// Completed training job whose model conditions the video
    pub model_job_id: Option<i32>,
}

#[derive(Clone)]
pub struct JobLauncher {
    db: DatabaseConnection,
    jobs: JobStore,
    ledger: Ledger,
    provider: Arc<dyn GenerationProvider>,
    training_cost: i64,
    video_cost: i64,
    webhook_url: String,
}

impl JobLauncher {
    pub fn new(
        db: DatabaseConnection,
        provider: Arc<dyn GenerationProvider>,
        config: &AppConfig,
    ) -> Self {
        Self {
            jobs: JobStore::new(db.clone()),
            ledger: Ledger::new(db.clone()),
            db,
            provider,
            training_cost: config.pricing.training_credit_cost,
            video_cost: config.pricing.video_credit_cost,
            webhook_url: config.generation_webhook_url(),
        }
    }

    pub async fn launch_training(
        &self,
        account_id: i32,
        launch: TrainingLaunch,
    ) -> Result<Job, LaunchError> {
        let display_name = required("displayName", &launch.display_name)?;
        let trigger_token = required("triggerToken", &launch.trigger_token)?;
        let image_urls = launch
            .image_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(|url| image_url("imageUrls", url))
            .collect::<Result<Vec<_>, _>>()?;
        if image_urls.is_empty() {
            return Err(LaunchError::Validation(
                "imageUrls must contain at least one image".to_string(),
            ));
        }
        let image_count = i32::try_from(image_urls.len())
            .map_err(|_| LaunchError::Validation("too many images".to_string()))?;

        let job = self
            .create_charged(NewJob::training(
                account_id,
                display_name,
                trigger_token.clone(),
                image_count,
                self.training_cost,
            ))
            .await?;

        let input = json!({
            "images_urls": image_urls,
            "trigger_word": trigger_token,
        });
        self.submit(job, JobKind::Training, input).await
    }

    pub async fn launch_video(
        &self,
        account_id: i32,
        launch: VideoLaunch,
    ) -> Result<Job, LaunchError> {
        let source_image_url = image_url(
            "sourceImageUrl",
            &required("sourceImageUrl", &launch.source_image_url)?,
        )?;
        let motion_prompt = required("motionPrompt", &launch.motion_prompt)?;

        let model_url = match launch.model_job_id {
            Some(model_job_id) => Some(self.trained_model_url(account_id, model_job_id).await?),
            None => None,
        };

        let job = self
            .create_charged(NewJob::video(
                account_id,
                source_image_url.clone(),
                motion_prompt.clone(),
                launch.model_job_id,
                self.video_cost,
            ))
            .await?;

        let mut input = json!({
            "image_url": source_image_url,
            "prompt": motion_prompt,
        });
        if let Some(model_url) = model_url {
            input["loras"] = json!([{ "path": model_url }]);
        }
        self.submit(job, JobKind::Video, input).await
    }

    async fn trained_model_url(&self, account_id: i32, model_job_id: i32) -> Result<String, LaunchError> {
        let model_job = self
            .jobs
            .find_for_account(account_id, model_job_id)
            .await?
            .ok_or(LaunchError::ModelJobNotFound(model_job_id))?;

        if model_job.job_kind() != Some(JobKind::Training)
            || model_job.job_status() != Some(JobStatus::Completed)
        {
            return Err(LaunchError::Validation(format!(
                "job {model_job_id} is not a completed training job"
            )));
        }

        model_job.model_url.ok_or_else(|| {
            LaunchError::Validation(format!("job {model_job_id} has no trained model"))
        })
    }

    /// Insert the pending job and debit its price atomically
    async fn create_charged(&self, new_job: NewJob) -> Result<Job, LaunchError> {
        let price = new_job.credits_charged;
        let txn = self.db.begin().await?;

        let job = self.jobs.create_in(&txn, new_job).await?;
        self.ledger
            .debit_in(
                &txn,
                EntryRequest::new(
                    job.account_id,
                    price,
                    LedgerEntryKind::Consumption,
                    format!("{} job #{}", capitalized(job.kind.as_str()), job.id),
                )
                .with_external_ref(job_ref(job.id)),
            )
            .await?;

        txn.commit().await?;
        Ok(job)
    }

    async fn submit(&self, job: Job, kind: JobKind, input: Value) -> Result<Job, LaunchError> {
        let request = GenerationRequest {
            kind,
            input,
            webhook_url: self.webhook_url.clone(),
        };

        match self.provider.submit(&request).await {
            Ok(request_id) => {
                let job = self.jobs.attach_provider_request(job.id, &request_id).await?;
                counter!("jobs_launched_total", "kind" => kind.as_str()).increment(1);
                info!(job_id = job.id, request_id = %request_id, kind = %kind, "Job submitted");
                Ok(job)
            }
            Err(source) => {
                counter!("job_submission_failures_total", "kind" => kind.as_str()).increment(1);
                error!(
                    job_id = job.id,
                    account_id = job.account_id,
                    error = %source,
                    "Generation provider rejected job; left pending"
                );
                Err(LaunchError::UpstreamFailure {
                    job_id: job.id,
                    source,
                })
            }
        }
    }
}

fn required(field: &str, value: &str) -> Result<String, LaunchError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LaunchError::Validation(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

/// Images are fetched by the provider, so only absolute HTTP(S) URLs are accepted
fn image_url(field: &str, value: &str) -> Result<String, LaunchError> {
    if value.len() > MAX_IMAGE_URL_LEN {
        return Err(LaunchError::Validation(format!(
            "{field} entries must be less than {MAX_IMAGE_URL_LEN} characters"
        )));
    }

    let parsed = Url::parse(value)
        .map_err(|_| LaunchError::Validation(format!("{field} must be a valid URL")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(LaunchError::Validation(format!(
            "{field} must use HTTP or HTTPS"
        )));
    }

    Ok(value.to_string())
}

fn capitalized(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_trims_and_rejects_blank() {
        assert_eq!(required("displayName", "  Rex ").ok(), Some("Rex".to_string()));
        assert!(matches!(
            required("displayName", "   "),
            Err(LaunchError::Validation(msg)) if msg.contains("displayName")
        ));
    }

    #[test]
    fn image_urls_must_be_http() {
        assert!(image_url("imageUrls", "https://cdn.example.com/rex.jpg").is_ok());
        assert!(image_url("imageUrls", "http://localhost:9000/rex.jpg").is_ok());
        assert!(image_url("imageUrls", "rex.jpg").is_err());
        assert!(image_url("imageUrls", "file:///etc/passwd").is_err());
        let long = format!("https://cdn.example.com/{}", "a".repeat(2048));
        assert!(image_url("imageUrls", &long).is_err());
    }

    #[test]
    fn capitalizes_kind_for_descriptions() {
        assert_eq!(capitalized("training"), "Training");
        assert_eq!(capitalized(""), "");
    }
}
