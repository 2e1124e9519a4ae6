use chrono::{DateTime, Utc};
use serde::Deserialize;

use portal_infra::jobs::{Job, JobCommand, JobKind};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Option<serde_json::Value>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

impl CreateJobRequest {
    /// Decode into a typed command; unknown types and malformed payloads are rejected.
    pub fn command(&self) -> Result<JobCommand, portal_infra::jobs::JobError> {
        let empty = serde_json::Value::Object(Default::default());
        JobCommand::decode(&self.job_type, self.payload.as_ref().unwrap_or(&empty))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepJobsRequest {
    pub batch_size: Option<usize>,
}

// -------------------------
// Response mapping
// -------------------------

/// JSON view of a job record. Secrets in payloads are masked.
pub fn job_to_json(job: &Job) -> serde_json::Value {
    let mut payload = job.payload.clone();
    if job.job_type == JobKind::ChangePassword.as_str() {
        if let Some(secret) = payload.get_mut("new_password") {
            *secret = serde_json::Value::String("<redacted>".to_string());
        }
    }

    serde_json::json!({
        "id": job.id.to_string(),
        "type": job.job_type,
        "status": job.status,
        "payload": payload,
        "owner_id": job.owner_id.map(|o| o.to_string()),
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "next_run_at": job.next_run_at,
        "locked_by": job.locked_by,
        "locked_at": job.locked_at,
        "last_attempt_at": job.last_attempt_at,
        "last_error": job.last_error,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}
