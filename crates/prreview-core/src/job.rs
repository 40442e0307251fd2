//! Review job payload, validated at the job-consumption boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid job payload: {0}")]
    Invalid(&'static str),
}

/// Wire shape of a job as delivered by the transport.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJob {
    run_id: Uuid,
    #[serde(alias = "prId")]
    target_id: Uuid,
    #[serde(default)]
    model: Option<String>,
}

/// "Run a review" work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewJob {
    pub run_id: Uuid,
    pub target_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ReviewJob {
    pub fn new(run_id: Uuid, target_id: Uuid, model: Option<String>) -> Self {
        Self {
            run_id,
            target_id,
            model: normalize_model(model),
        }
    }

    /// Decode and validate a raw JSON payload.
    pub fn from_payload(payload: &str) -> Result<Self, JobError> {
        let raw: RawJob = serde_json::from_str(payload)?;
        if raw.run_id.is_nil() {
            return Err(JobError::Invalid("runId must not be nil"));
        }
        if raw.target_id.is_nil() {
            return Err(JobError::Invalid("targetId must not be nil"));
        }
        Ok(Self::new(raw.run_id, raw.target_id, raw.model))
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Transport dedup key: one job per run.
    pub fn idempotency_key(&self) -> String {
        self.run_id.to_string()
    }
}

fn normalize_model(model: Option<String>) -> Option<String> {
    model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_payload_accepts_camel_case_and_pr_alias() {
        let run_id = Uuid::new_v4();
        let target_id = Uuid::new_v4();
        let payload = format!(r#"{{"runId":"{}","prId":"{}","model":" llama3 "}}"#, run_id, target_id);
        let job = ReviewJob::from_payload(&payload).unwrap();
        assert_eq!(job.run_id, run_id);
        assert_eq!(job.target_id, target_id);
        assert_eq!(job.model.as_deref(), Some("llama3"));
        assert_eq!(job.idempotency_key(), run_id.to_string());
    }

    #[test]
    fn from_payload_drops_blank_model() {
        let payload = format!(
            r#"{{"runId":"{}","targetId":"{}","model":"  "}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        assert_eq!(ReviewJob::from_payload(&payload).unwrap().model, None);
    }

    #[test]
    fn from_payload_rejects_malformed() {
        assert!(matches!(
            ReviewJob::from_payload("not json"),
            Err(JobError::Malformed(_))
        ));
        assert!(matches!(
            ReviewJob::from_payload(r#"{"runId":"abc","targetId":"def"}"#),
            Err(JobError::Malformed(_))
        ));
        let nil = format!(r#"{{"runId":"{}","targetId":"{}"}}"#, Uuid::nil(), Uuid::new_v4());
        assert!(matches!(
            ReviewJob::from_payload(&nil),
            Err(JobError::Invalid(_))
        ));
    }

    #[test]
    fn payload_round_trips() {
        let job = ReviewJob::new(Uuid::new_v4(), Uuid::new_v4(), Some("m".into()));
        assert_eq!(ReviewJob::from_payload(&job.to_payload()).unwrap(), job);
    }
}
