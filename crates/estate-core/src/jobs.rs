//! Import job ledger: the durable record of each import attempt and the pure
//! state machine that governs it.

use std::fmt;
use std::str::FromStr;

use blake3::Hasher;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::access::Principal;
use crate::datasets::{Dataset, RowError, ValidationReport};

pub const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Validate,
    Commit,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Validate => "validate",
            ImportMode::Commit => "commit",
        }
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "validate" => Ok(ImportMode::Validate),
            "commit" => Ok(ImportMode::Commit),
            other => Err(format!("unknown import mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    ValidateInProgress,
    Validated,
    CommitInProgress,
    Invalid,
    Committed,
    Expired,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::ValidateInProgress => "validate_in_progress",
            JobStatus::Validated => "validated",
            JobStatus::CommitInProgress => "commit_in_progress",
            JobStatus::Invalid => "invalid",
            JobStatus::Committed => "committed",
            JobStatus::Expired => "expired",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Invalid | JobStatus::Committed | JobStatus::Expired | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "validate_in_progress" => Ok(JobStatus::ValidateInProgress),
            "validated" => Ok(JobStatus::Validated),
            "commit_in_progress" => Ok(JobStatus::CommitInProgress),
            "invalid" => Ok(JobStatus::Invalid),
            "committed" => Ok(JobStatus::Committed),
            "expired" => Ok(JobStatus::Expired),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    ValidationPassed,
    ValidationFailed,
    /// Claims a validated job for exactly one commit.
    BeginCommit,
    CommitSucceeded,
    CommitFailed,
    Expire,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} to a job in status {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub event: JobEvent,
}

pub fn transition(from: JobStatus, event: JobEvent) -> Result<JobStatus, TransitionError> {
    match (from, event) {
        (JobStatus::ValidateInProgress, JobEvent::ValidationPassed) => Ok(JobStatus::Validated),
        (JobStatus::ValidateInProgress, JobEvent::ValidationFailed) => Ok(JobStatus::Invalid),
        (JobStatus::Validated, JobEvent::BeginCommit) => Ok(JobStatus::CommitInProgress),
        (JobStatus::CommitInProgress, JobEvent::CommitSucceeded) => Ok(JobStatus::Committed),
        (JobStatus::CommitInProgress, JobEvent::CommitFailed) => Ok(JobStatus::Failed),
        (JobStatus::Validated, JobEvent::Expire) => Ok(JobStatus::Expired),
        (from, event) => Err(TransitionError { from, event }),
    }
}

/// Why a stored job cannot be committed.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenRejection {
    Invalid { errors: Vec<RowError> },
    AlreadyCommitted,
    Expired,
    NotReady { status: JobStatus },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub requested_by: String,
    pub requested_by_id: Option<Uuid>,
    pub dataset: Dataset,
    pub mode: ImportMode,
    pub status: JobStatus,
    pub content_fingerprint: String,
    #[serde(skip_serializing)]
    pub raw_content: String,
    pub row_count: usize,
    pub imported_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub errors: Vec<RowError>,
    pub metadata: Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    /// Jobs are only ever created by a validate request.
    pub fn new_validation(
        principal: &Principal,
        dataset: Dataset,
        raw_content: String,
        row_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        ImportJob {
            id: Uuid::new_v4(),
            tenant_id: principal.tenant_id,
            requested_by: principal.username.clone(),
            requested_by_id: principal.user_id,
            dataset,
            mode: ImportMode::Validate,
            status: JobStatus::ValidateInProgress,
            content_fingerprint: content_fingerprint(&raw_content),
            raw_content,
            row_count,
            imported_count: 0,
            skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
            metadata: json!({}),
            expires_at: None,
            created_at: now,
            updated_at: now,
            committed_at: None,
        }
    }

    pub fn apply(&mut self, event: JobEvent, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = transition(self.status, event)?;
        self.updated_at = now;
        if self.status == JobStatus::Committed {
            self.committed_at = Some(now);
        }
        Ok(())
    }

    pub fn record_validation(
        &mut self,
        report: &ValidationReport,
        token_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.errors = report.errors.clone();
        self.error_count = report.errors.len();
        self.skipped_count = report.skipped;
        if report.is_valid() {
            self.apply(JobEvent::ValidationPassed, now)?;
            self.expires_at = Some(now + token_ttl);
        } else {
            self.apply(JobEvent::ValidationFailed, now)?;
        }
        Ok(())
    }

    pub fn record_commit(
        &mut self,
        imported: usize,
        skipped: usize,
        errors: Vec<RowError>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.apply(JobEvent::CommitSucceeded, now)?;
        self.mode = ImportMode::Commit;
        self.imported_count = imported;
        self.skipped_count = skipped;
        self.error_count = errors.len();
        self.errors = errors;
        Ok(())
    }

    /// Marks the job failed. The reason goes into `metadata`; `errors` stays
    /// reserved for row-level problems.
    pub fn record_failure(
        &mut self,
        imported: usize,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.apply(JobEvent::CommitFailed, now)?;
        self.mode = ImportMode::Commit;
        self.imported_count = imported;
        self.set_metadata("failure_reason", json!(reason));
        self.set_metadata("failed_at", json!(now.to_rfc3339()));
        self.set_metadata("imported_before_failure", json!(imported));
        Ok(())
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Matches on the stable user id when both sides have one, otherwise on
    /// the username.
    pub fn is_requested_by(&self, principal: &Principal) -> bool {
        if self.tenant_id != principal.tenant_id {
            return false;
        }
        match (self.requested_by_id, principal.user_id) {
            (Some(stored), Some(caller)) => stored == caller,
            _ => self.requested_by == principal.username,
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Decides whether `job` may be committed at `now`.
///
/// A `validated` job past its expiry is rejected as [`TokenRejection::Expired`];
/// the caller is responsible for persisting the `Expire` transition.
pub fn check_commit(job: &ImportJob, now: DateTime<Utc>) -> Result<(), TokenRejection> {
    match job.status {
        JobStatus::Validated if job.is_past_expiry(now) => Err(TokenRejection::Expired),
        JobStatus::Validated => Ok(()),
        JobStatus::Invalid => Err(TokenRejection::Invalid {
            errors: job.errors.clone(),
        }),
        JobStatus::Committed => Err(TokenRejection::AlreadyCommitted),
        JobStatus::Expired => Err(TokenRejection::Expired),
        status => Err(TokenRejection::NotReady { status }),
    }
}

pub fn content_fingerprint(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;

    fn principal() -> Principal {
        Principal::new(Uuid::new_v4(), "ravi", Role::User)
    }

    fn validated_job(now: DateTime<Utc>) -> ImportJob {
        let mut job =
            ImportJob::new_validation(&principal(), Dataset::Rainfall, "date,mm\n".into(), 1, now);
        let report = ValidationReport::default();
        job.record_validation(&report, Duration::minutes(DEFAULT_TOKEN_TTL_MINUTES), now)
            .expect("validation transition");
        job
    }

    fn claimed_job(now: DateTime<Utc>) -> ImportJob {
        let mut job = validated_job(now);
        job.apply(JobEvent::BeginCommit, now).expect("claim");
        job
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use JobEvent::*;
        use JobStatus::*;

        assert_eq!(transition(ValidateInProgress, ValidationPassed), Ok(Validated));
        assert_eq!(transition(ValidateInProgress, ValidationFailed), Ok(Invalid));
        assert_eq!(transition(Validated, BeginCommit), Ok(CommitInProgress));
        assert_eq!(transition(CommitInProgress, CommitSucceeded), Ok(Committed));
        assert_eq!(transition(CommitInProgress, CommitFailed), Ok(Failed));
        assert_eq!(transition(Validated, Expire), Ok(Expired));
    }

    #[test]
    fn commits_require_a_claim() {
        use JobEvent::*;
        use JobStatus::*;

        assert!(transition(Validated, CommitSucceeded).is_err());
        assert!(transition(Validated, CommitFailed).is_err());
        assert!(transition(CommitInProgress, BeginCommit).is_err());
        assert!(transition(CommitInProgress, Expire).is_err());
        assert!(!CommitInProgress.is_terminal());
        assert_eq!("commit_in_progress".parse::<JobStatus>(), Ok(CommitInProgress));
    }

    #[test]
    fn terminal_states_never_move() {
        use JobEvent::*;
        use JobStatus::*;

        for status in [Invalid, Committed, Expired, Failed] {
            for event in [
                ValidationPassed,
                ValidationFailed,
                BeginCommit,
                CommitSucceeded,
                CommitFailed,
                Expire,
            ] {
                assert!(transition(status, event).is_err(), "{status} accepted {event:?}");
            }
        }
        assert!(transition(ValidateInProgress, CommitSucceeded).is_err());
    }

    #[test]
    fn validated_job_gets_expiry_window() {
        let now = Utc::now();
        let job = validated_job(now);
        assert_eq!(job.status, JobStatus::Validated);
        assert_eq!(job.expires_at, Some(now + Duration::minutes(30)));
        assert!(check_commit(&job, now + Duration::minutes(29)).is_ok());
        assert_eq!(
            check_commit(&job, now + Duration::minutes(30)),
            Err(TokenRejection::Expired)
        );
    }

    #[test]
    fn invalid_job_surfaces_stored_errors() {
        let now = Utc::now();
        let mut job =
            ImportJob::new_validation(&principal(), Dataset::Sales, String::new(), 1, now);
        let report = ValidationReport {
            errors: vec![RowError::new(2, "Missing date")],
            skipped: 1,
        };
        job.record_validation(&report, Duration::minutes(30), now)
            .expect("transition");

        assert_eq!(job.status, JobStatus::Invalid);
        assert_eq!(job.error_count, 1);
        assert!(job.expires_at.is_none());
        match check_commit(&job, now) {
            Err(TokenRejection::Invalid { errors }) => assert_eq!(errors[0].row, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn committed_and_in_progress_jobs_are_rejected_distinctly() {
        let now = Utc::now();
        let mut job = claimed_job(now);
        assert_eq!(
            check_commit(&job, now),
            Err(TokenRejection::NotReady {
                status: JobStatus::CommitInProgress
            })
        );
        job.record_commit(1, 0, Vec::new(), now).expect("commit");
        assert_eq!(job.committed_at, Some(now));
        assert_eq!(check_commit(&job, now), Err(TokenRejection::AlreadyCommitted));

        let pending =
            ImportJob::new_validation(&principal(), Dataset::Sales, String::new(), 1, now);
        assert_eq!(
            check_commit(&pending, now),
            Err(TokenRejection::NotReady {
                status: JobStatus::ValidateInProgress
            })
        );
    }

    #[test]
    fn failure_reason_lives_in_metadata() {
        let now = Utc::now();
        let mut job = claimed_job(now);
        job.record_failure(100, "connection reset", now).expect("fail");

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.errors.is_empty());
        assert_eq!(job.metadata["failure_reason"], "connection reset");
        assert_eq!(job.metadata["imported_before_failure"], 100);
    }

    #[test]
    fn requester_matching_prefers_user_id() {
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let owner = principal().with_user_id(user_id);
        let job = ImportJob::new_validation(&owner, Dataset::Pepper, String::new(), 1, now);

        assert!(job.is_requested_by(&owner));

        let mut renamed = owner.clone();
        renamed.username = "ravi.k".into();
        assert!(job.is_requested_by(&renamed));

        let other = principal().with_user_id(Uuid::new_v4());
        assert!(!job.is_requested_by(&other));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let first = content_fingerprint("date,mm\n2024-01-01,5\n");
        assert_eq!(first, content_fingerprint("date,mm\n2024-01-01,5\n"));
        assert_ne!(first, content_fingerprint("date,mm\n2024-01-01,6\n"));
        assert_eq!(first.len(), 64);
    }
}
