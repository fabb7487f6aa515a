//! Job status side channel: lifecycle, progress counters, structured logs and
//! the follow-on queue for asynchronous integration rules.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::{data::Value, error::Diagnostic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Cancellation was requested; the running import still completes.
    Revoked,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Revoked)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Revoked)
                | (Revoked, Succeeded)
                | (Revoked, Failed)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounters {
    pub total_rows: usize,
    pub processed_rows: usize,
    pub ok_rows: usize,
    pub failed_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_entity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl JobLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn warning(diagnostic: Diagnostic) -> Self {
        Self {
            level: LogLevel::Warning,
            message: diagnostic.to_string(),
            diagnostic: Some(diagnostic),
        }
    }

    pub fn error(diagnostic: Diagnostic) -> Self {
        Self {
            level: LogLevel::Error,
            message: diagnostic.to_string(),
            diagnostic: Some(diagnostic),
        }
    }
}

/// An asynchronous integration rule waiting for a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowOnRequest {
    pub rule_id: String,
    pub company: String,
    pub event: String,
    pub payload: Value,
}

pub trait JobSink {
    fn set_status(&mut self, job_id: &str, status: JobStatus) -> Result<()>;
    fn progress(&mut self, job_id: &str, counters: &ProgressCounters);
    fn log(&mut self, job_id: &str, entry: JobLogEntry);
    fn enqueue(&mut self, job_id: &str, request: FollowOnRequest);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRecord {
    pub status: Option<JobStatus>,
    pub history: Vec<JobStatus>,
    pub progress: ProgressCounters,
    pub logs: Vec<JobLogEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryJobSink {
    jobs: BTreeMap<String, JobRecord>,
    queue: Vec<(String, FollowOnRequest)>,
}

impl MemoryJobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).and_then(|job| job.status)
    }

    pub fn queued(&self) -> impl Iterator<Item = &FollowOnRequest> {
        self.queue.iter().map(|(_, request)| request)
    }

    /// Hands the queued follow-ons to a worker.
    pub fn drain_queue(&mut self) -> Vec<FollowOnRequest> {
        self.queue.drain(..).map(|(_, request)| request).collect()
    }
}

impl JobSink for MemoryJobSink {
    fn set_status(&mut self, job_id: &str, status: JobStatus) -> Result<()> {
        let job = self.jobs.entry(job_id.to_string()).or_default();
        match job.status {
            None if status == JobStatus::Queued || status == JobStatus::Running => {}
            None => bail!("Job '{job_id}' cannot start as {status:?}"),
            Some(current) if current.can_transition_to(status) => {}
            Some(current) => bail!("Job '{job_id}' cannot move from {current:?} to {status:?}"),
        }
        job.status = Some(status);
        job.history.push(status);
        Ok(())
    }

    fn progress(&mut self, job_id: &str, counters: &ProgressCounters) {
        self.jobs.entry(job_id.to_string()).or_default().progress = counters.clone();
    }

    fn log(&mut self, job_id: &str, entry: JobLogEntry) {
        self.jobs.entry(job_id.to_string()).or_default().logs.push(entry);
    }

    fn enqueue(&mut self, job_id: &str, request: FollowOnRequest) {
        self.queue.push((job_id.to_string(), request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_follows_allowed_transitions() {
        let mut sink = MemoryJobSink::new();
        sink.set_status("job-1", JobStatus::Queued).unwrap();
        sink.set_status("job-1", JobStatus::Running).unwrap();
        sink.set_status("job-1", JobStatus::Revoked).unwrap();
        sink.set_status("job-1", JobStatus::Succeeded).unwrap();
        assert!(sink.set_status("job-1", JobStatus::Running).is_err());
        assert_eq!(
            sink.job("job-1").unwrap().history,
            vec![
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Revoked,
                JobStatus::Succeeded
            ]
        );
    }

    #[test]
    fn progress_and_queue_are_recorded() {
        let mut sink = MemoryJobSink::new();
        let counters = ProgressCounters {
            total_rows: 10,
            processed_rows: 4,
            ok_rows: 4,
            ..ProgressCounters::default()
        };
        sink.progress("job-2", &counters);
        sink.enqueue(
            "job-2",
            FollowOnRequest {
                rule_id: "r".into(),
                company: "acme".into(),
                event: "transaction.created".into(),
                payload: Value::Null,
            },
        );
        assert_eq!(sink.job("job-2").unwrap().progress.processed_rows, 4);
        assert_eq!(sink.queued().count(), 1);
        assert_eq!(sink.drain_queue().len(), 1);
        assert_eq!(sink.queued().count(), 0);
    }
}
