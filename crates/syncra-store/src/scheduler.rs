//! Reference implementation of the job scheduler interface.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use syncra_core::{Error, JobScheduler, Result};

/// A submitted job as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: Uuid,
    pub job_name: String,
    pub payload: Value,
}

/// Scheduler adapter that records every submission.
///
/// Stands in for the external job scheduler during local operation and in
/// tests; `set_failing` simulates a scheduler outage so the failure-recording
/// path of the document processor is exercisable.
#[derive(Clone, Default)]
pub struct RecordingScheduler {
    jobs: Arc<Mutex<Vec<SubmittedJob>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent submission fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All submissions recorded so far.
    pub fn submitted(&self) -> Vec<SubmittedJob> {
        self.jobs.lock().expect("scheduler lock poisoned").clone()
    }

    /// Submissions recorded for one job name.
    pub fn submitted_named(&self, job_name: &str) -> Vec<SubmittedJob> {
        self.submitted()
            .into_iter()
            .filter(|j| j.job_name == job_name)
            .collect()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn submit(&self, job_name: &str, payload: Value) -> Result<Uuid> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Scheduler("scheduler unavailable".to_string()));
        }
        let job_id = Uuid::new_v4();
        debug!(job_name, %job_id, "job submitted");
        self.jobs
            .lock()
            .expect("scheduler lock poisoned")
            .push(SubmittedJob {
                job_id,
                job_name: job_name.to_string(),
                payload,
            });
        Ok(job_id)
    }
}
