//! Thin job controller: dispatches submitted job specs onto acquired slots,
//! runs them through the job environment, and feeds terminal states back
//! into the slot manager's suppression policies.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SlotError};
use crate::job::{FinishedJob, JobRecord, JobSpec, JobState};
use crate::slots::{CpuRequest, DiskRequest, Slot, SlotManager};

#[derive(Clone)]
pub struct JobController {
    manager: SlotManager,
    jobs: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
    dispatch_tx: mpsc::UnboundedSender<JobSpec>,
}

impl JobController {
    pub fn new(manager: SlotManager) -> (Self, mpsc::UnboundedReceiver<JobSpec>) {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                jobs: Arc::new(RwLock::new(HashMap::new())),
                dispatch_tx,
            },
            dispatch_rx,
        )
    }

    /// Accepts a job for execution. Rejected while the node is not
    /// advertising capacity.
    pub fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        if !self.manager.is_enabled() {
            return Err(SlotError::NotAcceptingJobs);
        }
        let job_id = spec.id;
        self.jobs
            .write()
            .unwrap()
            .insert(job_id, JobRecord::new(spec.clone()));
        self.dispatch_tx
            .send(spec)
            .map_err(|_| SlotError::NotAcceptingJobs)?;
        tracing::info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    pub fn get_job(&self, id: &Uuid) -> Option<JobRecord> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// All jobs sorted chronologically by submission time.
    pub fn all_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.read().unwrap().values().cloned().collect();
        jobs.sort_by_key(|record| record.spec.created_at);
        jobs
    }

    /// Dispatch loop; runs until the channel closes or shutdown is signaled.
    pub async fn run(
        &self,
        mut dispatch_rx: mpsc::UnboundedReceiver<JobSpec>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                spec = dispatch_rx.recv() => {
                    let Some(spec) = spec else { break };
                    self.dispatch(spec);
                }
            }
        }
    }

    fn dispatch(&self, spec: JobSpec) {
        let disk_request = DiskRequest {
            disk_space: spec.disk_space,
            medium_index: spec.medium_index,
        };
        let cpu_request = CpuRequest {
            cpu: spec.cpu,
            allow_cpu_idle_policy: spec.allow_cpu_idle_policy,
        };

        match self.manager.acquire_slot(disk_request, cpu_request) {
            Ok(slot) => {
                self.update_record(&spec.id, |record| {
                    record.state = JobState::Running;
                    record.slot_index = Some(slot.slot_index());
                });
                let controller = self.clone();
                tokio::spawn(async move { controller.execute(spec, slot).await });
            }
            Err(error) => {
                tracing::warn!(job_id = %spec.id, error = %error, "No slot for job, aborting");
                self.update_record(&spec.id, |record| {
                    record.state = JobState::Aborted;
                    record.error = Some(error.to_string());
                    record.completed_at = Some(Utc::now());
                });
                self.manager.on_job_finished(&FinishedJob {
                    id: spec.id,
                    kind: spec.kind,
                    state: JobState::Aborted,
                    gpu_requested: spec.gpu_requested,
                });
            }
        }
    }

    async fn execute(&self, spec: JobSpec, slot: Slot) {
        tracing::info!(
            job_id = %spec.id,
            slot_index = slot.slot_index(),
            slot_type = %slot.slot_type(),
            command = %spec.command,
            "Executing job"
        );

        let (state, exit_code, output, error) = match slot.prepare_sandbox() {
            Ok(sandbox) => {
                let mut command = slot.environment().build_command(
                    &spec.command,
                    &sandbox,
                    slot.slot_index(),
                    spec.cpu,
                );
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
                match command.output().await {
                    Ok(output) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                        let exit_code = output.status.code();
                        if output.status.success() {
                            (JobState::Completed, exit_code, non_empty(stdout), None)
                        } else {
                            let error = if stderr.is_empty() {
                                format!("Exit code: {exit_code:?}")
                            } else {
                                stderr
                            };
                            (JobState::Failed, exit_code, non_empty(stdout), Some(error))
                        }
                    }
                    Err(e) => (JobState::Failed, None, None, Some(e.to_string())),
                }
            }
            Err(e) => (
                JobState::Failed,
                None,
                None,
                Some(format!("Failed to prepare sandbox: {e}")),
            ),
        };

        tracing::info!(job_id = %spec.id, state = %state, exit_code = ?exit_code, "Job finished");

        self.update_record(&spec.id, |record| {
            record.state = state;
            record.exit_code = exit_code;
            record.output = output.clone();
            record.error = error.clone();
            record.completed_at = Some(Utc::now());
        });

        self.manager.on_job_finished(&FinishedJob {
            id: spec.id,
            kind: spec.kind,
            state,
            gpu_requested: spec.gpu_requested,
        });

        // The slot handle drops here, returning the slot to the manager.
    }

    fn update_record(&self, id: &Uuid, update: impl FnOnce(&mut JobRecord)) {
        if let Some(record) = self.jobs.write().unwrap().get_mut(id) {
            update(record);
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
