//! Bulk job orchestration
//!
//! A job moves `Requested -> Planned -> Transferring -> Completed`, or to
//! `Failed` from anywhere. Work is tracked per piece: the service may split a
//! large object into blobs at different offsets, and a name stays in the
//! remaining set until every one of its pieces is confirmed. A piece handed
//! out in an instruction is held as outstanding so later polls do not hand it
//! out again.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ds3::client::Ds3Client;
use crate::ds3::error::{Ds3Error, ProtocolErrorKind, Result};
use crate::ds3::request::BulkKind;
use crate::ds3::transport::Transport;
use crate::ds3::types::{BulkJobResponse, BulkObject, ChunkOrdering};

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkConfig {
    /// Maximum concurrent per-object transfers
    pub workers: usize,
    /// Chunk polls allowed per wait for new work
    pub max_poll_attempts: u32,
    /// Minimum delay between polls that yield no work
    pub poll_interval: Duration,
    /// Chunk ordering requested for bulk GET jobs
    pub chunk_ordering: ChunkOrdering,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_poll_attempts: 60,
            poll_interval: Duration::from_secs(1),
            chunk_ordering: ChunkOrdering::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Requested,
    Planned,
    Transferring,
    Completed,
    Failed,
}

/// One object transfer bound to the node that owns its chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInstruction {
    pub job_id: String,
    pub bucket: String,
    pub kind: BulkKind,
    pub chunk_number: u64,
    pub server_id: String,
    /// Base URL of the node when the service listed one
    pub endpoint: Option<String>,
    pub object: BulkObject,
}

/// A service-assigned blob of an object: the object name plus its offset
pub type Piece = (String, u64);

#[derive(Debug)]
struct Progress {
    state: JobState,
    /// Object name to the offsets of its pieces not yet confirmed
    remaining: HashMap<String, HashSet<u64>>,
    outstanding: HashSet<Piece>,
}

/// Client-side handle of a bulk job
///
/// Safe to share between transfer workers. Dropping the handle abandons the
/// job locally; the service is not told.
#[derive(Debug)]
pub struct BulkJob {
    job_id: String,
    bucket: String,
    kind: BulkKind,
    plan: BulkJobResponse,
    submitted: usize,
    pieces: usize,
    progress: Mutex<Progress>,
}

impl BulkJob {
    fn new(kind: BulkKind, bucket: &str, objects: &[BulkObject], plan: BulkJobResponse) -> Self {
        let mut remaining: HashMap<String, HashSet<u64>> = objects
            .iter()
            .map(|o| (o.name.clone(), HashSet::new()))
            .collect();
        for object in plan.chunks.iter().flat_map(|c| c.objects.iter()) {
            if let Some(offsets) = remaining.get_mut(&object.name) {
                offsets.insert(object.offset);
            }
        }
        // Objects the plan does not split travel as one piece
        for offsets in remaining.values_mut() {
            if offsets.is_empty() {
                offsets.insert(0);
            }
        }

        Self {
            job_id: plan.job_id.clone(),
            bucket: bucket.to_string(),
            kind,
            submitted: remaining.len(),
            pieces: remaining.values().map(HashSet::len).sum(),
            plan,
            progress: Mutex::new(Progress {
                state: JobState::Planned,
                remaining,
                outstanding: HashSet::new(),
            }),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn kind(&self) -> BulkKind {
        self.kind
    }

    /// Job initiation response
    pub fn plan(&self) -> &BulkJobResponse {
        &self.plan
    }

    /// Number of distinct object names submitted
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Number of pieces the plan split the objects into
    pub fn pieces(&self) -> usize {
        self.pieces
    }

    pub fn state(&self) -> JobState {
        self.progress().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == JobState::Completed
    }

    /// Names with at least one piece not yet confirmed, sorted
    pub fn remaining(&self) -> Vec<String> {
        let mut names: Vec<String> = self.progress().remaining.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn remaining_count(&self) -> usize {
        self.progress().remaining.len()
    }

    /// Offsets of the pieces of `name` not yet confirmed, sorted
    pub fn remaining_pieces(&self, name: &str) -> Vec<u64> {
        let mut offsets: Vec<u64> = self
            .progress()
            .remaining
            .get(name)
            .map(|o| o.iter().copied().collect())
            .unwrap_or_default();
        offsets.sort_unstable();
        offsets
    }

    /// Pieces handed out and awaiting confirmation or release, sorted
    pub fn outstanding(&self) -> Vec<Piece> {
        let mut pieces: Vec<Piece> = self.progress().outstanding.iter().cloned().collect();
        pieces.sort_unstable();
        pieces
    }

    /// Record a successful transfer of one piece. A name stays remaining
    /// until all of its pieces are confirmed. Returns false for pieces that
    /// were not remaining (unknown or already confirmed).
    pub fn confirm(&self, name: &str, offset: u64) -> bool {
        let mut progress = self.progress();
        progress.outstanding.remove(&(name.to_string(), offset));
        let Some(offsets) = progress.remaining.get_mut(name) else {
            return false;
        };
        if !offsets.remove(&offset) {
            return false;
        }
        if offsets.is_empty() {
            progress.remaining.remove(name);
        }
        if progress.remaining.is_empty() && progress.state != JobState::Failed {
            progress.state = JobState::Completed;
            info!(job_id = %self.job_id, objects = self.submitted, "Bulk job completed");
        }
        true
    }

    /// Return an outstanding piece to the pool after a failed transfer
    pub fn release(&self, name: &str, offset: u64) {
        self.progress().outstanding.remove(&(name.to_string(), offset));
    }

    fn fail(&self) {
        let mut progress = self.progress();
        if progress.state != JobState::Completed {
            progress.state = JobState::Failed;
        }
    }

    /// Whether any remaining piece is free to be handed out
    fn has_issuable(&self) -> bool {
        let progress = self.progress();
        progress.remaining.iter().any(|(name, offsets)| {
            offsets
                .iter()
                .any(|offset| !progress.outstanding.contains(&(name.clone(), *offset)))
        })
    }

    /// Turn the ready chunks of a poll into instructions for pieces that are
    /// still remaining and not already outstanding. Node URLs use https only
    /// when `secure` is set.
    fn issue(&self, response: &BulkJobResponse, secure: bool) -> Vec<TransferInstruction> {
        let mut progress = self.progress();
        let mut instructions = Vec::new();

        for chunk in response.chunks.iter().filter(|c| c.is_ready()) {
            let endpoint = response
                .node(&chunk.server_id)
                .or_else(|| self.plan.node(&chunk.server_id))
                .and_then(|node| node.base_url(secure));

            for object in &chunk.objects {
                let pending = progress
                    .remaining
                    .get(&object.name)
                    .is_some_and(|offsets| offsets.contains(&object.offset));
                if !pending {
                    continue;
                }
                if !progress.outstanding.insert((object.name.clone(), object.offset)) {
                    continue;
                }
                instructions.push(TransferInstruction {
                    job_id: self.job_id.clone(),
                    bucket: self.bucket.clone(),
                    kind: self.kind,
                    chunk_number: chunk.chunk_number,
                    server_id: chunk.server_id.clone(),
                    endpoint: endpoint.clone(),
                    object: object.clone(),
                });
            }
        }

        if !instructions.is_empty() && progress.state == JobState::Planned {
            progress.state = JobState::Transferring;
        }
        instructions
    }
}

/// Result of a single chunk poll
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub instructions: Vec<TransferInstruction>,
    /// Delay requested by the service
    pub retry_after: Option<Duration>,
}

/// Drives bulk jobs over a [`Ds3Client`]
pub struct BulkOrchestrator<T> {
    client: Ds3Client<T>,
    config: BulkConfig,
}

impl<T: Transport> BulkOrchestrator<T> {
    pub fn new(client: Ds3Client<T>, config: BulkConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Ds3Client<T> {
        &self.client
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Submit the object list and wait for the service's plan
    ///
    /// Failures before the service issues a job id are returned as is.
    pub async fn start(&self, kind: BulkKind, bucket: &str, objects: &[BulkObject]) -> Result<BulkJob> {
        debug!(bucket, objects = objects.len(), state = ?JobState::Requested, "Starting bulk job");
        let plan = self
            .client
            .start_bulk(kind, bucket, objects, self.config.chunk_ordering)
            .await?;

        if plan.chunks.is_empty() && !objects.is_empty() {
            return Err(Ds3Error::protocol(
                ProtocolErrorKind::EmptyPlan,
                Some(&plan.job_id),
                format!("service planned no chunks for {} objects", objects.len()),
            ));
        }

        info!(
            job_id = %plan.job_id,
            bucket,
            chunks = plan.chunks.len(),
            objects = objects.len(),
            "Bulk job planned"
        );
        Ok(BulkJob::new(kind, bucket, objects, plan))
    }

    /// Ask the service once for ready chunks
    ///
    /// Any failure moves the job to `Failed` and carries its id.
    pub async fn poll(&self, job: &BulkJob) -> Result<PollOutcome> {
        let response = match self.client.get_available_chunks(job.job_id()).await {
            Ok(response) => response,
            Err(e) => {
                job.fail();
                return Err(e.with_job(job.job_id()));
            }
        };

        if response.job.job_id != job.job_id() {
            job.fail();
            return Err(Ds3Error::protocol(
                ProtocolErrorKind::StaleJob,
                Some(job.job_id()),
                format!("poll answered for job '{}'", response.job.job_id),
            ));
        }

        let instructions = job.issue(&response.job, self.client.is_secure());
        debug!(
            job_id = %job.job_id(),
            chunks = response.job.chunks.len(),
            instructions = instructions.len(),
            remaining = job.remaining_count(),
            "Polled job chunks"
        );
        Ok(PollOutcome {
            instructions,
            retry_after: response.retry_after.map(Duration::from_secs),
        })
    }

    /// Poll until new work appears, sleeping between empty polls
    ///
    /// Returns an empty list when every remaining name is already
    /// outstanding (including when the job is complete). Running out of
    /// attempts fails the job with `JobTimedOut`.
    pub async fn next_instructions(&self, job: &BulkJob) -> Result<Vec<TransferInstruction>> {
        for attempt in 1..=self.config.max_poll_attempts {
            if !job.has_issuable() {
                return Ok(Vec::new());
            }

            let outcome = self.poll(job).await?;
            if !outcome.instructions.is_empty() {
                return Ok(outcome.instructions);
            }
            if attempt == self.config.max_poll_attempts {
                break;
            }

            let delay = outcome
                .retry_after
                .map_or(self.config.poll_interval, |d| d.max(self.config.poll_interval));
            debug!(
                job_id = %job.job_id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "No chunks ready, waiting"
            );
            tokio::time::sleep(delay).await;
        }

        if !job.has_issuable() {
            return Ok(Vec::new());
        }
        job.fail();
        warn!(
            job_id = %job.job_id(),
            attempts = self.config.max_poll_attempts,
            remaining = job.remaining_count(),
            "Bulk job timed out waiting for chunks"
        );
        Err(Ds3Error::protocol(
            ProtocolErrorKind::JobTimedOut,
            Some(job.job_id()),
            format!(
                "{} objects still unassigned after {} polls",
                job.remaining_count(),
                self.config.max_poll_attempts
            ),
        ))
    }

    /// Drive the job to completion with `transfer` doing each object
    ///
    /// At most `workers` transfers run at once. A successful transfer is
    /// confirmed; a failed one is released and, once the in-flight batch has
    /// settled, fails the job with the first error.
    pub async fn run<F, Fut>(&self, job: &BulkJob, transfer: F) -> Result<()>
    where
        F: Fn(TransferInstruction) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            let instructions = self.next_instructions(job).await?;
            if instructions.is_empty() {
                return Ok(());
            }

            let mut results = stream::iter(instructions)
                .map(|instruction| {
                    let name = instruction.object.name.clone();
                    let offset = instruction.object.offset;
                    let pending = transfer(instruction);
                    async move { (name, offset, pending.await) }
                })
                .buffer_unordered(self.config.workers.max(1));

            let mut first_error = None;
            while let Some((name, offset, result)) = results.next().await {
                match result {
                    Ok(()) => {
                        job.confirm(&name, offset);
                    }
                    Err(e) => {
                        warn!(job_id = %job.job_id(), object = %name, offset, error = %e, "Transfer failed");
                        job.release(&name, offset);
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = first_error {
                job.fail();
                return Err(e.with_job(job.job_id()));
            }
        }
    }
}
