//! Job intake: where the runner gets its work and sends acknowledgements.

use async_trait::async_trait;
use netloom_core::{JobAck, JobStatus, ScanJob};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::error::{DiscoverError, Result};

const ACK_CAPACITY: usize = 256;

#[async_trait]
pub trait JobSource: Send + Sync {
    /// The next job, or `None` once the source is exhausted.
    async fn next_job(&self) -> Option<ScanJob>;

    async fn acknowledge(&self, ack: JobAck);
}

/// A bounded in-process queue.
pub struct ChannelJobQueue {
    jobs: Mutex<mpsc::Receiver<ScanJob>>,
    acks: broadcast::Sender<JobAck>,
}

/// Cloneable handle for putting jobs on a [`ChannelJobQueue`].
#[derive(Clone)]
pub struct JobSubmitter {
    jobs: mpsc::Sender<ScanJob>,
}

/// A queue holding up to `capacity` pending jobs.
pub fn channel(capacity: usize) -> (JobSubmitter, ChannelJobQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (acks, _) = broadcast::channel(ACK_CAPACITY);
    (
        JobSubmitter { jobs: tx },
        ChannelJobQueue {
            jobs: Mutex::new(rx),
            acks,
        },
    )
}

impl ChannelJobQueue {
    /// Receive every acknowledgement sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobAck> {
        self.acks.subscribe()
    }
}

#[async_trait]
impl JobSource for ChannelJobQueue {
    async fn next_job(&self) -> Option<ScanJob> {
        self.jobs.lock().await.recv().await
    }

    async fn acknowledge(&self, ack: JobAck) {
        match ack.status {
            JobStatus::Success => tracing::info!(
                job_id = %ack.job_id,
                config_id = ack.config_id.as_deref().unwrap_or(""),
                status = %ack.status,
                "Job acknowledged"
            ),
            _ => tracing::warn!(
                job_id = %ack.job_id,
                config_id = ack.config_id.as_deref().unwrap_or(""),
                status = %ack.status,
                warnings = ?ack.warnings,
                "Job acknowledged"
            ),
        }
        // No subscribers is fine.
        let _ = self.acks.send(ack);
    }
}

impl JobSubmitter {
    /// Wait for room in the queue.
    pub async fn submit(&self, job: ScanJob) -> Result<()> {
        self.jobs.send(job).await.map_err(|_| DiscoverError::QueueClosed)
    }

    /// Enqueue without waiting. Fails when the queue is full or closed.
    pub fn try_submit(&self, job: ScanJob) -> Result<()> {
        self.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => DiscoverError::QueueFull(job.id),
            mpsc::error::TrySendError::Closed(_) => DiscoverError::QueueClosed,
        })
    }
}
