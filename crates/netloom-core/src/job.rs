//! Scan jobs and their outcomes.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changes::ChangeSet;
use crate::error::{NetloomError, Result};
use crate::types::{Protocol, TargetSet, TenantId};

/// Where a job came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Scheduled,
    AdHoc,
}

/// A unit of work handed to the job runner by the trigger source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// The stored scan configuration this job was built from, if any.
    pub config_id: Option<String>,
    pub targets: TargetSet,
    pub protocols: BTreeSet<Protocol>,
    pub rate_limit_pps: u32,
    pub burst: u32,
    /// Fan-out inside a single scanner.
    pub concurrency: usize,
    pub protocol_timeout: Duration,
    /// Overall budget for the whole job.
    pub deadline: Duration,
    pub origin: JobOrigin,
    /// Explicit gateway for link inference; defaults to each subnet's first host.
    pub gateway: Option<IpAddr>,
}

impl ScanJob {
    /// A job with default limits: 100 pps, burst 20, concurrency 64,
    /// 30 s per protocol, 60 s overall.
    pub fn new(tenant_id: TenantId, targets: TargetSet, protocols: BTreeSet<Protocol>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            config_id: None,
            targets,
            protocols,
            rate_limit_pps: 100,
            burst: 20,
            concurrency: 64,
            protocol_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(60),
            origin: JobOrigin::AdHoc,
            gateway: None,
        }
    }

    /// Reject configurations the runner cannot execute.
    pub fn validate(&self, max_hosts: u128) -> Result<()> {
        let invalid = |msg: String| Err(NetloomError::InvalidJob(msg));

        if self.targets.is_empty() {
            return invalid("no address targets".into());
        }
        if self.protocols.is_empty() {
            return invalid("no protocols selected".into());
        }
        if self.rate_limit_pps == 0 {
            return invalid("rate_limit_pps must be greater than zero".into());
        }
        if self.burst == 0 {
            return invalid("burst must be at least 1".into());
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.protocol_timeout.is_zero() || self.deadline.is_zero() {
            return invalid("timeouts must be non-zero".into());
        }
        let hosts = self.targets.host_count();
        if hosts > max_hosts {
            return invalid(format!(
                "targets expand to {hosts} hosts, limit is {max_hosts}"
            ));
        }
        Ok(())
    }
}

/// Final status acknowledged back to the job source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        })
    }
}

/// What the runner returns for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub warnings: Vec<String>,
    /// Absent when the job failed before a change set could be trusted.
    pub change_set: Option<ChangeSet>,
}

impl JobReport {
    pub fn failed(job_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            warnings: vec![reason.into()],
            change_set: None,
        }
    }
}
