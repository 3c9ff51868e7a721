//! Change sets: the structured diff between two successive graph states.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobOrigin;
use crate::types::{Device, InterfaceRecord, Link, Protocol, TenantId};

/// One attribute that differs between the before and after state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// An entity present on both sides whose tracked attributes differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification<T> {
    pub before: T,
    pub after: T,
    pub fields: Vec<FieldChange>,
}

impl<T> Modification<T> {
    pub fn changed(&self, field: &str) -> Option<&FieldChange> {
        self.fields.iter().find(|f| f.field == field)
    }
}

/// Added, removed, and modified entities of one kind, each ordered by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChanges<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    pub modified: Vec<Modification<T>>,
}

impl<T> Default for EntityChanges<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
        }
    }
}

impl<T> EntityChanges<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Job context attached to every change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub origin: JobOrigin,
    pub config_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub protocols: BTreeSet<Protocol>,
    pub total_observations: usize,
    /// Set when coverage was degraded (skipped protocol, timeout, deadline).
    pub partial: bool,
}

/// The diff produced by one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub meta: JobMetadata,
    pub devices: EntityChanges<Device>,
    pub interfaces: EntityChanges<InterfaceRecord>,
    pub links: EntityChanges<Link>,
}

impl ChangeSet {
    pub fn empty(meta: JobMetadata) -> Self {
        Self {
            meta,
            devices: EntityChanges::default(),
            interfaces: EntityChanges::default(),
            links: EntityChanges::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.interfaces.is_empty() && self.links.is_empty()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            devices_added: self.devices.added.len(),
            devices_removed: self.devices.removed.len(),
            devices_modified: self.devices.modified.len(),
            interfaces_added: self.interfaces.added.len(),
            interfaces_removed: self.interfaces.removed.len(),
            interfaces_modified: self.interfaces.modified.len(),
            links_added: self.links.added.len(),
            links_removed: self.links.removed.len(),
            links_modified: self.links.modified.len(),
        }
    }
}

/// Counts per entity kind and change kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub devices_added: usize,
    pub devices_removed: usize,
    pub devices_modified: usize,
    pub interfaces_added: usize,
    pub interfaces_removed: usize,
    pub interfaces_modified: usize,
    pub links_added: usize,
    pub links_removed: usize,
    pub links_modified: usize,
}
