//! Observed process model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a process may be terminated by the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Never terminated, never restarted.
    Protected,
    /// Eligible for single and bulk termination.
    Terminable,
    /// Excluded from bulk operations but individually terminable.
    Unknown,
}

impl Classification {
    /// Short lowercase label used in logs and CLI output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protected => "protected",
            Self::Terminable => "terminable",
            Self::Unknown => "unknown",
        }
    }
}

/// Point-in-time resource usage of one process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceSample {
    /// Resident memory in bytes.
    pub resident_bytes: u64,
    /// Recent CPU usage as a fraction of one core (`0.0..`).
    pub cpu_fraction: f32,
}

/// One observed process as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessHandle {
    /// Host-assigned identifier; reusable after exit.
    pub process_id: u32,
    /// Human-readable process name.
    pub display_name: String,
    /// Bundle, package or executable identifier, when the host has one.
    pub owner_identifier: Option<String>,
    /// Classification cached at insertion (or on rule swap).
    pub classification: Classification,
    /// Time of the most recent observation.
    pub last_seen: DateTime<Utc>,
    /// Most recent resource sample.
    pub resource_sample: ResourceSample,
}

impl ProcessHandle {
    /// Build a handle from a host record with the given classification.
    #[must_use]
    pub fn from_record(record: &HostProcessRecord, classification: Classification) -> Self {
        Self {
            process_id: record.pid,
            display_name: record.name.clone(),
            owner_identifier: record.owner_identifier.clone(),
            classification,
            last_seen: Utc::now(),
            resource_sample: record.sample(),
        }
    }

    /// Whether `other` is this same process rather than a later one that
    /// reused the pid.
    #[must_use]
    pub fn is_same_process(&self, other: &Self) -> bool {
        self.process_id == other.process_id
            && self.display_name == other.display_name
            && self.owner_identifier == other.owner_identifier
    }

    /// Whether `record` describes this same process.
    #[must_use]
    pub fn matches_record(&self, record: &HostProcessRecord) -> bool {
        self.process_id == record.pid
            && self.display_name == record.name
            && self.owner_identifier == record.owner_identifier
    }
}

/// Raw process record as reported by the host enumeration surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HostProcessRecord {
    /// Host process id.
    pub pid: u32,
    /// Process name.
    pub name: String,
    /// Stable identifier (bundle id, executable path), if any.
    pub owner_identifier: Option<String>,
    /// Resident memory in bytes.
    pub resident_bytes: u64,
    /// Recent CPU usage as a fraction of one core.
    pub cpu_fraction: f32,
}

impl HostProcessRecord {
    /// Convenience constructor with a zero resource sample.
    #[must_use]
    pub fn new(pid: u32, name: impl Into<String>, owner_identifier: Option<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            owner_identifier,
            resident_bytes: 0,
            cpu_fraction: 0.0,
        }
    }

    /// Resource usage carried by this record.
    #[must_use]
    pub fn sample(&self) -> ResourceSample {
        ResourceSample {
            resident_bytes: self.resident_bytes,
            cpu_fraction: self.cpu_fraction,
        }
    }

    /// Check the record is well formed.
    ///
    /// # Errors
    ///
    /// Returns a description of the first defect found: a zero pid, a
    /// blank name, or a negative / non-finite CPU fraction.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pid == 0 {
            return Err("record has pid 0".into());
        }
        if self.name.trim().is_empty() {
            return Err(format!("record for pid {} has an empty name", self.pid));
        }
        if !self.cpu_fraction.is_finite() || self.cpu_fraction < 0.0 {
            return Err(format!(
                "record for pid {} has invalid cpu fraction {}",
                self.pid, self.cpu_fraction
            ));
        }
        Ok(())
    }
}

/// Change notification published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A process was observed for the first time.
    Added(ProcessHandle),
    /// A known process exited or vanished from two consecutive scans.
    Removed(ProcessHandle),
    /// A known process changed (resource sample or classification).
    Updated(ProcessHandle),
}

impl ProcessEvent {
    /// The handle this event refers to.
    #[must_use]
    pub fn handle(&self) -> &ProcessHandle {
        match self {
            Self::Added(handle) | Self::Removed(handle) | Self::Updated(handle) => handle,
        }
    }

    /// Process id this event refers to.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.handle().process_id
    }
}
