//! Domain audit log.
//!
//! Append-only JSONL record of domain events (status changes, assignments,
//! sheltering). Write-only side channel: engines record events after their
//! transaction commits and never fail the primary write when the log is
//! unavailable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Maximum audit log size before rotation (10 MB).
pub const MAX_AUDIT_LOG_SIZE: u64 = 10_485_760;

/// The kind of record an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    ServiceRequest,
    Animal,
    Shelter,
    EvacAssignment,
    DispatchTeam,
}

/// A reference to the record an event acted on or with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub id: i64,
}

impl Target {
    pub fn service_request(id: i64) -> Self {
        Self { kind: TargetKind::ServiceRequest, id }
    }
    pub fn animal(id: i64) -> Self {
        Self { kind: TargetKind::Animal, id }
    }
    pub fn shelter(id: i64) -> Self {
        Self { kind: TargetKind::Shelter, id }
    }
    pub fn assignment(id: i64) -> Self {
        Self { kind: TargetKind::EvacAssignment, id }
    }
    pub fn team(id: i64) -> Self {
        Self { kind: TargetKind::DispatchTeam, id }
    }
}

/// One audit event: actor did verb to target, optionally with an action
/// object (e.g. the shelter an animal was placed into).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub verb: String,
    pub target: Target,
    pub action_object: Option<Target>,
}

impl AuditEvent {
    pub fn new(actor: &str, verb: impl Into<String>, target: Target) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            verb: verb.into(),
            target,
            action_object: None,
        }
    }

    pub fn with_action_object(mut self, object: Target) -> Self {
        self.action_object = Some(object);
        self
    }
}

/// JSONL-backed audit logger. The directory is instance state so tests can
/// point it at a throwaway location.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    dir: PathBuf,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("audit.jsonl")
    }

    fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::create_dir_all(self.archive_dir())?;
        Ok(())
    }

    /// Append one event.
    pub fn record(&self, event: &AuditEvent) -> std::io::Result<()> {
        self.ensure_dirs()?;
        self.rotate_if_needed()?;

        let json = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;

        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Best-effort append: failures are logged and dropped so the primary
    /// transaction is never blocked by the side channel.
    pub fn record_or_warn(&self, event: AuditEvent) {
        if let Err(e) = self.record(&event) {
            tracing::warn!(
                "Dropping audit event '{}' for {:?} {}: {}",
                event.verb,
                event.target.kind,
                event.target.id,
                e
            );
        }
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&path)?;
        if metadata.len() < MAX_AUDIT_LOG_SIZE {
            return Ok(());
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let archive_path = self.archive_dir().join(format!("audit_{}.jsonl", timestamp));
        fs::rename(&path, archive_path)?;
        Ok(())
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        Self::read_filtered(&self.log_path(), limit, |_| true)
    }

    /// Events whose target matches, newest first.
    pub fn for_target(&self, target: Target, limit: usize) -> Vec<AuditEvent> {
        Self::read_filtered(&self.log_path(), limit, |e| e.target == target)
    }

    fn read_filtered(
        path: &Path,
        limit: usize,
        keep: impl Fn(&AuditEvent) -> bool,
    ) -> Vec<AuditEvent> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
            .filter(|e| keep(e))
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_read_back() {
        let dir = tempdir().unwrap();
        let logger = AuditLogger::new(dir.path());

        logger
            .record(&AuditEvent::new(
                "dispatcher-1",
                "created service request",
                Target::service_request(4),
            ))
            .unwrap();
        logger
            .record(
                &AuditEvent::new("dispatcher-1", "sheltered animal", Target::animal(9))
                    .with_action_object(Target::shelter(2)),
            )
            .unwrap();

        let events = logger.recent(10);
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].verb, "sheltered animal");
        assert_eq!(events[0].action_object, Some(Target::shelter(2)));
    }

    #[test]
    fn test_for_target_filters() {
        let dir = tempdir().unwrap();
        let logger = AuditLogger::new(dir.path());

        logger
            .record(&AuditEvent::new("a", "opened service request", Target::service_request(1)))
            .unwrap();
        logger
            .record(&AuditEvent::new("a", "closed service request", Target::service_request(2)))
            .unwrap();

        let events = logger.for_target(Target::service_request(2), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].verb, "closed service request");
    }

    #[test]
    fn test_record_or_warn_swallows_errors() {
        // A file in place of the directory makes every append fail.
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("not-a-dir");
        std::fs::write(&bogus, "x").unwrap();
        let logger = AuditLogger::new(&bogus);

        logger.record_or_warn(AuditEvent::new("a", "updated", Target::animal(1)));
    }
}
