//! Audit trail for state-changing terminal operations.
//!
//! The manager takes an [`AuditSink`] at construction. Production wiring uses
//! [`TracingAudit`], which writes one JSON object per event to the `audit`
//! tracing target so it can be filtered or routed separately from diagnostics.
//! Entries never carry credentials.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    #[serde(rename = "terminal.spawn")]
    TerminalSpawn,
    #[serde(rename = "terminal.kill")]
    TerminalKill,
    #[serde(rename = "terminal.rename")]
    TerminalRename,
    #[serde(rename = "terminal.crash")]
    TerminalCrash,
    #[serde(rename = "layout.change")]
    LayoutChange,
    #[serde(rename = "workspace.save")]
    WorkspaceSave,
    #[serde(rename = "workspace.load")]
    WorkspaceLoad,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TerminalSpawn => "terminal.spawn",
            Self::TerminalKill => "terminal.kill",
            Self::TerminalRename => "terminal.rename",
            Self::TerminalCrash => "terminal.crash",
            Self::LayoutChange => "layout.change",
            Self::WorkspaceSave => "workspace.save",
            Self::WorkspaceLoad => "workspace.load",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, outcome: Outcome) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            target: None,
            outcome,
            error: None,
            details: serde_json::Map::new(),
        }
    }

    pub fn success(action: AuditAction) -> Self {
        Self::new(action, Outcome::Success)
    }

    pub fn failure(action: AuditAction, error: &impl std::fmt::Display) -> Self {
        let mut event = Self::new(action, Outcome::Failure);
        event.error = Some(error.to_string());
        event
    }

    pub fn target(mut self, target: impl std::fmt::Display) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// JSON lines on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => info!(target: "audit", "{}", line),
            Err(e) => warn!(target: "audit", "Failed to serialize audit event {}: {}", event.action.as_str(), e),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _event: AuditEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn actions(&self) -> Vec<(AuditAction, Outcome)> {
        self.events()
            .into_iter()
            .map(|e| (e.action, e.outcome))
            .collect()
    }

    pub fn count(&self, action: AuditAction, outcome: Outcome) -> usize {
        self.actions()
            .into_iter()
            .filter(|(a, o)| *a == action && *o == outcome)
            .count()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_dotted_action() {
        let event = AuditEvent::success(AuditAction::TerminalSpawn)
            .target(3)
            .detail("port", 40123);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "terminal.spawn");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["target"], "3");
        assert_eq!(json["details"]["port"], 40123);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_carries_error_text() {
        let event = AuditEvent::failure(AuditAction::LayoutChange, &"boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["error"], "boom");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn as_str_matches_serialized_name() {
        for action in [
            AuditAction::TerminalSpawn,
            AuditAction::TerminalKill,
            AuditAction::TerminalRename,
            AuditAction::TerminalCrash,
            AuditAction::LayoutChange,
            AuditAction::WorkspaceSave,
            AuditAction::WorkspaceLoad,
        ] {
            let json = serde_json::to_value(action).unwrap();
            assert_eq!(json, action.as_str());
        }
    }

    #[test]
    fn memory_audit_counts() {
        let audit = MemoryAudit::new();
        audit.record(AuditEvent::success(AuditAction::TerminalKill));
        audit.record(AuditEvent::failure(AuditAction::TerminalKill, &"x"));
        audit.record(AuditEvent::success(AuditAction::TerminalKill));
        assert_eq!(audit.count(AuditAction::TerminalKill, Outcome::Success), 2);
        assert_eq!(audit.count(AuditAction::TerminalKill, Outcome::Failure), 1);
        assert_eq!(audit.events().len(), 3);
    }
}
