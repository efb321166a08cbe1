use serde::{Deserialize, Serialize};

use crate::job::{JobFailure, JobKind, JobProgress, JobStatus, RunId};

/// Lifecycle notifications fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum JobEvent {
    Connected {
        active_runs: usize,
    },
    StatusChanged {
        run_id: RunId,
        kind: JobKind,
        status: JobStatus,
        at_ms: i64,
        error: Option<JobFailure>,
    },
    Progress {
        run_id: RunId,
        progress: JobProgress,
    },
    Removed {
        run_id: RunId,
    },
}

impl JobEvent {
    pub fn connected(active_runs: usize) -> Self {
        Self::Connected { active_runs }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Connected { .. } => None,
            Self::StatusChanged { run_id, .. } | Self::Progress { run_id, .. } | Self::Removed { run_id } => {
                Some(run_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobEvent;
    use crate::job::{JobKind, JobStatus};

    #[test]
    fn events_are_tagged_by_event_type() {
        let event = JobEvent::StatusChanged {
            run_id: "r1".to_string(),
            kind: JobKind::MonteCarlo,
            status: JobStatus::Running,
            at_ms: 5,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event_type"], "status_changed");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["kind"], "MONTE_CARLO");
        assert_eq!(event.run_id(), Some("r1"));
        assert_eq!(JobEvent::connected(2).run_id(), None);
    }
}
