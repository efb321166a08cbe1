use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLogEventKind {
    OrderAccepted,
    OrderBlocked,
    PositionClosed,
    JournalWritten,
}

/// One entry of a run's decision log. Timestamps are simulated time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEvent {
    pub timestamp: i64,
    pub kind: RunLogEventKind,
    pub symbol: Option<String>,
    pub detail: String,
}

impl RunLogEvent {
    pub fn new(timestamp: i64, kind: RunLogEventKind, symbol: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind,
            symbol: symbol.map(str::to_string),
            detail: detail.into(),
        }
    }
}

pub trait RunLogWriter {
    fn write(&mut self, event: RunLogEvent);
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryRunLogWriter {
    events: Vec<RunLogEvent>,
}

impl InMemoryRunLogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[RunLogEvent] {
        &self.events
    }

    pub fn count(&self, kind: RunLogEventKind) -> usize {
        self.events.iter().filter(|event| event.kind == kind).count()
    }
}

impl RunLogWriter for InMemoryRunLogWriter {
    fn write(&mut self, event: RunLogEvent) {
        self.events.push(event);
    }
}
