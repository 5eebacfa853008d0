//=====================================================
// File: vm/metrics.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Engine lifecycle telemetry
// Objective: Hook signature and collector for start/suspend/resume/complete/fault events
//=====================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Telemetry callback signature.
pub type TelemetryHook = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Event emitted on engine state transitions.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub kind: TelemetryEventKind,
    pub function: String,
    pub stack_depth: usize,
    pub yielded: usize,
    pub detail: Option<String>,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TelemetryEventKind {
    Started,
    Suspended,
    Resumed,
    Completed,
    Faulted,
}

/// JSON-serialisable view of a telemetry event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub kind: TelemetryEventKind,
    pub function: String,
    pub stack_depth: usize,
    pub yielded: usize,
    pub detail: Option<String>,
    pub timestamp_utc: String,
}

impl TelemetryRecord {
    fn from_event(event: &TelemetryEvent) -> Self {
        Self {
            kind: event.kind,
            function: event.function.clone(),
            stack_depth: event.stack_depth,
            yielded: event.yielded,
            detail: event.detail.clone(),
            timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Collects engine telemetry for later inspection.
#[derive(Clone, Default)]
pub struct TelemetryCollector {
    events: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> TelemetryHook {
        let collector = self.clone();
        Arc::new(move |event: &TelemetryEvent| {
            collector.record(event);
        })
    }

    fn record(&self, event: &TelemetryEvent) {
        self.events.lock().push(TelemetryRecord::from_event(event));
    }

    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<TelemetryEventKind> {
        self.events.lock().iter().map(|record| record.kind).collect()
    }
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("events", &self.events.lock().len())
            .finish()
    }
}


//=====================================================
// End of file
//=====================================================
