//! Observable events (§6.6). The core never decides where events go; it
//! publishes to an injected [`EventSink`]. Every event is also logged at
//! `debug!` or above at the point of emission (ambient A.1).

use std::sync::Arc;

use crate::policy::PolicySources;

#[derive(Debug, Clone)]
pub enum Event {
    TransactionBegin {
        opcode: u16,
        txid: u32,
    },
    TransactionEnd {
        txid: u32,
        outcome: TransactionOutcome,
        duration_ms: u64,
        bytes_in: u64,
        bytes_out: u64,
    },
    ProbeAttempt {
        iface: u8,
        score: i32,
        succeeded: bool,
        duration_ms: u64,
    },
    PumpEvent {
        bytes: usize,
    },
    PumpStopped,
    PolicyResolved {
        sources: PolicySourcesSummary,
    },
    FallbackRungFailed {
        name: &'static str,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Ok,
    Error,
    Cancelled,
}

/// A cheap-to-clone summary of [`PolicySources`] suitable for an event.
#[derive(Debug, Clone)]
pub struct PolicySourcesSummary {
    pub chunk_size_source: crate::policy::Source,
}

impl From<&PolicySources> for PolicySourcesSummary {
    fn from(s: &PolicySources) -> Self {
        PolicySourcesSummary {
            chunk_size_source: s.chunk_size_source,
        }
    }
}

/// The injected collaborator events are published to. Implementors decide
/// what to do with them (metrics, logs, UI); the core has no opinion.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// An [`EventSink`] that only logs, useful as a default when no collaborator
/// cares about structured events.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, event: Event) {
        log::debug!("event: {event:?}");
    }
}

pub type SharedSink = Arc<dyn EventSink>;
