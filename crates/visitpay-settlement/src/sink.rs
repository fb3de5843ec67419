//! Destinations for signed settlement events.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;
use visitpay_types::{Result, SettlementEvent, VisitpayError};

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &SettlementEvent) -> Result<()>;
}

/// Writes each event as one JSON line to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: &SettlementEvent) -> Result<()> {
        let body = serde_json::to_string(event).map_err(|err| VisitpayError::EventEmission {
            reason: err.to_string(),
        })?;
        info!(target: "visitpay::events", mission = %event.mission_id, %body, "settlement event");
        Ok(())
    }
}

/// Keeps every emitted event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SettlementEvent>>,
    rejections: Mutex<VecDeque<String>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next emissions, one per reason, before accepting again.
    pub fn reject(&self, reasons: impl IntoIterator<Item = String>) {
        self.rejections.lock().extend(reasons);
    }

    #[must_use]
    pub fn events(&self) -> Vec<SettlementEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: &SettlementEvent) -> Result<()> {
        if let Some(reason) = self.rejections.lock().pop_front() {
            return Err(VisitpayError::EventEmission { reason });
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
