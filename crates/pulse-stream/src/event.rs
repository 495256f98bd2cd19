use std::sync::Arc;

use pulse_core::{MetricPoint, SystemMetricPoint};

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Points from one ingested batch that match the subscriber's filter.
    Metrics(Arc<[MetricPoint]>),
    System(Arc<[SystemMetricPoint]>),
    /// `missed` messages were dropped since the last delivered one.
    Overrun { missed: u64 },
}

impl StreamEvent {
    /// Number of points carried, zero for notices.
    pub fn len(&self) -> usize {
        match self {
            StreamEvent::Metrics(points) => points.len(),
            StreamEvent::System(points) => points.len(),
            StreamEvent::Overrun { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
