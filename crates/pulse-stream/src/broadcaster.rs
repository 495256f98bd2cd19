//! Per-run publish/subscribe.
//!
//! Topics live in a `DashMap` keyed by run id, so subscriber churn on one
//! run only contends with runs hashed to the same shard. Subscribe and
//! unsubscribe mutate a topic while holding its shard entry, which keeps
//! topic removal and a concurrent subscribe from racing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use pulse_core::{MetricPoint, SystemMetricPoint};

use crate::event::StreamEvent;
use crate::queue::{PushOutcome, SubscriberQueue};

pub type SubscriberId = u64;

/// Which messages of a run a subscriber wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// Metric names to forward; `None` forwards every metric.
    pub metrics: Option<BTreeSet<String>>,
    /// Forward system telemetry as well.
    pub include_system: bool,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn metrics<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics: Some(names.into_iter().map(Into::into).collect()),
            include_system: false,
        }
    }

    pub fn with_system(mut self) -> Self {
        self.include_system = true;
        self
    }

    pub fn matches(&self, metric_name: &str) -> bool {
        self.metrics.as_ref().is_none_or(|names| names.contains(metric_name))
    }
}

/// Result of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Subscribers that received a message.
    pub delivered: usize,
    /// Older messages evicted from full queues to make room.
    pub dropped: usize,
}

struct Subscriber {
    id: SubscriberId,
    filter: SubscriptionFilter,
    queue: Arc<SubscriberQueue>,
}

#[derive(Default)]
struct Topic {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Topic {
    fn deliver(&self, mut event_for: impl FnMut(&SubscriptionFilter) -> Option<StreamEvent>) -> PublishReport {
        let mut report = PublishReport::default();
        for sub in self.subscribers.lock().iter() {
            let Some(event) = event_for(&sub.filter) else {
                continue;
            };
            match sub.queue.push(event) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                }
                PushOutcome::Closed => {}
            }
        }
        report
    }
}

struct Inner {
    topics: DashMap<String, Arc<Topic>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

/// Fan-out hub shared by the ingestion path and the streaming gateway.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    /// Register interest in a run. Only messages published after this call
    /// are delivered.
    pub fn subscribe(&self, run_id: &str, filter: SubscriptionFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.inner.queue_capacity));
        {
            let topic = self.inner.topics.entry(run_id.to_string()).or_default();
            topic.subscribers.lock().push(Subscriber {
                id,
                filter: filter.clone(),
                queue: Arc::clone(&queue),
            });
        }
        debug!(run_id, subscriber = id, "subscribed");
        Subscription {
            id,
            run_id: run_id.to_string(),
            filter,
            queue,
            broadcaster: self.clone(),
        }
    }

    /// Remove a subscriber and close its queue. The topic goes away with
    /// its last subscriber. Returns whether the subscriber was found.
    pub fn unsubscribe(&self, run_id: &str, id: SubscriberId) -> bool {
        let mut found = false;
        self.inner.topics.remove_if(run_id, |_, topic| {
            let mut subs = topic.subscribers.lock();
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos).queue.close();
                found = true;
            }
            subs.is_empty()
        });
        if found {
            debug!(run_id, subscriber = id, "unsubscribed");
        }
        found
    }

    /// Fan a batch of metric points out to the run's subscribers, each
    /// receiving only the metrics its filter selects.
    pub fn publish_metrics(&self, run_id: &str, points: &[MetricPoint]) -> PublishReport {
        let Some(topic) = self.topic(run_id) else {
            return PublishReport::default();
        };
        let all: Arc<[MetricPoint]> = Arc::from(points);
        topic.deliver(|filter| {
            if filter.metrics.is_none() {
                return Some(StreamEvent::Metrics(Arc::clone(&all)));
            }
            let selected: Vec<MetricPoint> = all
                .iter()
                .filter(|p| filter.matches(&p.metric_name))
                .cloned()
                .collect();
            (!selected.is_empty()).then(|| StreamEvent::Metrics(selected.into()))
        })
    }

    /// Fan system telemetry out to subscribers that asked for it.
    pub fn publish_system(&self, run_id: &str, points: &[SystemMetricPoint]) -> PublishReport {
        let Some(topic) = self.topic(run_id) else {
            return PublishReport::default();
        };
        let all: Arc<[SystemMetricPoint]> = Arc::from(points);
        topic.deliver(|filter| {
            filter
                .include_system
                .then(|| StreamEvent::System(Arc::clone(&all)))
        })
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.topic(run_id)
            .map(|t| t.subscribers.lock().len())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner
            .topics
            .iter()
            .map(|t| t.subscribers.lock().len())
            .sum()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    fn topic(&self, run_id: &str) -> Option<Arc<Topic>> {
        self.inner.topics.get(run_id).map(|t| Arc::clone(t.value()))
    }
}

/// A live registration. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    run_id: String,
    filter: SubscriptionFilter,
    queue: Arc<SubscriberQueue>,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Next event; `None` once unsubscribed and drained.
    pub async fn recv(&self) -> Option<StreamEvent> {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.queue.try_recv()
    }

    /// Messages waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Stop receiving new messages. Already queued ones stay readable.
    pub fn close(&self) {
        self.broadcaster.unsubscribe(&self.run_id, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.run_id, self.id);
    }
}
