//! pulse-stream: live fan-out of ingested batches.
//!
//! The `Broadcaster` keeps one topic per run. Each subscriber owns a bounded
//! queue; publishing never waits on a subscriber, and a subscriber that
//! falls behind loses its oldest messages and is told how many it missed.

pub mod broadcaster;
pub mod event;
pub mod lifecycle;
pub mod queue;

pub use broadcaster::{Broadcaster, PublishReport, SubscriberId, Subscription, SubscriptionFilter};
pub use event::StreamEvent;
pub use lifecycle::{CloseReason, SubscriptionLifecycle, SubscriptionState, TransitionError};
pub use queue::{PushOutcome, SubscriberQueue};
