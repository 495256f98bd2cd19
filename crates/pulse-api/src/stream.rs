//! WebSocket streaming gateway.
//!
//! Each connection runs one session task that owns a broadcaster
//! subscription and drives it through the subscription lifecycle. Frames
//! are JSON text messages tagged by `type`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use pulse_core::{MetricPoint, SystemMetricPoint};
use pulse_metrics::ServiceMetrics;
use pulse_stream::{
    Broadcaster, CloseReason, StreamEvent, SubscriptionFilter, SubscriptionLifecycle,
    SubscriptionState, TransitionError,
};

use crate::ApiState;
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Comma-separated metric names; absent means every metric.
    pub metrics: Option<String>,
    #[serde(default)]
    pub system: bool,
}

impl StreamParams {
    pub fn filter(&self) -> SubscriptionFilter {
        let names: Vec<&str> = self
            .metrics
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let filter = if names.is_empty() {
            SubscriptionFilter::all()
        } else {
            SubscriptionFilter::metrics(names)
        };
        if self.system { filter.with_system() } else { filter }
    }
}

/// Server → client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Subscribed {
        run_id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        metrics: Option<Vec<&'a str>>,
        system: bool,
    },
    Metrics {
        run_id: &'a str,
        points: &'a [MetricPoint],
    },
    SystemMetrics {
        run_id: &'a str,
        points: &'a [SystemMetricPoint],
    },
    Overrun {
        missed: u64,
    },
    Pong,
}

/// Client → server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ping,
    Unsubscribe,
}

#[derive(Debug, Error)]
enum SendError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("socket closed")]
    Closed,
}

/// Everything a session needs, detached from the request.
pub struct Session {
    pub run_id: String,
    pub filter: SubscriptionFilter,
    pub broadcaster: Broadcaster,
    pub metrics: Arc<ServiceMetrics>,
    pub idle_after: Duration,
    pub close_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl Session {
    pub fn new(state: &ApiState, run_id: String, filter: SubscriptionFilter) -> Self {
        Self {
            run_id,
            filter,
            broadcaster: state.broadcaster.clone(),
            metrics: Arc::clone(&state.metrics),
            idle_after: state.config.stream.idle_after(),
            close_timeout: state.config.stream.close_timeout(),
            shutdown: state.shutdown.clone(),
        }
    }
}

/// GET /api/v1/stream/{run_id}
pub async fn stream_run(
    ws: WebSocketUpgrade,
    Path(run_id): Path<String>,
    query: Result<Query<StreamParams>, QueryRejection>,
    State(state): State<ApiState>,
) -> Result<Response, ApiError> {
    let Query(params) = query.map_err(|r| ApiError::BadRequest(r.body_text()))?;
    if run_id.trim().is_empty() {
        return Err(ApiError::BadRequest("run_id must not be empty".into()));
    }
    let session = Session::new(&state, run_id, params.filter());
    let tracked = state.sessions.token();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, incoming) = socket.split();
        run_session(sink, incoming, session).await;
        drop(tracked);
    }))
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame<'_>) -> Result<(), SendError>
where
    S: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|_| SendError::Closed)
}

async fn send_event<S>(sink: &mut S, run_id: &str, event: &StreamEvent) -> Result<(), SendError>
where
    S: Sink<Message> + Unpin,
{
    let frame = match event {
        StreamEvent::Metrics(points) => ServerFrame::Metrics { run_id, points },
        StreamEvent::System(points) => ServerFrame::SystemMetrics { run_id, points },
        StreamEvent::Overrun { missed } => ServerFrame::Overrun { missed: *missed },
    };
    send_frame(sink, &frame).await
}

fn log_transition(run_id: &str, result: Result<(), TransitionError>) {
    if let Err(e) = result {
        warn!(run_id, error = %e, "subscription lifecycle");
    }
}

/// Drive one subscription until it closes. Returns why it closed.
pub async fn run_session<S, R>(mut sink: S, mut incoming: R, session: Session) -> CloseReason
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let Session {
        run_id,
        filter,
        broadcaster,
        metrics,
        idle_after,
        close_timeout,
        mut shutdown,
    } = session;
    let run_id = run_id.as_str();

    let mut lifecycle = SubscriptionLifecycle::new();
    let subscription = broadcaster.subscribe(run_id, filter);
    metrics.record_subscription_opened();

    let hello = ServerFrame::Subscribed {
        run_id,
        metrics: subscription
            .filter()
            .metrics
            .as_ref()
            .map(|names| names.iter().map(String::as_str).collect()),
        system: subscription.filter().include_system,
    };
    match send_frame(&mut sink, &hello).await {
        Ok(()) => {
            log_transition(run_id, lifecycle.activate());
            info!(run_id, subscriber = subscription.id(), "stream session active");
        }
        Err(e) => {
            debug!(run_id, error = %e, "handshake failed");
            log_transition(run_id, lifecycle.begin_close(CloseReason::SendFailed));
        }
    }

    // A dropped sender means no shutdown will ever be signalled.
    let mut shutdown_live = true;
    if *shutdown.borrow() {
        log_transition(run_id, lifecycle.begin_close(CloseReason::Shutdown));
    }

    let idle = sleep(idle_after);
    tokio::pin!(idle);

    while !lifecycle.is_closing() {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    log_transition(run_id, lifecycle.resume());
                    idle.as_mut().reset(Instant::now() + idle_after);
                    if let Err(e) = send_event(&mut sink, run_id, &event).await {
                        debug!(run_id, error = %e, "send failed");
                        log_transition(run_id, lifecycle.begin_close(CloseReason::SendFailed));
                    }
                }
                None => log_transition(run_id, lifecycle.begin_close(CloseReason::Unsubscribe)),
            },
            msg = incoming.next() => match msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    log_transition(run_id, lifecycle.begin_close(CloseReason::ClientDisconnect));
                }
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        log_transition(run_id, lifecycle.begin_close(CloseReason::SendFailed));
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Ping) => {
                        if send_frame(&mut sink, &ServerFrame::Pong).await.is_err() {
                            log_transition(run_id, lifecycle.begin_close(CloseReason::SendFailed));
                        }
                    }
                    Ok(ClientFrame::Unsubscribe) => {
                        log_transition(run_id, lifecycle.begin_close(CloseReason::Unsubscribe));
                    }
                    Err(e) => debug!(run_id, error = %e, "ignoring client frame"),
                },
                Some(Ok(_)) => {}
            },
            _ = &mut idle, if lifecycle.state() == SubscriptionState::Active => {
                log_transition(run_id, lifecycle.mark_idle());
                debug!(run_id, "stream session idle");
            }
            changed = shutdown.changed(), if shutdown_live => match changed {
                Ok(()) if *shutdown.borrow() => {
                    log_transition(run_id, lifecycle.begin_close(CloseReason::Shutdown));
                }
                Ok(()) => {}
                Err(_) => shutdown_live = false,
            },
        }
    }

    let reason = lifecycle.close_reason().unwrap_or(CloseReason::ClientDisconnect);
    subscription.close();

    // Flush what is already queued unless the peer is gone.
    if matches!(reason, CloseReason::Unsubscribe | CloseReason::Shutdown) {
        let drain = async {
            while let Some(event) = subscription.recv().await {
                if send_event(&mut sink, run_id, &event).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        };
        if tokio::time::timeout(close_timeout, drain).await.is_err() {
            debug!(run_id, pending = subscription.pending(), "close timeout elapsed before drain");
        }
    }

    log_transition(run_id, lifecycle.finish_close());
    metrics.record_subscription_closed();
    info!(
        run_id,
        subscriber = subscription.id(),
        reason = ?reason,
        dropped = subscription.dropped(),
        "stream session closed"
    );
    reason
}
