//! This module provides the [`Orchestrator`]'s `EventSubscriber` and `EventPublisher` types.
//!
//! [`Orchestrator`]: crate::Orchestrator

use futures::{stream, Stream};
use tokio::sync::watch;

use flboard_core::{MetricsHistory, RoundState};

use crate::orchestrator::Phase;

/// A convenience type to emit any orchestrator event.
#[derive(Debug)]
pub struct EventPublisher {
    phase_tx: EventBroadcaster<Phase>,
    round_state_tx: EventBroadcaster<RoundState>,
    metrics_tx: EventBroadcaster<MetricsHistory>,
    error_tx: EventBroadcaster<Option<String>>,
}

/// The `EventSubscriber` hands out `EventListener`s for any
/// orchestrator event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<Phase>,
    round_state_rx: EventListener<RoundState>,
    metrics_rx: EventListener<MetricsHistory>,
    error_rx: EventListener<Option<String>>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(phase: Phase, round_state: RoundState) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(phase);
        let (round_state_tx, round_state_rx) = watch::channel(round_state);
        let (metrics_tx, metrics_rx) = watch::channel(MetricsHistory::default());
        let (error_tx, error_rx) = watch::channel(None);

        let publisher = EventPublisher {
            phase_tx: phase_tx.into(),
            round_state_tx: round_state_tx.into(),
            metrics_tx: metrics_tx.into(),
            error_tx: error_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            round_state_rx: round_state_rx.into(),
            metrics_rx: metrics_rx.into(),
            error_rx: error_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Emit a phase event
    pub fn broadcast_phase(&self, phase: Phase) {
        self.phase_tx.broadcast(phase);
    }

    /// Emit a round state event
    pub fn broadcast_round_state(&self, state: RoundState) {
        self.round_state_tx.broadcast(state);
    }

    /// Emit a metrics event
    pub fn broadcast_metrics(&self, metrics: MetricsHistory) {
        self.metrics_tx.broadcast(metrics);
    }

    /// Emit the current error message, `None` clearing it
    pub fn broadcast_error(&self, error: Option<String>) {
        self.error_tx.broadcast(error);
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<Phase> {
        self.phase_rx.clone()
    }

    /// Get a listener for round state updates
    pub fn round_state_listener(&self) -> EventListener<RoundState> {
        self.round_state_rx.clone()
    }

    /// Get a listener for metrics updates
    pub fn metrics_listener(&self) -> EventListener<MetricsHistory> {
        self.metrics_rx.clone()
    }

    /// Get a listener for the user-visible error message
    pub fn error_listener(&self) -> EventListener<Option<String>> {
        self.error_rx.clone()
    }
}

/// A listener for orchestrator events. It can be used to either
/// retrieve the latest event (with `EventListener::get_latest`) or to
/// wait for events (with `EventListener::changed` or as a `Stream`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<E>);

impl<E> From<watch::Receiver<E>> for EventListener<E> {
    fn from(receiver: watch::Receiver<E>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> E {
        self.0.borrow().clone()
    }

    /// Wait for the next event. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<E> {
        self.0.changed().await.ok()?;
        Some(self.get_latest())
    }

    /// Turn the listener into a stream that starts with the latest event.
    pub fn into_stream(self) -> impl Stream<Item = E> {
        stream::unfold((self, true), |(mut listener, first)| async move {
            let event = if first {
                listener.get_latest()
            } else {
                listener.changed().await?
            };
            Some((event, (listener, false)))
        })
    }
}

/// A channel to send events to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<E>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: E) {
        // We don't care whether there's a listener or not
        let _ = self.0.send(event);
    }
}

impl<E> From<watch::Sender<E>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<E>) -> Self {
        Self(sender)
    }
}
