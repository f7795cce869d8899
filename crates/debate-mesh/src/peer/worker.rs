use debate_protocol::{ParticipantId, SessionId, SignalMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{EngineUpdate, HandshakeEngine, HandshakeState};
use crate::error::RelayError;
use crate::media::LocalMedia;
use crate::relay::{Ack, InboundSignal, RelayChannel};
use crate::transport::{TrackOf, TransportFactory};

/// Notification from a peer worker to the orchestrator
#[derive(Debug, Clone)]
pub struct PeerReport<Tr> {
    pub remote: ParticipantId,
    /// Identifies the entry instance; reports from a replaced instance are stale
    pub generation: u64,
    pub kind: ReportKind<Tr>,
}

#[derive(Debug, Clone)]
pub enum ReportKind<Tr> {
    State(HandshakeState),
    RemoteTrack(Tr),
    Failed(String),
}

/// Everything a worker needs besides its transport factory
pub struct WorkerContext<Tr> {
    pub session_id: SessionId,
    pub local_id: ParticipantId,
    pub remote_id: ParticipantId,
    pub generation: u64,
    pub media: Option<Arc<LocalMedia>>,
    pub relay: Arc<dyn RelayChannel>,
    pub reports: mpsc::UnboundedSender<PeerReport<Tr>>,
}

impl<Tr> WorkerContext<Tr> {
    fn report(&self, kind: ReportKind<Tr>) {
        let _ = self.reports.send(PeerReport {
            remote: self.remote_id.clone(),
            generation: self.generation,
            kind,
        });
    }
}

/// Handle to the task running one handshake engine.
///
/// Inbound signals are processed strictly in delivery order. Closing wins
/// over anything still queued or in flight.
pub struct PeerWorker {
    commands: mpsc::UnboundedSender<InboundSignal>,
    close: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PeerWorker {
    pub fn spawn<F: TransportFactory>(factory: Arc<F>, context: WorkerContext<TrackOf<F>>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run(factory, context, commands_rx, close_rx));

        Self {
            commands: commands_tx,
            close: Some(close_tx),
            task: Some(task),
        }
    }

    /// Queue an inbound signal; hands it back if the worker is gone
    pub fn deliver(&self, signal: InboundSignal) -> Result<(), InboundSignal> {
        self.commands.send(signal).map_err(|e| e.0)
    }

    /// Stop the worker and wait until its transport is released.
    /// Returns false if it was already closed.
    pub async fn close(&mut self) -> bool {
        let Some(close) = self.close.take() else {
            return false;
        };
        let _ = close.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Peer worker panicked: {}", e);
            }
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_none()
    }
}

fn ack_later(ack: Ack) {
    tokio::spawn(async move {
        let signal_id = ack.signal_id();
        if let Err(e) = ack.ack().await {
            tracing::warn!("Failed to ack signal {}: {}", signal_id, e);
        }
    });
}

async fn publish_loop(
    relay: Arc<dyn RelayChannel>,
    session_id: SessionId,
    mut outbox: mpsc::UnboundedReceiver<SignalMessage>,
    failures: mpsc::UnboundedSender<RelayError>,
) {
    while let Some(message) = outbox.recv().await {
        match relay.publish(&session_id, &message).await {
            Ok(signal_id) => {
                tracing::debug!("Published {} to {} as {}", message.kind(), message.to, signal_id)
            }
            Err(e) => {
                let _ = failures.send(e);
                return;
            }
        }
    }
}

async fn run<F: TransportFactory>(
    factory: Arc<F>,
    context: WorkerContext<TrackOf<F>>,
    mut commands: mpsc::UnboundedReceiver<InboundSignal>,
    mut close: oneshot::Receiver<()>,
) {
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let connected = tokio::select! {
        biased;
        _ = &mut close => None,
        result = factory.connect(&context.remote_id, context.media.clone(), events_tx) => Some(result),
    };
    let transport = match connected {
        None => {
            discard_queued(&mut commands);
            return;
        }
        Some(Ok(transport)) => transport,
        Some(Err(e)) => {
            tracing::error!("Failed to create transport for {}: {}", context.remote_id, e);
            context.report(ReportKind::Failed(e.to_string()));
            let _ = close.await;
            discard_queued(&mut commands);
            return;
        }
    };

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (failures_tx, mut failures) = mpsc::unbounded_channel();
    let publisher = tokio::spawn(publish_loop(
        context.relay.clone(),
        context.session_id.clone(),
        outbox_rx,
        failures_tx,
    ));

    let mut engine = HandshakeEngine::new(
        context.local_id.clone(),
        context.remote_id.clone(),
        transport,
        outbox_tx,
    );

    'run: {
        let started = tokio::select! {
            biased;
            _ = &mut close => break 'run,
            result = engine.start() => result,
        };
        match started {
            Ok(()) => context.report(ReportKind::State(engine.state())),
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {}", context.remote_id, e);
                context.report(ReportKind::Failed(e.to_string()));
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut close => break 'run,
                Some(e) = failures.recv() => {
                    tracing::error!("Giving up publishing to {}: {}", context.remote_id, e);
                    if !engine.state().is_terminal() {
                        engine.mark_failed();
                        context.report(ReportKind::Failed(format!("relay publish failed: {}", e)));
                    }
                }
                Some(event) = events.recv() => match engine.handle_transport_event(event) {
                    Some(EngineUpdate::State(HandshakeState::Failed)) => {
                        context.report(ReportKind::Failed("transport failed".into()));
                    }
                    Some(EngineUpdate::State(state)) => context.report(ReportKind::State(state)),
                    Some(EngineUpdate::RemoteTrack(track)) => {
                        context.report(ReportKind::RemoteTrack(track));
                    }
                    None => {}
                },
                command = commands.recv() => {
                    let Some(signal) = command else {
                        break 'run;
                    };
                    let before = engine.state();
                    let outcome = tokio::select! {
                        biased;
                        _ = &mut close => None,
                        result = engine.handle_signal(&signal.message) => Some(result),
                    };
                    ack_later(signal.ack);

                    match outcome {
                        None => break 'run,
                        Some(Err(e)) => {
                            tracing::warn!("Handshake with {} failed: {}", context.remote_id, e);
                            context.report(ReportKind::Failed(e.to_string()));
                        }
                        Some(Ok(())) if engine.state() != before => {
                            context.report(ReportKind::State(engine.state()));
                        }
                        Some(Ok(())) => {}
                    }
                }
            }
        }
    }

    // Pending publishes must not reach the relay once closed
    publisher.abort();
    engine.close().await;
    discard_queued(&mut commands);
}

fn discard_queued(commands: &mut mpsc::UnboundedReceiver<InboundSignal>) {
    commands.close();
    let mut discarded = 0;
    while let Ok(signal) = commands.try_recv() {
        ack_later(signal.ack);
        discarded += 1;
    }
    if discarded > 0 {
        tracing::debug!("Discarded {} queued signals after close", discarded);
    }
}
