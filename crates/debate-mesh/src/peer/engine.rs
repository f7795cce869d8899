use debate_protocol::{
    IceCandidateInit, ParticipantId, SessionDescription, SignalKind, SignalMessage, SignalPayload,
};
use std::collections::HashSet;
use tokio::sync::mpsc;

use super::{HandshakeState, Role};
use crate::error::{NegotiationError, TransportError};
use crate::transport::{LinkState, PeerTransport, TransportEvent};

/// Change worth reporting to the orchestrator
#[derive(Debug, Clone)]
pub enum EngineUpdate<Tr> {
    State(HandshakeState),
    RemoteTrack(Tr),
}

type CandidateKey = (String, Option<String>, Option<u16>);

fn candidate_key(candidate: &IceCandidateInit) -> CandidateKey {
    (
        candidate.candidate.clone(),
        candidate.sdp_mid.clone(),
        candidate.sdp_mline_index,
    )
}

/// Offer / answer / candidate state machine for one remote participant.
///
/// The engine exclusively owns its transport. Outgoing handshake messages
/// are queued on `outbox`; whoever drains it is responsible for publishing
/// them in order.
pub struct HandshakeEngine<T: PeerTransport> {
    local_id: ParticipantId,
    remote_id: ParticipantId,
    role: Role,
    state: HandshakeState,
    transport: Option<T>,
    outbox: mpsc::UnboundedSender<SignalMessage>,
    remote_description_set: bool,
    last_remote_offer: Option<String>,
    pending_candidates: Vec<IceCandidateInit>,
    seen_candidates: HashSet<CandidateKey>,
    remote_tracks: Vec<T::Track>,
}

impl<T: PeerTransport> HandshakeEngine<T> {
    pub fn new(
        local_id: ParticipantId,
        remote_id: ParticipantId,
        transport: T,
        outbox: mpsc::UnboundedSender<SignalMessage>,
    ) -> Self {
        let role = Role::for_pair(&local_id, &remote_id);
        Self {
            local_id,
            remote_id,
            role,
            state: HandshakeState::Idle,
            transport: Some(transport),
            outbox,
            remote_description_set: false,
            last_remote_offer: None,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            remote_tracks: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn remote_tracks(&self) -> &[T::Track] {
        &self.remote_tracks
    }

    /// Candidates waiting for the remote description
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Leave `Idle`: an initiator publishes its offer, a responder waits for one
    pub async fn start(&mut self) -> Result<(), NegotiationError> {
        if self.state != HandshakeState::Idle {
            return Ok(());
        }

        match self.role {
            Role::Initiator => {
                let Some(transport) = self.transport.as_ref() else {
                    return Err(self.fail("create offer", TransportError::Closed));
                };
                let offer = match transport.local_offer().await {
                    Ok(offer) => offer,
                    Err(e) => return Err(self.fail("create offer", e)),
                };
                self.send(SignalPayload::Offer(offer));
                self.state = HandshakeState::OfferSent;
                tracing::info!("Sent offer to {}", self.remote_id);
            }
            Role::Responder => {
                self.state = HandshakeState::AwaitingOffer;
                tracing::debug!("Waiting for offer from {}", self.remote_id);
            }
        }
        Ok(())
    }

    /// Apply one inbound handshake message from the remote peer
    pub async fn handle_signal(&mut self, message: &SignalMessage) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            tracing::debug!(
                "Discarding {} from {} in state {}",
                message.kind(),
                self.remote_id,
                self.state
            );
            return Ok(());
        }

        match &message.payload {
            SignalPayload::Offer(offer) => self.on_offer(offer.clone()).await,
            SignalPayload::Answer(answer) => self.on_answer(answer.clone()).await,
            SignalPayload::Candidate(candidate) => {
                self.on_candidate(candidate.clone()).await;
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role == Role::Initiator {
            return Err(self.unexpected(SignalKind::Offer));
        }
        if self.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            tracing::debug!("Ignoring redelivered offer from {}", self.remote_id);
            return Ok(());
        }

        let sdp = offer.sdp.clone();
        self.apply_remote_description(offer).await?;
        self.last_remote_offer = Some(sdp);

        let Some(transport) = self.transport.as_ref() else {
            return Err(self.fail("create answer", TransportError::Closed));
        };
        let answer = match transport.local_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail("create answer", e)),
        };
        self.send(SignalPayload::Answer(answer));

        if self.state != HandshakeState::Connected {
            self.state = HandshakeState::AnswerExchanged;
        }
        tracing::info!("Answered offer from {}", self.remote_id);
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        match (self.role, self.state) {
            (Role::Initiator, HandshakeState::OfferSent) => {
                self.apply_remote_description(answer).await?;
                self.state = HandshakeState::AnswerExchanged;
                tracing::info!("Applied answer from {}", self.remote_id);
                Ok(())
            }
            (Role::Initiator, HandshakeState::AnswerExchanged | HandshakeState::Connected) => {
                tracing::debug!("Ignoring duplicate answer from {}", self.remote_id);
                Ok(())
            }
            _ => Err(self.unexpected(SignalKind::Answer)),
        }
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(self.fail("apply remote description", TransportError::Closed));
        };
        if let Err(e) = transport.apply_remote_description(description).await {
            return Err(self.fail("apply remote description", e));
        }
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidateInit) {
        if !self.seen_candidates.insert(candidate_key(&candidate)) {
            tracing::debug!("Duplicate candidate from {}", self.remote_id);
            return;
        }
        if !self.remote_description_set {
            tracing::debug!(
                "Buffering candidate from {} until the remote description is set",
                self.remote_id
            );
            self.pending_candidates.push(candidate);
            return;
        }
        self.add_candidate(candidate).await;
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(
                "Applying {} buffered candidates from {}",
                pending.len(),
                self.remote_id
            );
        }
        for candidate in pending {
            self.add_candidate(candidate).await;
        }
    }

    async fn add_candidate(&mut self, candidate: IceCandidateInit) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        if let Err(e) = transport.add_remote_candidate(candidate).await {
            tracing::warn!("Failed to add candidate from {}: {}", self.remote_id, e);
        }
    }

    /// React to a transport callback
    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent<T::Track>,
    ) -> Option<EngineUpdate<T::Track>> {
        if self.state.is_terminal() {
            return None;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(SignalPayload::Candidate(candidate));
                None
            }
            TransportEvent::RemoteTrack(track) => {
                self.remote_tracks.push(track.clone());
                Some(EngineUpdate::RemoteTrack(track))
            }
            TransportEvent::Link(LinkState::Connected) => {
                if self.state == HandshakeState::AnswerExchanged {
                    self.state = HandshakeState::Connected;
                    tracing::info!("Connected to {}", self.remote_id);
                    Some(EngineUpdate::State(self.state))
                } else {
                    None
                }
            }
            TransportEvent::Link(LinkState::Failed | LinkState::Closed) => {
                tracing::warn!("Transport to {} failed in state {}", self.remote_id, self.state);
                self.state = HandshakeState::Failed;
                Some(EngineUpdate::State(self.state))
            }
            TransportEvent::Link(LinkState::Disconnected) => {
                tracing::warn!("Transport to {} disconnected", self.remote_id);
                None
            }
            TransportEvent::Link(LinkState::Connecting) => None,
        }
    }

    /// Enter `Failed` for a reason outside the handshake itself
    pub fn mark_failed(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Failed;
        }
    }

    /// Release the transport; returns false if already closed
    pub async fn close(&mut self) -> bool {
        if self.state == HandshakeState::Closed {
            return false;
        }
        self.state = HandshakeState::Closed;
        self.pending_candidates.clear();

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Error closing transport to {}: {}", self.remote_id, e);
            }
        }
        tracing::debug!("Closed handshake with {}", self.remote_id);
        true
    }

    fn send(&self, payload: SignalPayload) {
        let message = SignalMessage::new(self.local_id.clone(), self.remote_id.clone(), payload);
        if self.outbox.send(message).is_err() {
            tracing::debug!("Outbox for {} closed, dropping message", self.remote_id);
        }
    }

    fn fail(&mut self, step: &'static str, source: TransportError) -> NegotiationError {
        self.state = HandshakeState::Failed;
        NegotiationError::Transport {
            remote: self.remote_id.clone(),
            step,
            source,
        }
    }

    fn unexpected(&mut self, kind: SignalKind) -> NegotiationError {
        let state = self.state;
        self.state = HandshakeState::Failed;
        NegotiationError::UnexpectedSignal {
            remote: self.remote_id.clone(),
            kind,
            state,
        }
    }
}
