//! Message router: decodes a text frame's envelope, re-stamps identity from
//! the sending connection and fans it out to the rest of the room.
//!
//! The router runs on the sender's own receive loop, so messages from one
//! sender reach each recipient's queue in the order they were sent.

use crate::connection::ConnectionHandle;
use crate::registry::RoomRegistry;
use bytes::Bytes;
use sigrelay_core::{build_frame, CloseCode, Inbound, MessageKind, Opcode, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Characters of the SDP used to recognise a repeated offer.
const OFFER_KEY_SDP_CHARS: usize = 50;

/// Result of routing one envelope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients closed because their queue was full.
    pub overflowed: usize,
    /// The envelope was a repeated offer and was not relayed.
    pub duplicate: bool,
}

/// Remembers recently relayed offers.
#[derive(Debug)]
struct OfferDeduper {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl OfferDeduper {
    fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Returns `true` if `key` was not seen within the window, and records it.
    fn check_and_record(&mut self, key: String) -> bool {
        let now = Instant::now();
        match self.seen.get(&key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    fn gc(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.seen.len();
        self.seen.retain(|_, at| now.duration_since(*at) < window);
        before - self.seen.len()
    }
}

/// Routes envelopes between the members of a room.
pub struct Router {
    registry: Arc<RoomRegistry>,
    offers: Option<Mutex<OfferDeduper>>,
}

impl Router {
    /// Create a router. `offer_window` enables duplicate-offer suppression.
    pub fn new(registry: Arc<RoomRegistry>, offer_window: Option<Duration>) -> Self {
        Self {
            registry,
            offers: offer_window.map(|w| Mutex::new(OfferDeduper::new(w))),
        }
    }

    /// Decode and route the text of one complete text frame.
    ///
    /// Malformed JSON is [`RelayError::EnvelopeDecode`]; a sender whose room
    /// no longer exists gets [`RelayError::RoomNotFound`]. Neither closes
    /// the sender's connection.
    pub async fn route_text(&self, from: &ConnectionHandle, text: &str) -> RelayResult<RouteOutcome> {
        let inbound = Inbound::decode(text)?;
        self.route(from, inbound).await
    }

    /// Stamp and fan out an already decoded envelope.
    ///
    /// The sender is skipped unless the type asks for a room-wide broadcast
    /// (`resend-offer-request`).
    pub async fn route(&self, from: &ConnectionHandle, inbound: Inbound) -> RelayResult<RouteOutcome> {
        if inbound.kind == MessageKind::Offer && self.is_repeated_offer(from, &inbound).await {
            warn!(
                room = %from.room(),
                sender = %from.participant_id(),
                "duplicate offer ignored"
            );
            return Ok(RouteOutcome {
                duplicate: true,
                ..RouteOutcome::default()
            });
        }

        let kind = inbound.kind;
        let include_sender = kind.includes_sender();
        let envelope = inbound.stamp(&from.room().room_id, from.participant_id());
        let frame = Bytes::from(build_frame(Opcode::Text, envelope.to_json()?.as_bytes()));

        let members = self
            .registry
            .lookup(from.room())
            .await
            .ok_or_else(|| RelayError::RoomNotFound(from.room().to_string()))?;

        let mut outcome = RouteOutcome::default();
        let recipients = members
            .iter()
            .filter(|p| (include_sender || p.id() != from.id()) && p.is_open());
        for peer in recipients {
            match peer.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(RelayError::Backpressure(id)) => {
                    warn!(
                        room = %from.room(),
                        recipient = %peer.participant_id(),
                        connection = id,
                        "recipient outbound queue full, closing it"
                    );
                    peer.close(CloseCode::InternalError, "outbound queue overflow");
                    outcome.overflowed += 1;
                }
                Err(e) => {
                    debug!(recipient = %peer.participant_id(), error = %e, "recipient gone, skipped");
                }
            }
        }

        debug!(
            room = %from.room(),
            sender = %from.participant_id(),
            kind = kind.as_str(),
            delivered = outcome.delivered,
            "envelope relayed"
        );
        Ok(outcome)
    }

    async fn is_repeated_offer(&self, from: &ConnectionHandle, inbound: &Inbound) -> bool {
        let (Some(offers), Some(sdp)) = (&self.offers, inbound.sdp()) else {
            return false;
        };
        let prefix: String = sdp.chars().take(OFFER_KEY_SDP_CHARS).collect();
        let key = format!("{}_{}_{}", from.room(), from.participant_id(), prefix);
        !offers.lock().await.check_and_record(key)
    }

    /// Drop expired offer records. Returns how many were removed.
    pub async fn gc(&self) -> usize {
        match &self.offers {
            Some(offers) => offers.lock().await.gc(),
            None => 0,
        }
    }
}
