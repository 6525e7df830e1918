//! Message routing: unicast, filtered broadcast and server-initiated close.
//!
//! A [`MessageRouter`] is a short-lived view over the registry handed to
//! every hook.  It only ever addresses `OPEN` sessions; connections still in
//! the handshake or already retired are invisible to it.
//!
//! # Delivery order
//!
//! Broadcasts encode the frame once and write it to recipients in ascending
//! [`ConnectionId`] order.  A write failure on one recipient retires that
//! connection and delivery continues with the next.

use std::collections::BTreeSet;
use std::io;

use thiserror::Error;
use tracing::{debug, trace, warn};
use ws_core::protocol::close::encode_close_payload;
use ws_core::protocol::frame::{encode_frame, Opcode};
use ws_core::protocol::CloseCode;

use crate::application::registry::ConnectionRegistry;
use crate::domain::ConnectionId;

/// Failure to deliver to one connection.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("connection {0} does not exist")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),

    #[error("write to connection {id} failed: {source}")]
    Transport {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },
}

/// Which open sessions a broadcast reaches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Recipients {
    /// Every open session.
    #[default]
    All,
    /// Only these ids.  Unknown or non-open ids are skipped.
    Only(BTreeSet<ConnectionId>),
    /// Every open session except these ids.
    Except(BTreeSet<ConnectionId>),
}

impl Recipients {
    pub fn only(ids: impl IntoIterator<Item = ConnectionId>) -> Self {
        Recipients::Only(ids.into_iter().collect())
    }

    pub fn except(ids: impl IntoIterator<Item = ConnectionId>) -> Self {
        Recipients::Except(ids.into_iter().collect())
    }

    /// Builds the filter from an explicit receiver list and an exclusion
    /// list.  A non-empty receiver list wins; exclusions are ignored then.
    pub fn from_sets(receivers: &[ConnectionId], excluded: &[ConnectionId]) -> Self {
        if !receivers.is_empty() {
            Recipients::only(receivers.iter().copied())
        } else if !excluded.is_empty() {
            Recipients::except(excluded.iter().copied())
        } else {
            Recipients::All
        }
    }

    pub fn includes(&self, id: ConnectionId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Only(ids) => ids.contains(&id),
            Recipients::Except(ids) => !ids.contains(&id),
        }
    }
}

/// Where [`MessageRouter::send`] delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    Broadcast(Recipients),
}

impl From<ConnectionId> for Target {
    fn from(id: ConnectionId) -> Self {
        Target::Connection(id)
    }
}

impl From<Recipients> for Target {
    fn from(recipients: Recipients) -> Self {
        Target::Broadcast(recipients)
    }
}

/// Outcome of a multi-recipient delivery.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Connections that accepted the frame, in delivery order.
    pub delivered: Vec<ConnectionId>,
    /// The most recent delivery failure, if any.
    pub last_error: Option<RouteError>,
}

impl BroadcastReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_clean(&self) -> bool {
        self.last_error.is_none()
    }
}

/// Routing handle over the connection registry.
#[derive(Debug)]
pub struct MessageRouter<'a> {
    registry: &'a mut ConnectionRegistry,
}

impl<'a> MessageRouter<'a> {
    pub fn new(registry: &'a mut ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Read access to every live connection and its session.
    pub fn registry(&self) -> &ConnectionRegistry {
        self.registry
    }

    /// Ids of every open session, ascending.
    pub fn open_ids(&self) -> Vec<ConnectionId> {
        self.registry.open_ids()
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.registry.is_open(id)
    }

    /// Sends `payload` as one unmasked TEXT frame to `id`.
    ///
    /// # Errors
    ///
    /// - [`RouteError::UnknownConnection`] / [`RouteError::NotOpen`]: nothing
    ///   is written and nothing changes.
    /// - [`RouteError::Transport`]: the connection has been retired.
    pub fn send_to(&mut self, id: ConnectionId, payload: &[u8]) -> Result<(), RouteError> {
        self.deliver(id, &encode_frame(payload, Opcode::Text, false))
    }

    /// Like [`send_to`](Self::send_to) with a BINARY frame.
    pub fn send_binary_to(&mut self, id: ConnectionId, payload: &[u8]) -> Result<(), RouteError> {
        self.deliver(id, &encode_frame(payload, Opcode::Binary, false))
    }

    /// Sends `payload` as a TEXT frame to every open session `recipients`
    /// admits.
    ///
    /// `sender` only labels the log line (`SYSTEM` when `None`); it does not
    /// exclude the sender from delivery.  Use [`Recipients::Except`] for that.
    pub fn broadcast(
        &mut self,
        payload: &[u8],
        recipients: &Recipients,
        sender: Option<ConnectionId>,
    ) -> BroadcastReport {
        let wire = encode_frame(payload, Opcode::Text, false);
        let targets: Vec<ConnectionId> = match recipients {
            Recipients::Only(ids) => ids.iter().copied().filter(|id| self.is_open(*id)).collect(),
            _ => self
                .registry
                .open_ids()
                .into_iter()
                .filter(|id| recipients.includes(*id))
                .collect(),
        };

        let mut report = BroadcastReport::default();
        for id in targets {
            match self.deliver(id, &wire) {
                Ok(()) => report.delivered.push(id),
                Err(e) => report.last_error = Some(e),
            }
        }

        debug!(
            sender = %sender_label(sender),
            bytes = payload.len(),
            delivered = report.delivered.len(),
            "broadcast"
        );
        report
    }

    /// Single entry point for hooks: unicast to a [`ConnectionId`] or
    /// broadcast to [`Recipients`].
    pub fn send(
        &mut self,
        payload: &[u8],
        sender: Option<ConnectionId>,
        target: impl Into<Target>,
    ) -> BroadcastReport {
        match target.into() {
            Target::Broadcast(recipients) => self.broadcast(payload, &recipients, sender),
            Target::Connection(id) => {
                trace!(sender = %sender_label(sender), to = %id, bytes = payload.len(), "send");
                let mut report = BroadcastReport::default();
                match self.send_to(id, payload) {
                    Ok(()) => report.delivered.push(id),
                    Err(e) => report.last_error = Some(e),
                }
                report
            }
        }
    }

    /// Closes `id` with `code` and no reason.  See
    /// [`close_with_reason`](Self::close_with_reason).
    pub fn close(&mut self, id: ConnectionId, code: CloseCode) -> bool {
        self.close_with_reason(id, code, "")
    }

    /// Starts a server-initiated close.
    ///
    /// An open session gets a CLOSE frame first (best effort); any other
    /// live connection is released without one.  The id is retired at once,
    /// `on_close` follows once the event loop releases the socket.  A failed
    /// CLOSE write is queued on the registry for `on_error`.  Returns
    /// `false` for unknown ids.
    pub fn close_with_reason(&mut self, id: ConnectionId, code: CloseCode, reason: &str) -> bool {
        let Some(conn) = self.registry.get_mut(id) else {
            return false;
        };
        if conn.session().is_open() {
            // Open -> Closing is always allowed.
            let _ = conn.session_mut().begin_closing();
            let wire = encode_frame(&encode_close_payload(code, reason), Opcode::Close, false);
            if let Err(source) = conn.send(&wire) {
                warn!(conn = %id, "close frame not delivered: {source}");
                self.registry.report_failure(id, source);
            }
        }
        debug!(conn = %id, %code, "closing connection");
        self.registry.retire(id)
    }

    fn deliver(&mut self, id: ConnectionId, wire: &[u8]) -> Result<(), RouteError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(RouteError::UnknownConnection(id))?;
        if !conn.session().is_open() {
            return Err(RouteError::NotOpen(id));
        }
        if let Err(source) = conn.send(wire) {
            warn!(conn = %id, "write failed, closing connection: {source}");
            self.registry.retire(id);
            return Err(RouteError::Transport { id, source });
        }
        Ok(())
    }
}

fn sender_label(sender: Option<ConnectionId>) -> String {
    match sender {
        Some(id) => id.to_string(),
        None => "SYSTEM".to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
