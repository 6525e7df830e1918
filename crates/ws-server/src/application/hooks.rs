//! Application callbacks invoked by the event loop.
//!
//! Every method has a no-op default, so an application implements only the
//! events it cares about.  All hooks run on the event loop thread, one at a
//! time; a hook that blocks stalls every connection.

use ws_core::protocol::handshake::{HandshakeRequest, HandshakeResponse};
use ws_core::protocol::message::Message;

use crate::application::router::MessageRouter;
use crate::domain::{ConnectionId, Session};
use crate::error::ServerError;

/// Verdict of [`ServerHooks::on_handshake`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeDecision {
    /// Send the (possibly edited) response and open the session.
    #[default]
    Accept,
    /// Refuse the upgrade.  A response still carrying status 101 is replaced
    /// by `403 Forbidden`.
    Reject,
}

pub trait ServerHooks {
    /// A TCP connection was accepted.  The session is not open yet, so the
    /// router cannot address it.
    fn on_connect(&mut self, _router: &mut MessageRouter<'_>, _id: ConnectionId) {}

    /// A complete Upgrade request arrived.  The hook may add headers to the
    /// draft 101 response, replace it entirely, or reject the upgrade.
    fn on_handshake(
        &mut self,
        _request: &HandshakeRequest,
        _response: &mut HandshakeResponse,
    ) -> HandshakeDecision {
        HandshakeDecision::Accept
    }

    /// The 101 response was written; the session is open.
    fn on_open(&mut self, _router: &mut MessageRouter<'_>, _id: ConnectionId, _request: &HandshakeRequest) {}

    /// A complete text or binary message arrived from `id`.
    fn on_message(&mut self, _router: &mut MessageRouter<'_>, _id: ConnectionId, _message: &Message) {}

    /// The connection has been released.  `session` is its final state; the
    /// id is no longer routable.
    fn on_close(&mut self, _router: &mut MessageRouter<'_>, _session: &Session) {}

    /// A non-fatal failure.  The affected connection, if any, has already
    /// been closed.
    fn on_error(&mut self, _error: &ServerError) {}
}

/// Hooks that do nothing.  Useful for tests and as a starting point.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ServerHooks for NoopHooks {}
