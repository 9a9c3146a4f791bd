//! spasm-net: peer connections and session routing
//!
//! A [`PeerServer`] keeps at most one connection per peer identity, dials
//! lazily when a message is queued for a peer without one, and routes
//! inbound frames:
//!
//! - responses to the pending [`PeerServer::request`] with the same id
//! - PING and END_SESSION are answered by the server itself
//! - `session_id == 0` requests to [`SessionHandler::handle_message`]
//! - everything else to the session named by `session_id`
//!
//! Every dialed connection starts with an INFO handshake carrying the
//! dialer's identity key and a random connection id, which the acceptor
//! uses for the tie-break in [`is_preferred_connection`].

pub mod connection;
pub mod server;
pub mod session;

pub use connection::{is_preferred_connection, ConnectionHandle, Outbox};
pub use server::{PeerServer, PeerServerBuilder};
pub use session::{Envelope, SessionContext, SessionHandler};

// Handlers implement the session trait with this macro
pub use async_trait::async_trait;
