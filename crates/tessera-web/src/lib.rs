//! tessera front end.
//!
//! A [`hub::Hub`] owns the subscription table and pushes governed envelopes
//! to connected observers. Observers speak JSON-RPC 2.0 through a
//! [`session::Session`] over any of the [`transport`]s.

pub mod client;
pub mod config;
pub mod demo;
pub mod hub;
pub mod session;
pub mod tools;
pub mod transport;

pub use config::ServerConfig;
pub use hub::Hub;
pub use session::{ConnState, PROTOCOL_VERSION, Session};
pub use transport::{StreamOptions, TransportError};
