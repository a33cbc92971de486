//! Room chat server over WebSockets.
//!
//! Clients connect to `/ws?userId=<id>`, join named rooms and exchange
//! messages with every member of a room. Each module focuses on a concrete
//! responsibility:
//!
//! - [`message`] decodes inbound frames into events and encodes outbound
//!   notifications.
//! - [`registry`] keeps connected users and room membership behind a single
//!   lock.
//! - [`connection`] owns each connection's bounded outbound queue and writer
//!   task.
//! - [`broadcast`] fans a notification out to a room's members.
//! - [`session`] drives one connection from upgrade to teardown.
//! - [`server`] wires the axum router, HTTP introspection routes and
//!   graceful shutdown.
//! - [`audit`] records delivered actions when enabled.
//! - [`cli`] and [`client`] provide the `serve` and interactive `client`
//!   commands.
//!
//! Integration tests use this crate directly to exercise sessions over real
//! sockets.

pub mod audit;
pub mod broadcast;
pub mod cli;
pub mod client;
pub mod connection;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
