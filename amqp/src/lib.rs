//! # AMQP Core
//!
//! AMQP 1.0 connection, session and link state machines with claims-based
//! security. Callback-driven protocol events are bridged to awaiting callers
//! through [`AsyncOperationQueue`](common::AsyncOperationQueue); every wait
//! pumps the connections and listeners it is given.
//!
//! ## Modules
//!
//! - [`common`] - Completion queue, cancellation context and handle registry
//! - [`connection`] - Connection state machine and endpoint dispatch
//! - [`session`] - Sessions, flow windows and offered session endpoints
//! - [`link`] - Links, credit and offered link endpoints
//! - [`message_sender`] / [`message_receiver`] - Send and receive over one link
//! - [`management`] - Request/response against a management node
//! - [`cbs`] - Claims-based security token exchange
//! - [`auth`] - Connection string credentials and SAS tokens
//! - [`models`] - Performatives, messages and values
//! - [`network`] - Frame codec, transport, SASL and socket listener
//! - [`errors`] - Error types

pub mod auth;
pub mod cbs;
pub mod common;
pub mod connection;
pub mod errors;
mod lifecycle;
pub mod link;
pub mod management;
pub mod message_receiver;
pub mod message_sender;
pub mod models;
pub mod network;
pub mod session;

pub use errors::{AmqpError, AmqpResult};
