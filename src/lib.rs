//! # replyq
//!
//! Request-reply over an AMQP broker.
//!
//! A caller publishes a request with a fresh correlation id and an ad-hoc
//! reply address, then waits on a deadline ([`correlator`]). A fixed pool
//! of workers drains the durable work queue and replies ([`worker`]).
//! [`shutdown`] stops the pool between messages and releases the
//! connection once every worker has finished.

pub mod broker;
pub mod config;
pub mod correlator;
pub mod error;
pub mod http;
pub mod model;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
