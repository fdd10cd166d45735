//! Application layer: the ledger, the transaction coordinator, dead-letter
//! redirection and the route engine that ties them together.
//!
//! The `RouteEngine` is the primary entry point. It pulls messages from
//! channels with a pool of `tokio` workers and runs each one through its
//! route inside the unit of work the route's policy asks for.

pub mod coordinator;
pub mod dead_letter;
pub mod engine;
pub mod ledger;
