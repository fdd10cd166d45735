//! Domain types: accounts, messages, route descriptors and the ports the
//! application layer is written against.

pub mod account;
pub mod message;
pub mod ports;
pub mod route;
