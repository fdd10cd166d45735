//! CSV input of messages and CSV output of balances.

pub mod balance_writer;
pub mod message_reader;
