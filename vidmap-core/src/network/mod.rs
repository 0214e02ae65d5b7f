//! Managed viewer connections over framed TCP.

pub mod connection;

pub use connection::{ViewerConnection, ViewerSender};
