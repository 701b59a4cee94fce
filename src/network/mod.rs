//! Network subsystem for the duplex voice socket

pub mod connection;

pub use connection::{Connection, ConnectionManager, ConnectionReceiver, ConnectionSender};
