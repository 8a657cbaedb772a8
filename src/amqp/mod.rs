//! Helpers for connecting to a rabbitmq broker with [`lapin`].

mod client;
pub mod configuration;
mod connector;
pub use connector::LapinConnector;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
