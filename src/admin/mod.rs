//! Broker administration over an opaque remote-procedure-call collaborator.
//!
//! This sits above the connection layer: it talks to the broker's control interface
//! through [`BrokerRpc`], never through AMQP.
mod broker_admin;
pub mod configuration;
mod rpc;
mod status;

pub use broker_admin::{AdminError, BrokerAdmin};
pub use configuration::AdminSettings;
pub use rpc::{BrokerRpc, RpcError, RpcValue};
pub use status::{Application, QueueInfo, RabbitStatus};
