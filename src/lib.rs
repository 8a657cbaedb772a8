//! `carrot-cellar` keeps RabbitMQ channels in the cellar until you need them.
//!
//! It sits on top of [`lapin`] and provides:
//! - a [`CachingConnectionFactory`](crate::connection::CachingConnectionFactory) that multiplexes
//!   many short-lived "borrow a channel" requests onto one physical connection and a small,
//!   bounded cache of channels, keeping transactional and non-transactional channels apart;
//! - a [`ResourceHolder`](crate::transaction::ResourceHolder) and a
//!   [`RabbitTransactionManager`](crate::transaction::RabbitTransactionManager) that bind channels
//!   to a logical transaction, so that commit and rollback act on exactly the right channels and
//!   delivery tags;
//! - a [`RabbitTemplate`](crate::template::RabbitTemplate) to run channel callbacks that
//!   transparently join an ongoing transaction;
//! - a [`BrokerAdmin`](crate::admin::BrokerAdmin) driving broker administration over an opaque
//!   RPC collaborator.
//!
//! [`ConnectionFactory`](crate::connection::ConnectionFactory) and
//! [`RabbitTransactionManager`](crate::transaction::RabbitTransactionManager) are the best
//! starting points.

pub mod admin;
pub mod amqp;
pub mod connection;
pub mod template;
pub mod transaction;
