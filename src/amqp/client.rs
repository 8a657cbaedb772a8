//! [`Channel`] and [`Connection`] for [`lapin`] types.
use std::any::Any;

use lapin::options::{BasicAckOptions, BasicRejectOptions};
use lapin::{ChannelState, ConnectionState};

use crate::connection::{Channel, Connection, DeliveryTag};

const REPLY_SUCCESS: u16 = 200;

#[async_trait::async_trait]
impl Channel for lapin::Channel {
    async fn basic_ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        let options = BasicAckOptions { multiple: false };
        Ok(lapin::Channel::basic_ack(self, delivery_tag, options).await?)
    }

    async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        let options = BasicRejectOptions { requeue };
        Ok(lapin::Channel::basic_reject(self, delivery_tag, options).await?)
    }

    async fn tx_select(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::tx_select(self).await?)
    }

    async fn tx_commit(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::tx_commit(self).await?)
    }

    async fn tx_rollback(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::tx_rollback(self).await?)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::close(self, REPLY_SUCCESS, "OK").await?)
    }

    fn is_open(&self) -> bool {
        matches!(self.status().state(), ChannelState::Connected)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait::async_trait]
impl Connection for lapin::Connection {
    async fn create_channel(&self) -> Result<Box<dyn Channel>, anyhow::Error> {
        let channel = lapin::Connection::create_channel(self).await?;
        Ok(Box::new(channel))
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Connection::close(self, REPLY_SUCCESS, "OK").await?)
    }

    fn is_open(&self) -> bool {
        matches!(self.status().state(), ConnectionState::Connected)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
