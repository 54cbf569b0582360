//! RabbitMQ transport.
//!
//! This module implements the `Transport` trait against an AMQP 0-9-1 broker
//! using `lapin`. It is split along the lifetimes of the broker resources it
//! manages:
//!
//! - `connection` - the one lazily-dialled connection per transport
//! - `channels`   - send channels, one per publishing worker
//! - `codec`      - envelope to wire-properties mapping
//! - `transport`  - the `Transport` implementation tying them together

mod channels;
mod codec;
mod connection;
mod transport;

pub use transport::create_transport;

use crate::{Error, Result};
use lapin::Channel;

/// Whether a client error means the channel or connection was already gone.
///
/// Closing such a handle again is not a failure; every other error is.
pub(crate) fn is_already_closed(error: &lapin::Error) -> bool {
    matches!(
        error,
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
    )
}

/// Close a channel, treating an already-closed channel as success.
pub(crate) async fn close_channel(channel: &Channel) -> Result<()> {
    match channel.close(200, "done with channel").await {
        Ok(()) => Ok(()),
        Err(error) if is_already_closed(&error) => Ok(()),
        Err(error) => Err(Error::Connectivity(error)),
    }
}
