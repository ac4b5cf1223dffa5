//! Two linked message ports, each delivering what it is given to the other.
//!
//! A [`MessagePort`] is not `Clone`. Handing one to another party moves it, so
//! the side that transferred a port keeps no usable reference to it.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Structured payload carried across a channel.
pub type PortMessage = Value;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("message port closed")]
    Closed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// A freshly entangled pair of ports.
#[derive(Debug)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (to_port2, port2_inbox) = mpsc::unbounded_channel();
        let (to_port1, port1_inbox) = mpsc::unbounded_channel();
        Self {
            port1: MessagePort::new(to_port2, port1_inbox),
            port2: MessagePort::new(to_port1, port2_inbox),
        }
    }

    pub fn into_ports(self) -> (MessagePort, MessagePort) {
        (self.port1, self.port2)
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One end of a [`MessageChannel`].
#[derive(Debug)]
pub struct MessagePort {
    sender: PortSender,
    receiver: PortReceiver,
}

impl MessagePort {
    fn new(
        outgoing: mpsc::UnboundedSender<PortMessage>,
        incoming: mpsc::UnboundedReceiver<PortMessage>,
    ) -> Self {
        Self {
            sender: PortSender { outgoing },
            receiver: PortReceiver { incoming },
        }
    }

    pub fn post_message(&self, message: PortMessage) -> ChannelResult<()> {
        self.sender.post_message(message)
    }

    /// Waits for the next message from the entangled port. Returns `None` once
    /// the other end has been dropped and its queue drained.
    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.receiver.recv().await
    }

    /// Splits the port so sending and receiving can live on different tasks.
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.sender, self.receiver)
    }
}

#[derive(Debug, Clone)]
pub struct PortSender {
    outgoing: mpsc::UnboundedSender<PortMessage>,
}

impl PortSender {
    pub fn post_message(&self, message: PortMessage) -> ChannelResult<()> {
        self.outgoing
            .send(message)
            .map_err(|_| ChannelError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

#[derive(Debug)]
pub struct PortReceiver {
    incoming: mpsc::UnboundedReceiver<PortMessage>,
}

impl PortReceiver {
    pub async fn recv(&mut self) -> Option<PortMessage> {
        self.incoming.recv().await
    }

    pub fn close(&mut self) {
        self.incoming.close();
    }
}
