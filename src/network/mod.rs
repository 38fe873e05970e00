//! A module with methods to communicate with nodes in a distributed system
//! over TCP, as well as the registration `Server`, the peer `Client` and an
//! in-process `LocalNetwork` for running a whole cluster in one process.
//!
//! Everything above this module talks to other nodes through the
//! [`Transport`] trait and receives what other nodes sent it as
//! [`Incoming`] values on an `mpsc` channel.
use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

mod client;
mod local;
mod message;
mod server;

pub use client::Client;
pub use local::{LocalNetwork, LocalTransport};
pub use server::Server;

/// A connection to another node, used for sending directed communication
#[derive(Debug)]
pub struct Connection<T> {
    /// The `IP:Port` of the other node
    pub address: SocketAddr,
    /// The buffered stream used for sending messages to the other node
    pub sink: FramedWrite<WriteHalf<TcpStream>, MessageCodec<T>>,
}

pub(crate) type FramedStream<T> =
    FramedRead<tokio::io::ReadHalf<TcpStream>, MessageCodec<T>>;
pub(crate) type FramedSink<T> = FramedWrite<WriteHalf<TcpStream>, MessageCodec<T>>;

/// A message for communication between nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message<T> {
    /// The id of this message
    pub msg_id: usize,
    /// The id of the sender
    pub sender_id: usize,
    /// The id of the node this message is being sent to
    pub target_id: usize,
    /// The body of the message
    pub msg: T,
}

/// What a node receives from the network
#[derive(Debug)]
pub enum Incoming<T> {
    /// A message sent by another node
    Message(Message<T>),
    /// The connection to the node with this id was lost, nothing more will
    /// be received from it and nothing can be sent to it
    PeerLost(usize),
}

/// Control messages to facilitate communication with the registration
/// `Server`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMsg {
    /// A directory message sent by the `Server` to new nodes once they
    /// connect so that they know which other nodes are already connected
    Directory { dir: Vec<(usize, SocketAddr)> },
    /// An introduction that a new node sends to the `Server` and to all
    /// nodes that registered before it
    Introduction { address: SocketAddr },
    /// Sent by the `Server` to tell every node to shut down
    Kill,
}

/// A codec for `Message<T>`s: a length delimited frame holding the
/// `bincode` serialized message
#[derive(Debug)]
pub struct MessageCodec<T> {
    phantom: std::marker::PhantomData<T>,
    pub(crate) codec: tokio_util::codec::LengthDelimitedCodec,
}

/// The ability to send messages of type `T` to the other nodes of a cluster.
/// Implemented over TCP by [`Client`] and in memory by [`LocalTransport`].
#[async_trait]
pub trait Transport<T: Send + 'static>: Send + Sync {
    /// The id of this node, starting at `1`
    fn id(&self) -> usize;

    /// The number of nodes in the cluster
    fn num_nodes(&self) -> usize;

    /// Send `msg` to the node with the id `target_id`. Sending to ourselves
    /// is allowed and delivers to our own receiver.
    ///
    /// ## Errors
    /// `NodeUnavailable` if the message could not be handed to the target
    async fn send_msg(&self, target_id: usize, msg: T) -> Result<(), StoreError>;
}
