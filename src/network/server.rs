//! The registration `Server` that assigns ids to the nodes of a cluster and
//! tells every new node where the nodes that registered before it are.
use crate::error::StoreError;
use crate::network::{message, Connection, ControlMsg, FramedStream, Message, MessageCodec};
use futures::SinkExt;
use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::split;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Represents a registration `Server` in a distributed system.
#[derive(Debug)]
pub struct Server {
    /// The `address` of this `Server`
    pub address: SocketAddr,
    /// The id of the current message
    pub msg_id: usize,
    /// A directory which is a map of client id to a [`Connection`](Connection)
    pub directory: HashMap<usize, Connection<ControlMsg>>,
    /// A `TcpListener` which listens for connections from new `Client`s
    listener: TcpListener,
}

impl Server {
    /// Create a new `Server` running on the given `address` in `IP:Port`
    /// format. Port `0` lets the OS pick a port, see `address`.
    pub async fn new(address: &str) -> Result<Self, StoreError> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        info!("Registration server listening on {}", address);
        Ok(Server {
            address,
            msg_id: 0,
            directory: HashMap::new(),
            listener,
        })
    }

    /// A blocking function that registers `num_nodes` new nodes. Each node is
    /// given the next id, starting at `1`, and the addresses of every node
    /// registered before it.
    pub async fn accept_new_connections(
        &mut self,
        num_nodes: usize,
    ) -> Result<(), StoreError> {
        while self.directory.len() < num_nodes {
            // wait on connections from new clients
            let (socket, _) = self.listener.accept().await?;
            let (reader, writer) = split(socket);
            let mut stream: FramedStream<ControlMsg> =
                FramedRead::new(reader, MessageCodec::new());
            let sink = FramedWrite::new(writer, MessageCodec::new());
            // Read the IP:Port from the client
            let address = match message::read_msg(&mut stream).await?.msg {
                ControlMsg::Introduction { address } => address,
                _ => return Err(StoreError::UnexpectedMessage),
            };
            let assigned_id = self.directory.len() + 1;
            let mut dir: Vec<(usize, SocketAddr)> = self
                .directory
                .iter()
                .map(|(k, v)| (*k, v.address))
                .collect();
            dir.sort_unstable();
            self.directory.insert(assigned_id, Connection { address, sink });
            self.send_msg(assigned_id, ControlMsg::Directory { dir }).await?;
            info!("Registered node {} at address {}", assigned_id, address);
        }
        Ok(())
    }

    /// Send a message to a client with the given `target_id`.
    pub(crate) async fn send_msg(
        &mut self,
        target_id: usize,
        message: ControlMsg,
    ) -> Result<(), StoreError> {
        match self.directory.get_mut(&target_id) {
            None => Err(StoreError::UnknownId(target_id)),
            Some(conn) => {
                let m = Message::new(self.msg_id, 0, target_id, message);
                conn.sink.send(m).await?;
                self.msg_id += 1;
                Ok(())
            }
        }
    }

    /// Tell every registered node to shut down. Nodes that already went away
    /// are skipped.
    pub async fn broadcast_kill(&mut self) -> Result<(), StoreError> {
        let ids: Vec<usize> = self.directory.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.send_msg(id, ControlMsg::Kill).await {
                warn!("Could not send a kill message to node {}: {}", id, e);
            }
        }
        Ok(())
    }
}
