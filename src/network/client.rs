//! Represents a node in a distributed system that talks to every other node
//! over its own TCP connection.
use crate::error::StoreError;
use crate::network::{
    message, Connection, ControlMsg, FramedSink, FramedStream, Incoming,
    Message, MessageCodec, Transport,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Represents a `Client` node in a distributed system that is generic for
/// type `T`, where `T` is the types of messages that can be sent between
/// `Client`s
#[derive(Debug)]
pub struct Client<T> {
    /// The `id` of this `Client`, assigned by the [`Server`] on startup
    /// to be monotonically increasing based on the order of connections
    ///
    /// [`Server`]: crate::network::Server
    pub id: usize,
    /// The number of `Client`s in the network
    pub num_nodes: usize,
    /// The `address` of this `Client`
    pub address: SocketAddr,
    /// The id of the next message
    msg_id: AtomicUsize,
    /// A map of client id to the [`Connection`] with that `Client`
    peers: HashMap<usize, Mutex<Connection<T>>>,
    /// Used to deliver messages this `Client` sends to itself
    loopback: mpsc::Sender<Incoming<T>>,
}

impl<T: Send + Sync + DeserializeOwned + Serialize + 'static> Client<T> {
    /// Create a new [`Client`] that runs at `my_ip` and `my_port` and
    /// connects to every other node of a cluster of `num_nodes` nodes.
    ///
    /// Constructing the [`Client`] does these things:
    /// 1. Connects to the [`Server`]
    /// 2. Sends the server a [`ControlMsg::Introduction`] containing our
    ///    address
    /// 3. The [`Server`] responds with a [`ControlMsg::Directory`], containing
    ///    the addresses of all other currently connected [`Client`]s, and
    ///    our id
    /// 4. Connects to all of those [`Client`]s and introduces itself
    /// 5. Waits until every [`Client`] that registers after us has connected
    ///    to us
    ///
    /// A task is spawned for every connection that forwards received
    /// messages to the returned receiver, and one that waits for a
    /// [`ControlMsg::Kill`] from the [`Server`] and then notifies the
    /// returned `Notify`.
    ///
    /// ## Parameters
    /// - `server_addr`: The address of the [`Server`] in `IP:Port` format
    /// - `my_ip`: The `IP` of this [`Client`]
    /// - `my_port`: An optional port for this [`Client`] to listen for new
    ///    connections. If its `None`, uses the OS to randomly assign a port.
    /// - `num_nodes`: The number of nodes in the network
    /// - `channel_capacity`: the size of the queue of received messages
    ///
    /// [`Server`]: crate::network::Server
    pub async fn new(
        server_addr: &str,
        my_ip: &str,
        my_port: Option<u16>,
        num_nodes: usize,
        channel_capacity: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Incoming<T>>, Arc<Notify>), StoreError>
    {
        // Setup a TCPListener
        let listener =
            TcpListener::bind((my_ip, my_port.unwrap_or(0))).await?;
        let my_address = listener.local_addr()?;

        // Connect to the server
        let server_stream = TcpStream::connect(server_addr).await?;
        let (reader, writer) = io::split(server_stream);
        let mut server_reader: FramedStream<ControlMsg> =
            FramedRead::new(reader, MessageCodec::new());
        let mut server_sink: FramedSink<ControlMsg> =
            FramedWrite::new(writer, MessageCodec::new());
        // Tell the server our address
        server_sink
            .send(Message::new(
                0,
                0,
                0,
                ControlMsg::Introduction {
                    address: my_address,
                },
            ))
            .await?;
        // Server responds with the addresses of all currently connected clients
        let dir_msg = message::read_msg(&mut server_reader).await?;
        let dir = match dir_msg.msg {
            ControlMsg::Directory { dir } => dir,
            _ => return Err(StoreError::UnexpectedMessage),
        };
        let id = dir_msg.target_id;
        info!("Client got id {} running at address {}", id, my_address);

        let (sender, receiver) = mpsc::channel(channel_capacity.max(1));
        let mut peers = HashMap::new();

        // Connect to all the currently existing clients
        for (peer_id, addr) in dir.into_iter() {
            let (stream, sink) =
                Self::connect(id, my_address, peer_id, addr).await?;
            peers.insert(
                peer_id,
                Mutex::new(Connection {
                    address: addr,
                    sink,
                }),
            );
            Self::forward(peer_id, stream, sender.clone());
        }

        // block until all the other clients start up and connect to us
        while peers.len() + 1 < num_nodes {
            let (socket, _) = listener.accept().await?;
            let (reader, writer) = io::split(socket);
            let mut stream: FramedStream<ControlMsg> =
                FramedRead::new(reader, MessageCodec::new());
            // read the introduction message from the new client
            let intro = message::read_msg(&mut stream).await?;
            let address = match intro.msg {
                ControlMsg::Introduction { address } => address,
                _ => return Err(StoreError::UnexpectedMessage),
            };
            if peers.contains_key(&intro.sender_id) || intro.sender_id == id {
                return Err(StoreError::ReconnectionError);
            }
            let sink = FramedWrite::new(writer, MessageCodec::<T>::new());
            peers.insert(intro.sender_id, Mutex::new(Connection { address, sink }));
            let stream = stream.map_decoder(MessageCodec::retype);
            Self::forward(intro.sender_id, stream, sender.clone());
            info!("Connected to id: {} at address: {}", intro.sender_id, address);
        }

        // Listen for further messages from the Server, e.g. `Kill` messages
        let kill_notifier = Arc::new(Notify::new());
        Self::recv_server_msg(server_reader, server_sink, kill_notifier.clone());

        let client = Client {
            id,
            num_nodes,
            address: my_address,
            msg_id: AtomicUsize::new(dir_msg.msg_id + 1),
            peers,
            loopback: sender,
        };
        Ok((Arc::new(client), receiver, kill_notifier))
    }

    /// Connects to the [`Client`] with the given `peer_id` running at
    /// `peer_addr` and introduces ourselves to it.
    async fn connect(
        id: usize,
        my_address: SocketAddr,
        peer_id: usize,
        peer_addr: SocketAddr,
    ) -> Result<(FramedStream<T>, FramedSink<T>), StoreError> {
        let stream = TcpStream::connect(&peer_addr).await?;
        let (reader, writer) = io::split(stream);
        let stream = FramedRead::new(reader, MessageCodec::<T>::new());
        let mut sink: FramedSink<ControlMsg> =
            FramedWrite::new(writer, MessageCodec::new());
        sink.send(Message::new(
            0,
            id,
            peer_id,
            ControlMsg::Introduction {
                address: my_address,
            },
        ))
        .await?;
        info!("Connected to id: {} at address: {}", peer_id, peer_addr);
        Ok((stream, sink.map_encoder(MessageCodec::retype)))
    }

    /// Spawns a `tokio` task that forwards every message read from `stream`
    /// to `sender`, and a `PeerLost` once the stream ends.
    fn forward(
        peer_id: usize,
        mut stream: FramedStream<T>,
        sender: mpsc::Sender<Incoming<T>>,
    ) {
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(msg) => {
                        debug!("Got message {} from node {}", msg.msg_id, peer_id);
                        if sender.send(Incoming::Message(msg)).await.is_err() {
                            // nobody is listening anymore
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Error reading from node {}: {}", peer_id, e);
                        break;
                    }
                }
            }
            warn!("Lost the connection to node {}", peer_id);
            let _ = sender.send(Incoming::PeerLost(peer_id)).await;
        });
    }

    /// Spawns a `tokio` task that will handle receiving [`ControlMsg::Kill`]
    /// messages from the [`Server`]. The connection to the server closing is
    /// treated the same way.
    ///
    /// [`Server`]: crate::network::Server
    fn recv_server_msg(
        mut reader: FramedStream<ControlMsg>,
        sink: FramedSink<ControlMsg>,
        notifier: Arc<Notify>,
    ) {
        tokio::spawn(async move {
            // keep our half of the connection open until we are told to stop
            let _sink = sink;
            match message::read_msg(&mut reader).await {
                Ok(Message {
                    msg: ControlMsg::Kill,
                    ..
                }) => info!("Received a kill message from the server"),
                Ok(msg) => warn!("Unexpected message from the server {:?}", msg),
                Err(e) => warn!("Lost the connection to the server: {}", e),
            }
            notifier.notify_one();
        });
    }
}

#[async_trait]
impl<T: Send + Sync + DeserializeOwned + Serialize + 'static> Transport<T>
    for Client<T>
{
    fn id(&self) -> usize {
        self.id
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Send the given `message` to a [`Client`] with the given `target_id`.
    /// Id's are automatically assigned by a [`Server`] during the
    /// registration period based on the order of connections.
    ///
    /// [`Server`]: crate::network::Server
    async fn send_msg(&self, target_id: usize, msg: T) -> Result<(), StoreError> {
        let msg_id = self.msg_id.fetch_add(1, Ordering::Relaxed);
        let m = Message::new(msg_id, self.id, target_id, msg);
        if target_id == self.id {
            return self
                .loopback
                .send(Incoming::Message(m))
                .await
                .map_err(|_| StoreError::unavailable(target_id, "send"));
        }
        let conn = self
            .peers
            .get(&target_id)
            .ok_or(StoreError::UnknownId(target_id))?;
        match conn.lock().await.sink.send(m).await {
            Ok(()) => {
                debug!("Sent message {} to node {}", msg_id, target_id);
                Ok(())
            }
            Err(e) => {
                error!("Could not send to node {}: {}", target_id, e);
                Err(StoreError::unavailable(target_id, "send"))
            }
        }
    }
}
