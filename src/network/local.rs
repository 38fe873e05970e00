//! An in-process network connecting the nodes of a cluster that all run in
//! the same process, used by `LocalCluster`.
use crate::error::StoreError;
use crate::network::{Incoming, Message, Transport};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

type Switchboard<T> = Arc<RwLock<HashMap<usize, mpsc::Sender<Incoming<T>>>>>;

/// The shared switchboard every `LocalTransport` of one cluster sends
/// through
#[derive(Debug)]
pub struct LocalNetwork<T> {
    num_nodes: usize,
    capacity: usize,
    nodes: Switchboard<T>,
}

/// One node's connection to a `LocalNetwork`
#[derive(Debug)]
pub struct LocalTransport<T> {
    id: usize,
    num_nodes: usize,
    msg_id: AtomicUsize,
    nodes: Switchboard<T>,
}

impl<T: Send + 'static> LocalNetwork<T> {
    /// Creates a network for `num_nodes` nodes, each receiving on a queue
    /// of `capacity` messages
    pub fn new(num_nodes: usize, capacity: usize) -> Self {
        LocalNetwork {
            num_nodes,
            capacity: capacity.max(1),
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Adds the node with the given `id` to the network
    pub fn join(&self, id: usize) -> (LocalTransport<T>, mpsc::Receiver<Incoming<T>>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        let transport = LocalTransport {
            id,
            num_nodes: self.num_nodes,
            msg_id: AtomicUsize::new(0),
            nodes: self.nodes.clone(),
        };
        (transport, receiver)
    }

    /// Disconnects the node with the given `id`, as if its process died. Its
    /// receiver is closed and every remaining node is told it was lost.
    pub async fn kill(&self, id: usize) {
        let remaining: Vec<mpsc::Sender<Incoming<T>>> = {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            nodes.remove(&id);
            nodes.values().cloned().collect()
        };
        info!("Node {} was disconnected from the local network", id);
        for sender in remaining {
            let _ = sender.send(Incoming::PeerLost(id)).await;
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Transport<T> for LocalTransport<T> {
    fn id(&self) -> usize {
        self.id
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    async fn send_msg(&self, target_id: usize, msg: T) -> Result<(), StoreError> {
        let sender = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target_id)
            .cloned();
        let sender = match sender {
            Some(s) => s,
            None => return Err(StoreError::unavailable(target_id, "send")),
        };
        let msg_id = self.msg_id.fetch_add(1, Ordering::Relaxed);
        let m = Message::new(msg_id, self.id, target_id, msg);
        sender
            .send(Incoming::Message(m))
            .await
            .map_err(|_| StoreError::unavailable(target_id, "send"))?;
        debug!("Sent message {} from node {} to node {}", msg_id, self.id, target_id);
        Ok(())
    }
}
