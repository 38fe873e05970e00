//! This module defines the implementation of the highest level component of
//! a `fluxframe` cluster: one node, owning a share of the chunks of every
//! frame and able to start any operation on any frame.
use crate::chunk::Data;
use crate::config::NodeConfig;
use crate::engine::{self, Aggregate, Engine, JobHandle, MergeOptions, TaskMsg};
use crate::error::StoreError;
use crate::frame::{self, NamedColumn, WriteOptions};
use crate::kv::{Directory, KVMessage, Key, KeyKind};
use crate::network::{Client, Incoming, LocalNetwork, Transport};
use crate::synopsis::{self, Synopsis};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{mpsc::Receiver, Notify};
use tokio_util::sync::CancellationToken;

/// Everything nodes send each other
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum NodeMsg {
    /// A request to or a reply from another node's `Directory`
    Kv(KVMessage),
    /// Coordination of a distributed job
    Task(TaskMsg),
}

/// A node of a `fluxframe` cluster.
///
/// Every operation can be started on any node, it reads what it needs
/// through the node's `Directory` and publishes its result as a new frame
/// homed on this node. Cloning a `FluxNode` is cheap and every clone talks
/// to the same node.
#[derive(Clone)]
pub struct FluxNode {
    /// The id of this node, assigned by the registration `Server`
    pub node_id: usize,
    /// The number of nodes in the cluster
    pub num_nodes: usize,
    pub(crate) directory: Arc<Directory>,
    engine: Arc<Engine>,
    /// Notified when the registration `Server` tells the cluster to stop
    pub kill_notifier: Arc<Notify>,
    config: NodeConfig,
}

impl FluxNode {
    /// Registers with the `Server` at `config.server_addr` and waits until
    /// all `config.num_nodes` nodes are connected to each other.
    pub async fn connect(config: NodeConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let (client, receiver, kill_notifier) = Client::<NodeMsg>::new(
            &config.server_addr,
            &config.my_ip,
            config.my_port,
            config.num_nodes,
            config.channel_capacity,
        )
        .await?;
        Ok(FluxNode::start(client, receiver, kill_notifier, config))
    }

    /// Builds the node on top of an established `network` and spawns the
    /// task that processes everything it receives.
    fn start(
        network: Arc<dyn Transport<NodeMsg>>,
        receiver: Receiver<Incoming<NodeMsg>>,
        kill_notifier: Arc<Notify>,
        config: NodeConfig,
    ) -> Self {
        let node_id = network.id();
        let num_nodes = network.num_nodes();
        let directory = Arc::new(Directory::new(
            network.clone(),
            config.cache_entries,
            config.cache_bytes,
            config.request_timeout(),
        ));
        let write_opts = WriteOptions {
            rows_per_chunk: config.rows_per_chunk,
            lossy_digits: config.lossy_float_digits,
        };
        let engine = Arc::new(Engine::new(
            directory.clone(),
            network,
            config.threads(),
            write_opts,
        ));
        tokio::spawn(FluxNode::process_messages(
            directory.clone(),
            engine.clone(),
            receiver,
        ));
        info!("Node {} of {} is up", node_id, num_nodes);
        FluxNode {
            node_id,
            num_nodes,
            directory,
            engine,
            kill_notifier,
            config,
        }
    }

    /// Directory requests and job tasks are run on their own `tokio` tasks.
    /// Replies, invalidations and job events are applied in the order they
    /// arrive.
    async fn process_messages(
        directory: Arc<Directory>,
        engine: Arc<Engine>,
        mut receiver: Receiver<Incoming<NodeMsg>>,
    ) {
        while let Some(incoming) = receiver.recv().await {
            match incoming {
                Incoming::Message(msg) => {
                    debug!(
                        "Processing message {} from node {}",
                        msg.msg_id, msg.sender_id
                    );
                    let from = msg.sender_id;
                    match msg.msg {
                        NodeMsg::Kv(KVMessage::Reply { req, reply }) => {
                            directory.handle_reply(req, reply).await
                        }
                        NodeMsg::Kv(KVMessage::Invalidate { key, version }) => {
                            directory.handle_invalidate(key, version).await
                        }
                        NodeMsg::Kv(request) => {
                            let directory = directory.clone();
                            tokio::spawn(async move {
                                directory.handle_request(from, request).await
                            });
                        }
                        NodeMsg::Task(task) => engine.handle_msg(from, task).await,
                    }
                }
                Incoming::PeerLost(node) => {
                    warn!("Lost the connection to node {}", node);
                    directory.fail_pending(node).await;
                    engine.peer_lost(node).await;
                }
            }
        }
        info!("Node {} stopped receiving messages", directory.node_id());
    }

    /// The `Directory` of this node
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Waits until the registration `Server` tells the cluster to stop
    pub async fn run(&self) {
        self.kill_notifier.notified().await;
        info!("Node {} is shutting down", self.node_id);
    }

    /// Writes `columns` as a new frame called `name`, chunked as configured
    /// by `rows_per_chunk` and `lossy_float_digits`.
    pub async fn write_frame(
        &self,
        name: &str,
        columns: Vec<NamedColumn>,
    ) -> Result<Key, StoreError> {
        frame::write_frame(&self.directory, name, columns, &self.engine.write_opts).await
    }

    /// Builds a frame called `name` out of existing columns
    pub async fn assemble(
        &self,
        name: &str,
        names: Vec<String>,
        vecs: Vec<Key>,
    ) -> Result<Key, StoreError> {
        frame::assemble(&self.directory, name, names, vecs).await
    }

    /// A new frame holding the rows in `range` of `frame`
    pub async fn slice_rows(&self, frame: &Key, range: Range<usize>) -> Result<Key, StoreError> {
        frame::slice_rows(&self.directory, frame, range).await
    }

    /// A new frame holding the columns `names` of `frame`
    pub async fn slice_cols(&self, frame: &Key, names: &[&str]) -> Result<Key, StoreError> {
        frame::slice_cols(&self.directory, frame, names).await
    }

    pub async fn rename(&self, frame: &Key, name: &str) -> Result<(), StoreError> {
        frame::rename(&self.directory, frame, name).await
    }

    pub async fn rename_column(&self, frame: &Key, old: &str, new: &str) -> Result<(), StoreError> {
        frame::rename_column(&self.directory, frame, old, new).await
    }

    /// Removes `frame`, and with `deep` the columns and chunks no other
    /// frame uses
    pub async fn remove_frame(&self, frame: &Key, deep: bool) -> Result<bool, StoreError> {
        frame::remove_frame(&self.directory, frame, deep).await
    }

    pub async fn read_frame(&self, frame: &Key) -> Result<Vec<NamedColumn>, StoreError> {
        frame::read_frame(&self.directory, frame).await
    }

    pub async fn read_column(&self, frame: &Key, name: &str) -> Result<NamedColumn, StoreError> {
        frame::read_column(&self.directory, frame, name).await
    }

    /// The value at `row` of column `col` of `frame`
    pub async fn get(&self, frame: &Key, col: usize, row: usize) -> Result<Data, StoreError> {
        frame::get(&self.directory, frame, col, row).await
    }

    /// Groups `frame` by the columns `by`, computing `aggs` for each group,
    /// and returns the key of the result. See [`spawn_group_by`] to run it
    /// in the background with the ability to cancel it.
    ///
    /// [`spawn_group_by`]: FluxNode::spawn_group_by
    pub async fn group_by(
        &self,
        frame: &Key,
        by: &[&str],
        aggs: &[Aggregate],
    ) -> Result<Key, StoreError> {
        let job = self.job_key();
        engine::group_by(&self.engine, job, frame, by, aggs, &CancellationToken::new()).await
    }

    /// Starts a group-by in the background
    pub fn spawn_group_by(&self, frame: &Key, by: &[&str], aggs: &[Aggregate]) -> JobHandle {
        self.spawn_group_by_with(frame, by, aggs, CancellationToken::new())
    }

    /// Starts a group-by in the background that stops once `token` is
    /// cancelled
    pub fn spawn_group_by_with(
        &self,
        frame: &Key,
        by: &[&str],
        aggs: &[Aggregate],
        token: CancellationToken,
    ) -> JobHandle {
        let job = self.job_key();
        let engine = self.engine.clone();
        let frame = frame.clone();
        let by: Vec<String> = by.iter().map(|s| s.to_string()).collect();
        let aggs = aggs.to_vec();
        let (job_clone, token_clone) = (job.clone(), token.clone());
        Engine::spawn(job, token, async move {
            let by: Vec<&str> = by.iter().map(|s| s.as_str()).collect();
            engine::group_by(&engine, job_clone, &frame, &by, &aggs, &token_clone).await
        })
    }

    /// Joins `left` and `right` on the columns `on` and returns the key of
    /// the result
    pub async fn merge(
        &self,
        left: &Key,
        right: &Key,
        on: &[&str],
        opts: MergeOptions,
    ) -> Result<Key, StoreError> {
        let job = self.job_key();
        engine::merge(&self.engine, job, left, right, on, &opts, &CancellationToken::new()).await
    }

    /// Starts a merge in the background
    pub fn spawn_merge(
        &self,
        left: &Key,
        right: &Key,
        on: &[&str],
        opts: MergeOptions,
    ) -> JobHandle {
        let job = self.job_key();
        let token = CancellationToken::new();
        let engine = self.engine.clone();
        let (left, right) = (left.clone(), right.clone());
        let on: Vec<String> = on.iter().map(|s| s.to_string()).collect();
        let (job_clone, token_clone) = (job.clone(), token.clone());
        Engine::spawn(job, token, async move {
            let on: Vec<&str> = on.iter().map(|s| s.as_str()).collect();
            engine::merge(&engine, job_clone, &left, &right, &on, &opts, &token_clone).await
        })
    }

    /// A summary of `frame` computed from its metadata
    pub async fn synopsis(&self, frame: &Key) -> Result<Synopsis, StoreError> {
        synopsis::synopsize(&self.directory, frame).await
    }

    /// A summary of every frame in the cluster
    pub async fn list_synopses(&self) -> Result<Vec<Synopsis>, StoreError> {
        synopsis::list(&self.directory).await
    }

    /// The key the result of a new job coordinated by this node is
    /// published under
    fn job_key(&self) -> Key {
        Key::generate("frame", self.node_id, KeyKind::Frame)
    }
}

/// A whole cluster running in this process, connected by a `LocalNetwork`.
/// Must be created from within a `tokio` runtime.
pub struct LocalCluster {
    network: LocalNetwork<NodeMsg>,
    nodes: Vec<FluxNode>,
}

impl LocalCluster {
    /// Starts `num_nodes` nodes, each configured by `config`
    pub fn new(num_nodes: usize, config: NodeConfig) -> Self {
        let network = LocalNetwork::new(num_nodes, config.channel_capacity);
        let nodes = (1..=num_nodes)
            .map(|id| {
                let (transport, receiver) = network.join(id);
                FluxNode::start(
                    Arc::new(transport),
                    receiver,
                    Arc::new(Notify::new()),
                    config.clone(),
                )
            })
            .collect();
        LocalCluster { network, nodes }
    }

    /// The node with the given `id`, starting at `1`
    ///
    /// ## Panics
    /// If there is no node with that id
    pub fn node(&self, id: usize) -> &FluxNode {
        &self.nodes[id - 1]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Disconnects the node `id` from the others, as if its process died
    pub async fn kill(&self, id: usize) {
        self.network.kill(id).await;
        self.nodes[id - 1].kill_notifier.notify_one();
    }
}
