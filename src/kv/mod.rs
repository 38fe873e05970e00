//! A module for the distributed, versioned `Key`, `Value` `Directory` that
//! holds every `Frame`, `Vector` and `Chunk` of a `fluxframe` cluster in
//! memory.
//!
//! A `Directory` runs on every node. Each `Key` has a fixed home node and
//! only the `Directory` on that node holds the committed value and accepts
//! writes for it; every other node routes its requests there using the
//! `network` layer and `KVMessage`s.
//!
//! ## Provided `Directory` Functionality
//! - `get`: Retrieve the latest committed value, from this node's store, its
//!    cache or over the network from the home node
//! - `put`: Optimistically store a value, given the version the caller last
//!    observed. A stale version fails with `VersionConflict` and the caller
//!    must re-read and retry, `update` does exactly that
//! - `remove`: Remove a key from its home node
//! - `local_keys` / `cluster_keys`: enumerate keys of a given kind
//!
//! ## Caching
//!
//! Values read from other nodes are kept in a least-recently used cache,
//! bounded both by a number of entries and by their in-memory size. The home
//! node remembers which nodes read each of its keys and tells them to drop
//! their copy whenever the key's version is bumped or the key is removed.
//! A reply and an invalidation of the same key may overtake each other, so
//! the cache remembers the newest invalidated version of every key it is
//! still waiting on and never stores a reply older than that.
use crate::chunk::Chunk;
use crate::error::{RemoteError, StoreError};
use crate::frame::{Frame, Vector};
use crate::network::Transport;
use crate::node::NodeMsg;
use deepsize::DeepSizeOf;
use lru::LruCache;
use rand::{self, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

mod directory;

/// The kind of object a `Key` refers to
#[derive(
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    DeepSizeOf,
)]
pub enum KeyKind {
    Frame,
    Vec,
    Chunk,
}

/// A `Key` uniquely identifies a value in the `Directory`, as well as which
/// node 'owns' the value
#[derive(
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    DeepSizeOf,
)]
pub struct Key {
    /// The name of the value, unique within the cluster
    pub name: String,
    /// The id of the node that 'owns' the associated value
    pub home: usize,
    /// The kind of object stored under this key
    pub kind: KeyKind,
}

impl Key {
    /// Creates a new `Key` that is owned by the node with the id `home`.
    pub fn new(name: &str, home: usize, kind: KeyKind) -> Self {
        Key {
            name: String::from(name),
            home,
            kind,
        }
    }

    /// Make a key with an automatically generated, random name that starts
    /// with `prefix`
    pub(crate) fn generate(prefix: &str, home: usize, kind: KeyKind) -> Self {
        let mut rng = rand::thread_rng();
        Key {
            name: format!("{}-{:016x}", prefix, rng.gen::<u64>()),
            home,
            kind,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            KeyKind::Frame => "frame",
            KeyKind::Vec => "vec",
            KeyKind::Chunk => "chunk",
        };
        write!(f, "{}:{}@{}", kind, self.name, self.home)
    }
}

/// A serialized `Object`, used to send values between nodes
pub type Value = Vec<u8>;

/// An object stored in the `Directory`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Object {
    Frame(Arc<Frame>),
    Vector(Arc<Vector>),
    Chunk(Arc<Chunk>),
}

impl Object {
    /// The kind of `Key` this object may be stored under
    pub fn kind(&self) -> KeyKind {
        match self {
            Object::Frame(_) => KeyKind::Frame,
            Object::Vector(_) => KeyKind::Vec,
            Object::Chunk(_) => KeyKind::Chunk,
        }
    }

    pub(crate) fn into_frame(self, key: &Key) -> Result<Arc<Frame>, StoreError> {
        match self {
            Object::Frame(f) => Ok(f),
            other => Err(wrong_kind(key, KeyKind::Frame, other.kind())),
        }
    }

    pub(crate) fn into_vector(
        self,
        key: &Key,
    ) -> Result<Arc<Vector>, StoreError> {
        match self {
            Object::Vector(v) => Ok(v),
            other => Err(wrong_kind(key, KeyKind::Vec, other.kind())),
        }
    }

    pub(crate) fn into_chunk(self, key: &Key) -> Result<Arc<Chunk>, StoreError> {
        match self {
            Object::Chunk(c) => Ok(c),
            other => Err(wrong_kind(key, KeyKind::Chunk, other.kind())),
        }
    }
}

fn wrong_kind(key: &Key, wanted: KeyKind, found: KeyKind) -> StoreError {
    StoreError::schema(
        "directory",
        format!("{} holds a {:?}, expected a {:?}", key, found, wanted),
    )
}

impl DeepSizeOf for Object {
    fn deep_size_of_children(&self, context: &mut deepsize::Context) -> usize {
        match self {
            Object::Frame(f) => f.as_ref().deep_size_of_children(context),
            Object::Vector(v) => v.as_ref().deep_size_of_children(context),
            Object::Chunk(c) => c.as_ref().deep_size_of_children(context),
        }
    }
}

/// A value together with the version it was committed at. Version `0` is
/// the version of a key that does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// A `Directory` is one node's part of the distributed key-value store. It
/// is an explicit service object: every component that needs to resolve keys
/// is handed an `Arc<Directory>`.
pub struct Directory {
    /// The `id` of the node this `Directory` is running on
    pub(crate) id: usize,
    /// The number of nodes in the cluster
    pub(crate) num_nodes: usize,
    /// The committed objects whose home is this node
    data: RwLock<HashMap<Key, Entry>>,
    /// Objects owned by other nodes that were read recently
    cache: Mutex<Cache>,
    /// For each key owned by this node, the other nodes that may hold a
    /// cached copy of it
    readers: Mutex<HashMap<Key, HashSet<usize>>>,
    /// The `network` layer, used to send requests to other `Directory`s
    network: Arc<dyn Transport<NodeMsg>>,
    /// Requests sent to other nodes that have not been answered yet
    pending: Mutex<HashMap<u64, Pending>>,
    next_req: AtomicU64,
    request_timeout: Duration,
}

#[derive(Debug)]
struct Entry {
    version: u64,
    object: Object,
}

/// A request waiting for its reply
struct Pending {
    target: usize,
    key: Option<Key>,
    sender: oneshot::Sender<Result<Resolved, StoreError>>,
}

/// A reply after the message loop has processed it
enum Resolved {
    Object(Versioned<Object>),
    Reply(Reply),
}

struct Cache {
    values: LruCache<Key, (Versioned<Object>, usize)>,
    bytes: usize,
    max_bytes: usize,
    /// The newest version announced by an `Invalidate` for keys with a `Get`
    /// in flight, replies older than this are not cached
    invalidated: HashMap<Key, u64>,
}

/// Represents the kind of messages that can be sent between distributed
/// `Directory`s
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KVMessage {
    /// Request the latest committed value of `key` from its home node
    Get { req: u64, key: Key },
    /// Ask the home node of `key` to commit `value` if the key is still at
    /// version `expected`
    Put {
        req: u64,
        key: Key,
        value: Value,
        expected: u64,
    },
    /// Ask the home node of `key` to remove it
    Remove { req: u64, key: Key },
    /// Request every key of a kind owned by the receiver
    ListKeys { req: u64, kind: KeyKind },
    /// The answer to one of the requests above
    Reply { req: u64, reply: Reply },
    /// Tells a node that read `key` that it is now at `version` (or removed)
    /// and that its cached copy must be dropped
    Invalidate { key: Key, version: u64 },
}

/// The body of a `KVMessage::Reply`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    Data { version: u64, value: Value },
    Missing,
    Committed { version: u64 },
    Removed { existed: bool },
    Keys(Vec<Key>),
    Failed(RemoteError),
}
