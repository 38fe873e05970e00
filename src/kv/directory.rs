//! The `Directory`
use crate::chunk::Chunk;
use crate::error::{RemoteError, StoreError};
use crate::frame::{Frame, Vector};
use crate::kv::{
    Cache, Directory, Entry, KVMessage, Key, KeyKind, Object, Pending, Reply,
    Resolved, Versioned,
};
use crate::network::Transport;
use crate::node::NodeMsg;
use bincode::{deserialize, serialize};
use deepsize::DeepSizeOf;
use futures::future;
use log::{debug, error, info, warn};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

impl Directory {
    /// Creates a new `Directory` for the node `network.id()`.
    ///
    /// ## Parameters
    /// - `network`: the transport used to talk to the `Directory`s of the
    ///    other nodes
    /// - `cache_entries`: the largest number of remote values kept in the
    ///    cache
    /// - `cache_bytes`: the total amount of memory (in bytes) the cache is
    ///    allowed to use
    /// - `request_timeout`: how long to wait for another node to answer a
    ///    request before treating it as unavailable
    pub fn new(
        network: Arc<dyn Transport<NodeMsg>>,
        cache_entries: usize,
        cache_bytes: usize,
        request_timeout: Duration,
    ) -> Self {
        let cap = NonZeroUsize::new(cache_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        info!(
            "Directory on node {} has a max cache size of {} bytes",
            network.id(),
            cache_bytes
        );
        Directory {
            id: network.id(),
            num_nodes: network.num_nodes(),
            data: RwLock::new(HashMap::new()),
            cache: Mutex::new(Cache {
                values: LruCache::new(cap),
                bytes: 0,
                max_bytes: cache_bytes,
                invalidated: HashMap::new(),
            }),
            readers: Mutex::new(HashMap::new()),
            network,
            pending: Mutex::new(HashMap::new()),
            next_req: AtomicU64::new(0),
            request_timeout,
        }
    }

    /// The id of the node this `Directory` runs on
    pub fn node_id(&self) -> usize {
        self.id
    }

    /// The number of nodes in the cluster
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Get the latest committed value for the given `key`. If the key belongs
    /// to a different node and is not cached, it is requested from that node
    /// and `await`ing this method waits until it responds.
    ///
    /// ## Errors
    /// - `NotFound` if the key does not exist
    /// - `NodeUnavailable` if the home node of the key can not be reached
    pub async fn get(&self, key: &Key) -> Result<Versioned<Object>, StoreError> {
        if key.home == self.id {
            return self.get_local(key).await;
        }
        if let Some(cached) = self.cache_get(key).await {
            return Ok(cached);
        }
        self.get_remote(key).await
    }

    /// Like `get` but never answers from the cache.
    pub async fn get_fresh(
        &self,
        key: &Key,
    ) -> Result<Versioned<Object>, StoreError> {
        if key.home == self.id {
            self.get_local(key).await
        } else {
            self.get_remote(key).await
        }
    }

    /// Gets the `Frame` stored under `key`
    pub async fn get_frame(&self, key: &Key) -> Result<Arc<Frame>, StoreError> {
        self.get(key).await?.value.into_frame(key)
    }

    /// Gets the `Vector` stored under `key`
    pub async fn get_vector(
        &self,
        key: &Key,
    ) -> Result<Arc<Vector>, StoreError> {
        self.get(key).await?.value.into_vector(key)
    }

    /// Gets the `Chunk` stored under `key`
    pub async fn get_chunk(&self, key: &Key) -> Result<Arc<Chunk>, StoreError> {
        self.get(key).await?.value.into_chunk(key)
    }

    /// Stores `object` under `key` if the key is still at the `expected`
    /// version (`0` to create a key that must not exist yet), and returns
    /// the new version. Only the home node of `key` commits the write, if
    /// that is another node the write is routed to it.
    ///
    /// ## Errors
    /// - `VersionConflict` if another write got there first
    /// - `NodeUnavailable` if the home node of the key can not be reached
    pub async fn put(
        &self,
        key: &Key,
        object: Object,
        expected: u64,
    ) -> Result<u64, StoreError> {
        if object.kind() != key.kind {
            return Err(StoreError::schema(
                "put",
                format!("can not store a {:?} under {}", object.kind(), key),
            ));
        }
        if key.home == self.id {
            return self.put_local(key, object, expected).await;
        }
        let value = serialize(&object)?;
        let reply = self
            .request(key.home, None, "put", |req| KVMessage::Put {
                req,
                key: key.clone(),
                value,
                expected,
            })
            .await?;
        // our own copy, if any, is stale now
        self.cache_remove(key).await;
        match reply {
            Resolved::Reply(Reply::Committed { version }) => Ok(version),
            Resolved::Reply(Reply::Failed(e)) => Err(e.into_store_error(key.home)),
            _ => Err(StoreError::UnexpectedMessage),
        }
    }

    /// Reads `key`, applies `f` to the value and writes the result back,
    /// re-reading and re-applying `f` until no other writer interferes.
    pub async fn update<F>(
        &self,
        key: &Key,
        mut f: F,
    ) -> Result<Versioned<Object>, StoreError>
    where
        F: FnMut(&Object) -> Result<Object, StoreError>,
    {
        loop {
            let current = self.get_fresh(key).await?;
            let next = f(&current.value)?;
            match self.put(key, next.clone(), current.version).await {
                Ok(version) => {
                    return Ok(Versioned {
                        version,
                        value: next,
                    })
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!("Version conflict on {}, retrying", key);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes `key` from its home node. Returns whether the key existed.
    pub async fn remove(&self, key: &Key) -> Result<bool, StoreError> {
        if key.home == self.id {
            return Ok(self.remove_local(key).await);
        }
        let reply = self
            .request(key.home, None, "remove", |req| KVMessage::Remove {
                req,
                key: key.clone(),
            })
            .await?;
        self.cache_remove(key).await;
        match reply {
            Resolved::Reply(Reply::Removed { existed }) => Ok(existed),
            Resolved::Reply(Reply::Failed(e)) => Err(e.into_store_error(key.home)),
            _ => Err(StoreError::UnexpectedMessage),
        }
    }

    /// Every key of the given `kind` whose home is this node
    pub async fn local_keys(&self, kind: KeyKind) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .data
            .read()
            .await
            .keys()
            .filter(|k| k.kind == kind)
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Every key of the given `kind` in the cluster, sorted.
    pub async fn cluster_keys(
        &self,
        kind: KeyKind,
    ) -> Result<Vec<Key>, StoreError> {
        let requests = (1..=self.num_nodes).filter(|n| *n != self.id).map(|n| {
            self.request(n, None, "list keys", move |req| KVMessage::ListKeys {
                req,
                kind,
            })
        });
        let replies = future::try_join_all(requests).await?;
        let mut keys = self.local_keys(kind).await;
        for reply in replies {
            match reply {
                Resolved::Reply(Reply::Keys(k)) => keys.extend(k),
                _ => return Err(StoreError::UnexpectedMessage),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// The number of bytes of remote values currently cached
    pub async fn cached_bytes(&self) -> usize {
        self.cache.lock().await.bytes
    }

    /// Answers a request from the node `from`. Called by the message loop in
    /// its own task, since a request may have to wait on locks.
    pub(crate) async fn handle_request(&self, from: usize, msg: KVMessage) {
        let (req, reply) = match msg {
            KVMessage::Get { req, key } => (req, self.answer_get(from, &key).await),
            KVMessage::Put {
                req,
                key,
                value,
                expected,
            } => (req, self.answer_put(&key, &value, expected).await),
            KVMessage::Remove { req, key } => {
                let reply = if key.home == self.id {
                    Reply::Removed {
                        existed: self.remove_local(&key).await,
                    }
                } else {
                    not_home(self.id, &key)
                };
                (req, reply)
            }
            KVMessage::ListKeys { req, kind } => {
                (req, Reply::Keys(self.local_keys(kind).await))
            }
            other => {
                warn!("Directory got a non-request message {:?}", other);
                return;
            }
        };
        let response = NodeMsg::Kv(KVMessage::Reply { req, reply });
        if let Err(e) = self.network.send_msg(from, response).await {
            error!("Could not reply to node {}: {}", from, e);
        }
    }

    /// Completes the request `req` with its `reply`. Called directly by the
    /// message loop so that replies and invalidations are applied in the
    /// order they were received.
    pub(crate) async fn handle_reply(&self, req: u64, reply: Reply) {
        let pending = match self.pending.lock().await.remove(&req) {
            Some(p) => p,
            None => {
                debug!("Dropping reply to unknown or expired request {}", req);
                return;
            }
        };
        let resolved = match (reply, pending.key) {
            (Reply::Data { version, value }, Some(key)) => {
                match deserialize::<Object>(&value) {
                    Ok(object) => {
                        let v = Versioned { version, value: object };
                        self.cache_reply(key, v.clone()).await;
                        Ok(Resolved::Object(v))
                    }
                    Err(e) => Err(StoreError::from(e)),
                }
            }
            (reply, _) => Ok(Resolved::Reply(reply)),
        };
        // the requester may have timed out and gone away
        let _ = pending.sender.send(resolved);
    }

    /// Drops the cached copy of `key` if it is older than `version`. If a
    /// `Get` of `key` is in flight its reply may still be older, so the
    /// version is remembered until that reply is in.
    pub(crate) async fn handle_invalidate(&self, key: Key, version: u64) {
        let in_flight = self
            .pending
            .lock()
            .await
            .values()
            .any(|p| p.key.as_ref() == Some(&key));
        let mut cache = self.cache.lock().await;
        if in_flight {
            let mark = cache.invalidated.entry(key.clone()).or_insert(0);
            *mark = (*mark).max(version);
        }
        let stale = match cache.values.peek(&key) {
            Some((v, _)) => v.version < version,
            None => false,
        };
        if stale {
            debug!("Invalidated cached {} (now at version {})", key, version);
            if let Some((_, size)) = cache.values.pop(&key) {
                cache.bytes -= size;
            }
        }
    }

    /// Fails every request waiting on `node`, which was lost.
    pub(crate) async fn fail_pending(&self, node: usize) {
        let lost: Vec<Pending> = {
            let mut pending = self.pending.lock().await;
            let reqs: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.target == node)
                .map(|(r, _)| *r)
                .collect();
            reqs.into_iter().filter_map(|r| pending.remove(&r)).collect()
        };
        for p in lost {
            let _ = p
                .sender
                .send(Err(StoreError::unavailable(node, "directory request")));
        }
        // we will never hear from it again, including invalidations
        self.readers.lock().await.values_mut().for_each(|r| {
            r.remove(&node);
        });
        let mut cache = self.cache.lock().await;
        cache.invalidated.retain(|k, _| k.home != node);
        let keys: Vec<Key> = cache
            .values
            .iter()
            .filter(|(k, _)| k.home == node)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            if let Some((_, size)) = cache.values.pop(&k) {
                cache.bytes -= size;
            }
        }
    }

    async fn get_local(&self, key: &Key) -> Result<Versioned<Object>, StoreError> {
        match self.data.read().await.get(key) {
            Some(entry) => Ok(Versioned {
                version: entry.version,
                value: entry.object.clone(),
            }),
            None => Err(StoreError::NotFound { key: key.clone() }),
        }
    }

    async fn get_remote(
        &self,
        key: &Key,
    ) -> Result<Versioned<Object>, StoreError> {
        let reply = self
            .request(key.home, Some(key.clone()), "get", |req| KVMessage::Get {
                req,
                key: key.clone(),
            })
            .await?;
        match reply {
            Resolved::Object(v) => Ok(v),
            Resolved::Reply(Reply::Missing) => {
                Err(StoreError::NotFound { key: key.clone() })
            }
            Resolved::Reply(Reply::Failed(e)) => Err(e.into_store_error(key.home)),
            Resolved::Reply(_) => Err(StoreError::UnexpectedMessage),
        }
    }

    async fn put_local(
        &self,
        key: &Key,
        object: Object,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let (version, readers) = {
            let mut data = self.data.write().await;
            let actual = data.get(key).map(|e| e.version).unwrap_or(0);
            if actual != expected {
                return Err(StoreError::VersionConflict {
                    key: key.clone(),
                    expected,
                    actual,
                });
            }
            let version = actual + 1;
            data.insert(key.clone(), Entry { version, object });
            // collected while holding the write lock so that a concurrent
            // `Get` either sees the new version or is invalidated
            let readers = self.readers.lock().await.remove(key).unwrap_or_default();
            (version, readers)
        };
        debug!("Put {} at version {}", key, version);
        self.invalidate(key, version, readers).await;
        Ok(version)
    }

    async fn remove_local(&self, key: &Key) -> bool {
        let (removed, readers) = {
            let mut data = self.data.write().await;
            let removed = data.remove(key);
            let readers = self.readers.lock().await.remove(key).unwrap_or_default();
            (removed, readers)
        };
        match removed {
            Some(entry) => {
                debug!("Removed {} at version {}", key, entry.version);
                self.invalidate(key, entry.version + 1, readers).await;
                true
            }
            None => false,
        }
    }

    async fn invalidate(&self, key: &Key, version: u64, readers: HashSet<usize>) {
        for node in readers {
            let msg = NodeMsg::Kv(KVMessage::Invalidate {
                key: key.clone(),
                version,
            });
            if let Err(e) = self.network.send_msg(node, msg).await {
                warn!("Could not invalidate {} on node {}: {}", key, node, e);
            }
        }
    }

    async fn answer_get(&self, from: usize, key: &Key) -> Reply {
        if key.home != self.id {
            return not_home(self.id, key);
        }
        let found = {
            let data = self.data.read().await;
            match data.get(key) {
                Some(entry) => {
                    self.readers
                        .lock()
                        .await
                        .entry(key.clone())
                        .or_insert_with(HashSet::new)
                        .insert(from);
                    Some((entry.version, serialize(&entry.object)))
                }
                None => None,
            }
        };
        match found {
            Some((version, Ok(value))) => Reply::Data { version, value },
            Some((_, Err(e))) => Reply::Failed(RemoteError::from(&StoreError::from(e))),
            None => Reply::Missing,
        }
    }

    async fn answer_put(&self, key: &Key, value: &[u8], expected: u64) -> Reply {
        if key.home != self.id {
            return not_home(self.id, key);
        }
        let result = match deserialize::<Object>(value) {
            Ok(object) => self.put_local(key, object, expected).await,
            Err(e) => Err(StoreError::from(e)),
        };
        match result {
            Ok(version) => Reply::Committed { version },
            Err(e) => Reply::Failed(RemoteError::from(&e)),
        }
    }

    /// Sends the request built by `body` to `target` and waits for its reply.
    async fn request<F>(
        &self,
        target: usize,
        key: Option<Key>,
        op: &str,
        body: F,
    ) -> Result<Resolved, StoreError>
    where
        F: FnOnce(u64) -> KVMessage,
    {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let watched = key.clone();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(
            req,
            Pending {
                target,
                key,
                sender,
            },
        );
        if let Err(e) = self.network.send_msg(target, NodeMsg::Kv(body(req))).await {
            self.pending.lock().await.remove(&req);
            return Err(e);
        }
        match tokio::time::timeout(self.request_timeout, receiver).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(_)) => Err(StoreError::unavailable(target, op)),
            Err(_) => {
                let waiting = {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&req);
                    pending.values().any(|p| p.key.is_some() && p.key == watched)
                };
                if let (Some(k), false) = (&watched, waiting) {
                    self.cache.lock().await.invalidated.remove(k);
                }
                warn!("{} request {} to node {} timed out", op, req, target);
                Err(StoreError::unavailable(target, op))
            }
        }
    }

    /// Caches a value read from the home node unless an invalidation newer
    /// than it was already received.
    async fn cache_reply(&self, key: Key, value: Versioned<Object>) {
        let waiting = self
            .pending
            .lock()
            .await
            .values()
            .any(|p| p.key.as_ref() == Some(&key));
        let superseded = {
            let mut cache = self.cache.lock().await;
            let mark = if waiting {
                cache.invalidated.get(&key).copied()
            } else {
                cache.invalidated.remove(&key)
            };
            mark.map_or(false, |m| value.version < m)
        };
        if superseded {
            debug!(
                "Not caching {} at version {}, it was invalidated already",
                key, value.version
            );
            return;
        }
        self.cache_put(key, value).await;
    }

    async fn cache_get(&self, key: &Key) -> Option<Versioned<Object>> {
        self.cache.lock().await.values.get(key).map(|(v, _)| v.clone())
    }

    async fn cache_remove(&self, key: &Key) {
        let mut cache = self.cache.lock().await;
        if let Some((_, size)) = cache.values.pop(key) {
            cache.bytes -= size;
        }
    }

    async fn cache_put(&self, key: Key, value: Versioned<Object>) {
        let size = value.value.deep_size_of();
        let mut cache = self.cache.lock().await;
        if size > cache.max_bytes {
            info!(
                "Not caching {} of size {} bytes, larger than the cache",
                key, size
            );
            return;
        }
        if let Some((_, old)) = cache.values.pop(&key) {
            cache.bytes -= old;
        }
        while cache.bytes + size > cache.max_bytes {
            match cache.values.pop_lru() {
                Some((k, (_, popped))) => {
                    debug!("Evicted cached {} of size {} bytes", k, popped);
                    cache.bytes -= popped;
                }
                None => break,
            }
        }
        // `push` evicts the least recently used entry when full
        if let Some((k, (_, evicted))) = cache.values.push(key.clone(), (value, size)) {
            if k != key {
                cache.bytes -= evicted;
            }
        }
        cache.bytes += size;
    }
}

fn not_home(id: usize, key: &Key) -> Reply {
    warn!("Node {} was asked about {} which it is not the home of", id, key);
    Reply::Failed(RemoteError::NotHome(key.clone()))
}
