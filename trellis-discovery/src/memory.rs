//! In-memory coordination backend (for testing)

use crate::backend::{
    CoordinationBackend, SessionEvent, WatchEvent, WatchEventKind, WatchSink, child_path, parent_path,
    validate_path,
};
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Vec<u8>>,
    node_watches: HashMap<String, Vec<WatchSink>>,
    child_watches: HashMap<String, Vec<WatchSink>>,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_path(path, "");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect()
    }

    fn fire_node(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(sinks) = self.node_watches.remove(path) {
            deliver(sinks, WatchEvent::new(path, kind));
        }
    }

    fn fire_children(&mut self, path: &str) {
        if let Some(sinks) = self.child_watches.remove(path) {
            deliver(sinks, WatchEvent::new(path, WatchEventKind::ChildrenChanged));
        }
    }

    fn create(&mut self, path: &str, data: Vec<u8>) {
        self.nodes.insert(path.to_string(), data);
        self.fire_node(path, WatchEventKind::NodeCreated);
        if let Some(parent) = parent_path(path) {
            self.fire_children(parent);
        }
    }

    fn write(&mut self, path: &str, data: Vec<u8>) {
        let mut missing = Vec::new();
        let mut cursor = parent_path(path);
        while let Some(parent) = cursor {
            if self.exists(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = parent_path(parent);
        }
        for parent in missing.iter().rev() {
            self.create(parent, Vec::new());
        }

        match self.nodes.get_mut(path) {
            Some(existing) => {
                *existing = data;
                self.fire_node(path, WatchEventKind::NodeDataChanged);
            }
            None => self.create(path, data),
        }
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(DiscoveryError::NotFound(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(DiscoveryError::backend(format!("node has children: {}", path)));
        }

        self.nodes.remove(path);
        self.fire_node(path, WatchEventKind::NodeDeleted);
        if let Some(parent) = parent_path(path) {
            self.fire_children(parent);
        }
        Ok(())
    }
}

fn deliver(sinks: Vec<WatchSink>, event: WatchEvent) {
    for sink in sinks {
        // A dropped receiver just means nobody is listening any more
        let _ = sink.send(event.clone());
    }
}

struct Shared {
    tree: Mutex<Tree>,
    connected: Mutex<bool>,
    session_tx: broadcast::Sender<SessionEvent>,
    reads: AtomicU64,
}

/// In-memory coordination backend (for testing/development).
///
/// Watches are one-shot, as on ZooKeeper. [`disconnect`](Self::disconnect)
/// drops every registered watch and makes all operations fail with
/// [`DiscoveryError::Disconnected`] until [`reconnect`](Self::reconnect).
/// The `*_as_peer` methods mutate the store the way another client would,
/// whatever the state of this session.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    /// Create an empty, connected backend
    pub fn new() -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::default()),
                connected: Mutex::new(true),
                session_tx,
                reads: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate a session loss; registered watches are lost
    pub fn disconnect(&self) {
        *self.shared.connected.lock() = false;
        {
            let mut tree = self.shared.tree.lock();
            tree.node_watches.clear();
            tree.child_watches.clear();
        }
        debug!("In-memory backend disconnected");
        let _ = self.shared.session_tx.send(SessionEvent::Disconnected);
    }

    /// Re-establish the session
    pub fn reconnect(&self) {
        *self.shared.connected.lock() = true;
        debug!("In-memory backend reconnected");
        let _ = self.shared.session_tx.send(SessionEvent::Reconnected);
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.lock()
    }

    /// Write on behalf of another session
    pub fn write_as_peer(&self, path: &str, data: Vec<u8>) -> Result<()> {
        validate_path(path)?;
        self.shared.tree.lock().write(path, data);
        Ok(())
    }

    /// Delete on behalf of another session
    pub fn delete_as_peer(&self, path: &str) -> Result<()> {
        self.shared.tree.lock().delete(path)
    }

    /// Number of pending watch registrations
    pub fn watch_count(&self) -> usize {
        let tree = self.shared.tree.lock();
        tree.node_watches.values().map(Vec::len).sum::<usize>()
            + tree.child_watches.values().map(Vec::len).sum::<usize>()
    }

    /// Number of `read` and `read_children` calls served
    pub fn read_count(&self) -> u64 {
        self.shared.reads.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DiscoveryError::Disconnected)
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryBackend {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        validate_path(path)?;
        self.shared.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.shared.tree.lock().nodes.get(path).cloned())
    }

    async fn read_children(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_connected()?;
        validate_path(path)?;
        self.shared.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.shared.tree.lock().children(path))
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        self.write_as_peer(path, data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        validate_path(path)?;
        self.delete_as_peer(path)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ensure_connected()?;
        validate_path(path)?;
        Ok(self.shared.tree.lock().exists(path))
    }

    async fn watch_node(&self, path: &str, sink: WatchSink) -> Result<()> {
        self.ensure_connected()?;
        validate_path(path)?;
        self.shared
            .tree
            .lock()
            .node_watches
            .entry(path.to_string())
            .or_default()
            .push(sink);
        Ok(())
    }

    async fn watch_children(&self, path: &str, sink: WatchSink) -> Result<()> {
        self.ensure_connected()?;
        validate_path(path)?;
        self.shared
            .tree
            .lock()
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(sink);
        Ok(())
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.session_tx.subscribe()
    }
}

/// Yields before every read and write, the way a network round trip lets
/// other tasks run between a read and the write that follows it.
#[cfg(test)]
pub(crate) struct YieldingBackend(pub InMemoryBackend);

#[cfg(test)]
#[async_trait]
impl CoordinationBackend for YieldingBackend {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        tokio::task::yield_now().await;
        self.0.read(path).await
    }

    async fn read_children(&self, path: &str) -> Result<Vec<String>> {
        self.0.read_children(path).await
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        tokio::task::yield_now().await;
        self.0.write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.0.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.0.exists(path).await
    }

    async fn watch_node(&self, path: &str, sink: WatchSink) -> Result<()> {
        self.0.watch_node(path, sink).await
    }

    async fn watch_children(&self, path: &str, sink: WatchSink) -> Result<()> {
        self.0.watch_children(path, sink).await
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.0.session_events()
    }
}
