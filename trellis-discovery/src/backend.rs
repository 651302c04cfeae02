//! Coordination backend abstraction
//!
//! A tree-structured store with one-shot watches and a session, in the
//! shape of ZooKeeper. Nodes are addressed by absolute `/`-separated paths.

use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// What a watch registration observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchKind {
    /// Data of one node (also fires on creation and deletion).
    Node,
    /// The child list of one node.
    Children,
}

/// What happened at a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    ChildrenChanged,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<String>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// The registration kind this event consumes.
    pub fn watch_kind(&self) -> WatchKind {
        match self.kind {
            WatchEventKind::ChildrenChanged => WatchKind::Children,
            _ => WatchKind::Node,
        }
    }
}

/// Where fired watches are delivered.
pub type WatchSink = mpsc::UnboundedSender<WatchEvent>;

/// Session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Reconnected,
}

/// Tree-structured coordination store.
///
/// Watches are one-shot: each registration delivers at most one event and
/// must be re-armed afterwards. Registrations do not survive a session
/// loss.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Data stored at `path`, `None` if the node does not exist.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Child names (not full paths) of `path`; empty if it does not exist.
    async fn read_children(&self, path: &str) -> Result<Vec<String>>;

    /// Create or overwrite `path`, creating missing parents.
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Delete a leaf node.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether `path` exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// One-shot watch on the node at `path`, which need not exist yet.
    async fn watch_node(&self, path: &str, sink: WatchSink) -> Result<()>;

    /// One-shot watch on the children of `path`.
    async fn watch_children(&self, path: &str, sink: WatchSink) -> Result<()>;

    /// Subscribe to session lifecycle events.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Check that `path` is absolute, has no empty segments and no trailing `/`.
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(DiscoveryError::invalid_path(path));
    }
    Ok(())
}

/// `root` + `/` + `child`.
pub fn child_path(root: &str, child: &str) -> String {
    if root.ends_with('/') {
        format!("{}{}", root, child)
    } else {
        format!("{}/{}", root, child)
    }
}

/// Parent path of `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Last segment of `path`.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/trellis/routes").is_ok());
        assert!(validate_path("trellis").is_err());
        assert!(validate_path("/trellis/").is_err());
        assert!(validate_path("/trellis//routes").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(child_path("/trellis/routes", "user.get"), "/trellis/routes/user.get");
        assert_eq!(child_path("/", "a"), "/a");

        assert_eq!(parent_path("/trellis/routes/a"), Some("/trellis/routes"));
        assert_eq!(parent_path("/trellis"), Some("/"));
        assert_eq!(parent_path("/"), None);

        assert_eq!(node_name("/trellis/routes/user.get"), "user.get");
    }

    #[test]
    fn test_event_watch_kind() {
        let event = WatchEvent::new("/a", WatchEventKind::ChildrenChanged);
        assert_eq!(event.watch_kind(), WatchKind::Children);

        let event = WatchEvent::new("/a", WatchEventKind::NodeDeleted);
        assert_eq!(event.watch_kind(), WatchKind::Node);
    }
}
