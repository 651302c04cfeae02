//! Route table: the live service-id → endpoints map
//!
//! Routes are stored one node per service id under a root path
//! (`/trellis/routes/<service_id>`), each holding a JSON-serialized
//! [`ServiceRoute`]. The table keeps a local copy current through a
//! children watch on the root (routes appearing and disappearing) and a
//! node watch per route (address-set changes). Readers only ever touch the
//! local copy.
//!
//! ```rust,ignore
//! let table = RouteTable::new(backend, RouteTableConfig::default());
//! table.start().await?;
//!
//! let mut events = table.subscribe();
//! if let Some(route) = table.get_route("order.create") {
//!     println!("{:?}", route.addresses());
//! }
//! ```

use crate::backend::{CoordinationBackend, SessionEvent, WatchEvent, WatchEventKind, child_path, node_name};
use crate::error::{DiscoveryError, Result};
use crate::health::EndpointEvictor;
use crate::watch::{WatchCoordinator, WatchEvents};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_core::{EndpointAddress, ServiceRoute, normalize_path};

/// Change notification for one route.
#[derive(Debug, Clone)]
pub enum RouteEvent {
    Created(Arc<ServiceRoute>),
    Changed {
        old: Arc<ServiceRoute>,
        new: Arc<ServiceRoute>,
    },
    Removed(Arc<ServiceRoute>),
}

impl RouteEvent {
    pub fn service_id(&self) -> &str {
        match self {
            RouteEvent::Created(route) | RouteEvent::Removed(route) => route.service_id(),
            RouteEvent::Changed { new, .. } => new.service_id(),
        }
    }
}

/// Route table configuration
#[derive(Debug, Clone)]
pub struct RouteTableConfig {
    /// Parent node of the route nodes
    pub route_root: String,
    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for RouteTableConfig {
    fn default() -> Self {
        Self {
            route_root: "/trellis/routes".to_string(),
            event_capacity: 256,
        }
    }
}

impl RouteTableConfig {
    pub fn new(route_root: impl Into<String>) -> Self {
        Self {
            route_root: route_root.into(),
            ..Default::default()
        }
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// Live view of every published route.
pub struct RouteTable {
    config: RouteTableConfig,
    backend: Arc<dyn CoordinationBackend>,
    routes: DashMap<String, Arc<ServiceRoute>>,
    paths: DashMap<String, String>,
    /// Serializes read-modify-write of one route node, and refreshes of it.
    writers: DashMap<String, Arc<AsyncMutex<()>>>,
    watches: Arc<WatchCoordinator>,
    pending_events: Mutex<Option<WatchEvents>>,
    event_tx: broadcast::Sender<RouteEvent>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RouteTable {
    pub fn new(backend: Arc<dyn CoordinationBackend>, config: RouteTableConfig) -> Arc<Self> {
        let (watches, events) = WatchCoordinator::new(backend.clone());
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            backend,
            routes: DashMap::new(),
            paths: DashMap::new(),
            writers: DashMap::new(),
            watches,
            pending_events: Mutex::new(Some(events)),
            event_tx,
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn route_root(&self) -> &str {
        &self.config.route_root
    }

    /// Every cached route
    pub fn get_routes(&self) -> Vec<Arc<ServiceRoute>> {
        self.routes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cached route for a service id
    pub fn get_route(&self, service_id: &str) -> Option<Arc<ServiceRoute>> {
        self.routes.get(service_id).map(|entry| entry.value().clone())
    }

    /// Cached route whose route path matches, ignoring case and a leading `/`
    pub fn get_route_for_path(&self, path: &str) -> Option<Arc<ServiceRoute>> {
        let service_id = self.paths.get(&normalize_path(path))?.value().clone();
        self.get_route(&service_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Subscribe to route changes
    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.event_tx.subscribe()
    }

    /// Publish the routes this node serves.
    ///
    /// Addresses are merged with whatever other nodes already published for
    /// the same service id.
    pub async fn set_routes(&self, routes: Vec<ServiceRoute>) -> Result<()> {
        for route in routes {
            route
                .descriptor
                .validate()
                .map_err(|e| DiscoveryError::invalid_path(e.to_string()))?;

            let path = self.route_path(route.service_id());
            let writer = self.writer(route.service_id());
            let _guard = writer.lock().await;
            let merged = match self.backend.read(&path).await? {
                Some(bytes) => {
                    let existing = ServiceRoute::from_bytes(&bytes)?;
                    ServiceRoute::new(
                        route.descriptor.clone(),
                        existing.addresses().iter().cloned().chain(route.addresses().iter().cloned()),
                    )
                }
                None => route,
            };

            self.backend.write(&path, merged.to_bytes()?).await?;
            info!(
                service_id = %merged.service_id(),
                endpoints = merged.addresses().len(),
                "Published route"
            );
            self.apply(merged);
        }
        Ok(())
    }

    /// Remove endpoints from every cached route holding them.
    ///
    /// The local copy changes first, so callers stop selecting the
    /// endpoints immediately; the backend write follows.
    pub async fn remove_addresses(&self, addresses: &[EndpointAddress]) -> Result<()> {
        let affected: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| addresses.iter().any(|a| entry.value().contains(a)))
            .map(|entry| entry.key().clone())
            .collect();

        for service_id in &affected {
            self.update(service_id, |current| current.map(|route| route.without(addresses)));
        }

        let mut first_error = None;
        for service_id in affected {
            let path = self.route_path(&service_id);
            let writer = self.writer(&service_id);
            let result: Result<()> = async {
                let _guard = writer.lock().await;
                // Re-read so concurrent publishers are not overwritten
                let current = match self.backend.read(&path).await? {
                    Some(bytes) => ServiceRoute::from_bytes(&bytes)?,
                    None => return Ok(()),
                };
                self.backend
                    .write(&path, current.without(addresses).to_bytes()?)
                    .await
            }
            .await;

            if let Err(err) = result {
                warn!(service_id = %service_id, error = %err, "Failed to write route after removing endpoints");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete every route node under the root
    pub async fn clear(&self) -> Result<()> {
        for child in self.backend.read_children(&self.config.route_root).await? {
            let path = child_path(&self.config.route_root, &child);
            match self.backend.delete(&path).await {
                Ok(()) | Err(DiscoveryError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            self.watches.dispose(&path);
            self.remove_local(&child);
        }
        info!(root = %self.config.route_root, "Cleared routes");
        Ok(())
    }

    /// Read every route, arm the watches and spawn the notification loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(mut events) = self.pending_events.lock().take() else {
            return Err(DiscoveryError::backend("route table already started"));
        };

        let mut session = self.backend.session_events();
        self.reconcile().await?;

        let table = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = events.recv() => table.handle_watch_event(event).await,
                    session_event = session.recv() => match session_event {
                        Ok(event) => table.handle_session_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            table.handle_session_event(SessionEvent::Reconnected).await
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Route notification loop stopped");
        });
        *self.task.lock() = Some(handle);

        info!(root = %self.config.route_root, routes = self.routes.len(), "Route table started");
        Ok(())
    }

    /// Stop the notification loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Full read of the root, synthesizing events for every difference
    /// from the local copy.
    pub async fn reconcile(&self) -> Result<()> {
        let root = self.config.route_root.clone();
        self.watches.arm_children(&root).await?;

        let children: HashSet<String> = self.backend.read_children(&root).await?.into_iter().collect();
        let stale: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| !children.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for service_id in stale {
            self.watches.dispose(&self.route_path(&service_id));
            self.remove_local(&service_id);
        }
        for child in children {
            self.refresh_route(&child).await?;
        }
        Ok(())
    }

    async fn handle_watch_event(&self, event: WatchEvent) {
        let result = match event.kind {
            WatchEventKind::ChildrenChanged => self.refresh_children().await,
            WatchEventKind::NodeDeleted => {
                self.watches.dispose(&event.path);
                self.remove_local(node_name(&event.path));
                self.watches.arm_children(&self.config.route_root).await
            }
            WatchEventKind::NodeCreated | WatchEventKind::NodeDataChanged => {
                self.refresh_route(node_name(&event.path)).await
            }
        };

        if let Err(err) = result {
            warn!(path = %event.path, kind = ?event.kind, error = %err, "Failed to handle route notification");
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {}
            SessionEvent::Disconnected => {
                warn!(routes = self.routes.len(), "Coordination backend disconnected, serving cached routes");
            }
            SessionEvent::Reconnected => {
                info!("Coordination backend reconnected, reconciling routes");
                self.watches.reset();
                if let Err(err) = self.reconcile().await {
                    warn!(error = %err, "Route reconciliation failed");
                }
            }
        }
    }

    async fn refresh_children(&self) -> Result<()> {
        let root = self.config.route_root.clone();
        self.watches.arm_children(&root).await?;

        let children: HashSet<String> = self.backend.read_children(&root).await?.into_iter().collect();
        let known: HashSet<String> = self.routes.iter().map(|entry| entry.key().clone()).collect();

        for gone in known.difference(&children) {
            self.watches.dispose(&self.route_path(gone));
            self.remove_local(gone);
        }
        for added in children.difference(&known) {
            self.refresh_route(added).await?;
        }
        Ok(())
    }

    async fn refresh_route(&self, service_id: &str) -> Result<()> {
        let path = self.route_path(service_id);
        self.watches.arm_node(&path).await?;

        let writer = self.writer(service_id);
        let _guard = writer.lock().await;
        match self.backend.read(&path).await? {
            Some(bytes) => match ServiceRoute::from_bytes(&bytes) {
                Ok(route) => self.apply(route),
                Err(err) => warn!(path = %path, error = %err, "Ignoring unreadable route"),
            },
            None => self.remove_local(service_id),
        }
        Ok(())
    }

    /// Replace the cached route, emitting Created or Changed if it differs.
    fn apply(&self, route: ServiceRoute) {
        let service_id = route.service_id().to_string();
        self.update(&service_id, |_| Some(route));
    }

    /// Derive the cached route from its current value under the entry lock.
    /// `f` returning `None` leaves the entry alone.
    fn update<F>(&self, service_id: &str, f: F)
    where
        F: FnOnce(Option<&ServiceRoute>) -> Option<ServiceRoute>,
    {
        match self.routes.entry(service_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let Some(next) = f(Some(occupied.get().as_ref())) else {
                    return;
                };
                if **occupied.get() == next {
                    return;
                }
                let route = Arc::new(next);
                let old = occupied.insert(route.clone());
                self.publish_change(Some(old), route);
            }
            Entry::Vacant(vacant) => {
                let Some(next) = f(None) else {
                    return;
                };
                let route = Arc::new(next);
                vacant.insert(route.clone());
                self.publish_change(None, route);
            }
        }
    }

    /// Index the new route path and notify subscribers. Runs while the
    /// route's entry is still locked, so events follow the order of updates.
    fn publish_change(&self, previous: Option<Arc<ServiceRoute>>, route: Arc<ServiceRoute>) {
        let service_id = route.service_id();
        let new_path = route.descriptor.normalized_path();
        if let Some(old) = &previous {
            let old_path = old.descriptor.normalized_path();
            if old_path != new_path {
                self.paths.remove_if(&old_path, |_, id| id == service_id);
            }
        }
        if !new_path.is_empty() {
            self.paths.insert(new_path, service_id.to_string());
        }

        let event = match previous {
            Some(old) => {
                debug!(service_id = %service_id, endpoints = route.addresses().len(), "Route changed");
                RouteEvent::Changed { old, new: route }
            }
            None => {
                debug!(service_id = %service_id, endpoints = route.addresses().len(), "Route created");
                RouteEvent::Created(route)
            }
        };
        let _ = self.event_tx.send(event);
    }

    fn remove_local(&self, service_id: &str) {
        if let Some((_, route)) = self.routes.remove(service_id) {
            self.paths
                .remove_if(&route.descriptor.normalized_path(), |_, id| id == service_id);
            debug!(service_id = %service_id, "Route removed");
            let _ = self.event_tx.send(RouteEvent::Removed(route));
        }
    }

    fn writer(&self, service_id: &str) -> Arc<AsyncMutex<()>> {
        self.writers.entry(service_id.to_string()).or_default().clone()
    }

    fn route_path(&self, service_id: &str) -> String {
        child_path(&self.config.route_root, service_id)
    }
}

#[async_trait]
impl EndpointEvictor for RouteTable {
    async fn evict(&self, endpoint: &EndpointAddress) -> Result<()> {
        self.remove_addresses(std::slice::from_ref(endpoint)).await
    }
}
