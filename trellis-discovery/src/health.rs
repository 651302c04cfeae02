//! Endpoint health monitoring
//!
//! The [`HealthMonitor`] probes every tracked endpoint on a timer. A
//! success resets the endpoint's failure streak; a failure extends it and
//! marks the endpoint unhealthy. Once the streak reaches the eviction
//! threshold the endpoint is removed from every route (through an
//! [`EndpointEvictor`], normally the [`RouteTable`]) and forgotten.
//!
//! ```rust,ignore
//! let monitor = HealthMonitor::new(HealthMonitorConfig::default(), Arc::new(TcpProbe::default()));
//! monitor.attach(&route_table);
//! monitor.start();
//! ```

use crate::error::Result;
use crate::route_table::{RouteEvent, RouteTable};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_core::{EndpointAddress, ServiceRoute};

/// Checks whether an endpoint is reachable.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &EndpointAddress) -> bool;
}

/// Removes an endpoint from every route that lists it.
#[async_trait]
pub trait EndpointEvictor: Send + Sync {
    async fn evict(&self, endpoint: &EndpointAddress) -> Result<()>;
}

/// Opens a TCP connection and closes it again.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, endpoint: &EndpointAddress) -> bool {
        let connect = TcpStream::connect((endpoint.dial_host(), endpoint.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                debug!(endpoint = %endpoint, error = %err, "TCP probe failed");
                false
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "TCP probe timed out");
                false
            }
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Time between probe cycles
    pub probe_interval: Duration,
    /// Deadline for a single probe
    pub probe_timeout: Duration,
    /// Consecutive failures that evict an endpoint
    pub eviction_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            eviction_threshold: 6,
        }
    }
}

impl HealthMonitorConfig {
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn eviction_threshold(mut self, threshold: u32) -> Self {
        self.eviction_threshold = threshold.max(1);
        self
    }
}

/// Tracking state for one endpoint.
#[derive(Debug)]
pub struct MonitorEntry {
    endpoint: EndpointAddress,
    healthy: AtomicBool,
    failures: AtomicU32,
    probing: AtomicBool,
    service_ids: Mutex<BTreeSet<String>>,
}

impl MonitorEntry {
    fn new(endpoint: EndpointAddress, healthy: bool) -> Self {
        Self {
            endpoint,
            healthy: AtomicBool::new(healthy),
            failures: AtomicU32::new(0),
            probing: AtomicBool::new(false),
            service_ids: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn endpoint(&self) -> &EndpointAddress {
        &self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
}

/// Point-in-time health of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointHealth {
    pub endpoint: EndpointAddress,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub service_ids: Vec<String>,
}

/// Periodically probes endpoints and evicts the persistently failing ones.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    probe: Arc<dyn HealthProbe>,
    entries: DashMap<EndpointAddress, Arc<MonitorEntry>>,
    evictor: RwLock<Option<Arc<dyn EndpointEvictor>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, probe: Arc<dyn HealthProbe>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            probe,
            entries: DashMap::new(),
            evictor: RwLock::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Install the target that evicted endpoints are removed from
    pub fn set_evictor(&self, evictor: Arc<dyn EndpointEvictor>) {
        *self.evictor.write() = Some(evictor);
    }

    /// Start tracking `endpoint` on behalf of `service_id`. Idempotent.
    pub fn monitor(&self, endpoint: &EndpointAddress, service_id: &str) {
        let entry = self
            .entries
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!(endpoint = %endpoint, "Monitoring endpoint");
                Arc::new(MonitorEntry::new(endpoint.clone(), true))
            })
            .clone();
        entry.service_ids.lock().insert(service_id.to_string());
    }

    /// Stop tracking `endpoint` for `service_id`; the entry goes once no
    /// service references it.
    pub fn release(&self, endpoint: &EndpointAddress, service_id: &str) {
        let removed = self.entries.remove_if(endpoint, |_, entry| {
            let mut ids = entry.service_ids.lock();
            ids.remove(service_id);
            ids.is_empty()
        });
        if removed.is_some() {
            debug!(endpoint = %endpoint, "Stopped monitoring endpoint");
        }
    }

    /// Cached health of a tracked endpoint; untracked endpoints are probed
    /// once and the result is cached.
    pub async fn is_healthy(&self, endpoint: &EndpointAddress) -> bool {
        if let Some(entry) = self.entries.get(endpoint) {
            return entry.is_healthy();
        }

        let healthy = self.probe_with_timeout(endpoint).await;
        let entry = self
            .entries
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(MonitorEntry::new(endpoint.clone(), healthy)))
            .clone();
        entry.is_healthy()
    }

    /// Force an endpoint unhealthy after a failed call. The failure streak
    /// is left to the prober.
    pub fn mark_failure(&self, endpoint: &EndpointAddress) {
        let entry = self
            .entries
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(MonitorEntry::new(endpoint.clone(), false)))
            .clone();
        if entry.healthy.swap(false, Ordering::AcqRel) {
            info!(endpoint = %endpoint, "Endpoint marked unhealthy");
        }
    }

    pub fn is_tracked(&self, endpoint: &EndpointAddress) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, endpoint: &EndpointAddress) -> Option<Arc<MonitorEntry>> {
        self.entries.get(endpoint).map(|e| e.value().clone())
    }

    /// Health of every tracked endpoint, ordered by endpoint
    pub fn snapshot(&self) -> Vec<EndpointHealth> {
        let mut health: Vec<EndpointHealth> = self
            .entries
            .iter()
            .map(|entry| EndpointHealth {
                endpoint: entry.endpoint.clone(),
                healthy: entry.is_healthy(),
                consecutive_failures: entry.consecutive_failures(),
                service_ids: entry.service_ids.lock().iter().cloned().collect(),
            })
            .collect();
        health.sort_by_key(|h| h.endpoint.key());
        health
    }

    /// Run one probe cycle over every tracked endpoint
    pub async fn probe_all(&self) {
        let entries: Vec<Arc<MonitorEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(entries.into_iter().map(|entry| self.probe_entry(entry))).await;
    }

    async fn probe_entry(&self, entry: Arc<MonitorEntry>) {
        // At most one probe per endpoint in flight
        if entry
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let healthy = self.probe_with_timeout(&entry.endpoint).await;
        let evict = if healthy {
            let previous = entry.failures.swap(0, Ordering::AcqRel);
            if !entry.healthy.swap(true, Ordering::AcqRel) || previous > 0 {
                info!(endpoint = %entry.endpoint, "Endpoint recovered");
            }
            false
        } else {
            let failures = entry.failures.fetch_add(1, Ordering::AcqRel) + 1;
            entry.healthy.store(false, Ordering::Release);
            warn!(endpoint = %entry.endpoint, failures, "Health probe failed");
            failures >= self.config.eviction_threshold
        };

        entry.probing.store(false, Ordering::Release);

        if evict {
            self.evict(&entry).await;
        }
    }

    async fn evict(&self, entry: &Arc<MonitorEntry>) {
        let endpoint = &entry.endpoint;
        self.entries.remove_if(endpoint, |_, current| Arc::ptr_eq(current, entry));
        warn!(
            endpoint = %endpoint,
            threshold = self.config.eviction_threshold,
            "Evicting endpoint after consecutive probe failures"
        );

        let evictor = self.evictor.read().clone();
        if let Some(evictor) = evictor
            && let Err(err) = evictor.evict(endpoint).await
        {
            warn!(endpoint = %endpoint, error = %err, "Failed to evict endpoint from routes");
        }
    }

    async fn probe_with_timeout(&self, endpoint: &EndpointAddress) -> bool {
        tokio::time::timeout(self.config.probe_timeout, self.probe.probe(endpoint))
            .await
            .unwrap_or(false)
    }

    /// Follow a route table: track its endpoints and evict into it.
    pub fn attach(self: &Arc<Self>, route_table: &Arc<RouteTable>) {
        self.set_evictor(route_table.clone());

        let mut events = route_table.subscribe();
        for route in route_table.get_routes() {
            self.track_route(&route);
        }

        let monitor = self.clone();
        let table = route_table.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => monitor.handle_route_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Health monitor lagged behind route events, resyncing");
                            for route in table.get_routes() {
                                monitor.track_route(&route);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn handle_route_event(&self, event: RouteEvent) {
        match event {
            RouteEvent::Created(route) => self.track_route(&route),
            RouteEvent::Changed { old, new } => {
                for endpoint in new.addresses().iter().filter(|a| !old.contains(a)) {
                    self.monitor(endpoint, new.service_id());
                }
                for endpoint in old.addresses().iter().filter(|a| !new.contains(a)) {
                    self.release(endpoint, old.service_id());
                }
            }
            RouteEvent::Removed(route) => {
                for endpoint in route.addresses() {
                    self.release(endpoint, route.service_id());
                }
            }
        }
    }

    fn track_route(&self, route: &ServiceRoute) {
        for endpoint in route.addresses() {
            self.monitor(endpoint, route.service_id());
        }
    }

    /// Spawn the periodic probe loop
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.probe_all().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Health probe loop stopped");
        });
        self.tasks.lock().push(handle);

        info!(
            interval_ms = self.config.probe_interval.as_millis() as u64,
            threshold = self.config.eviction_threshold,
            "Health monitor started"
        );
    }

    /// Stop the probe and route-following loops
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
