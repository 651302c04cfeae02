//! Service descriptors and routes.
//!
//! A [`ServiceDescriptor`] describes one exposed operation; a [`ServiceRoute`]
//! pairs it with the endpoints currently believed to host it. Routes are
//! values: the registry replaces them wholesale instead of patching them.

use crate::endpoint::EndpointAddress;
use crate::error::{Result, TrellisError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Metadata key: the caller waits for the remote execution to finish.
pub const META_WAIT_EXECUTION: &str = "wait_execution";
/// Metadata key: logical group the service belongs to.
pub const META_GROUP_NAME: &str = "group_name";
/// Metadata key: the service is local-only and must not be published.
pub const META_DISABLE_NETWORK: &str = "disable_network";

/// How a gateway authorizes calls to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuthorizationKind {
    /// Shared application secret.
    #[default]
    AppSecret,
    /// JWT bearer token.
    JwtBearer,
}

/// Describes one exposed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Globally unique id of the operation.
    pub id: String,

    /// Route path the operation is reachable under.
    #[serde(default)]
    pub route_path: String,

    /// Whether calls must be authorized.
    #[serde(default)]
    pub enable_authorization: bool,

    /// Authorization scheme used when `enable_authorization` is set.
    #[serde(default)]
    pub authorization_kind: AuthorizationKind,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ServiceDescriptor {
    /// Create a descriptor for the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            route_path: String::new(),
            enable_authorization: false,
            authorization_kind: AuthorizationKind::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the route path.
    pub fn with_route_path(mut self, path: impl Into<String>) -> Self {
        self.route_path = path.into();
        self
    }

    /// Require authorization of the given kind.
    pub fn with_authorization(mut self, kind: AuthorizationKind) -> Self {
        self.enable_authorization = true;
        self.authorization_kind = kind;
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry.
    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Whether callers wait for the execution to finish. Defaults to true.
    pub fn wait_execution(&self) -> bool {
        self.metadata(META_WAIT_EXECUTION)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    /// Logical group name, if any.
    pub fn group_name(&self) -> Option<&str> {
        self.metadata(META_GROUP_NAME).and_then(|v| v.as_str())
    }

    /// Whether the operation is local-only.
    pub fn disable_network(&self) -> bool {
        self.metadata(META_DISABLE_NETWORK)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Route path normalized for lookups: lower case, no leading `/`.
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.route_path)
    }

    /// Check the descriptor can be stored under a registry path.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TrellisError::invalid_descriptor("service id is empty"));
        }
        if self.id.contains('/') {
            return Err(TrellisError::invalid_descriptor(format!(
                "service id '{}' contains '/'",
                self.id
            )));
        }
        Ok(())
    }
}

/// Normalize a route path for lookups.
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches('/').to_lowercase()
}

/// A service descriptor plus the endpoints currently hosting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRoute {
    /// The operation this route is for.
    pub descriptor: ServiceDescriptor,

    /// Hosting endpoints, free of duplicates.
    addresses: Vec<EndpointAddress>,
}

impl ServiceRoute {
    /// Build a route, dropping duplicate addresses while keeping first-seen order.
    pub fn new(descriptor: ServiceDescriptor, addresses: impl IntoIterator<Item = EndpointAddress>) -> Self {
        let mut seen = HashSet::new();
        let addresses = addresses
            .into_iter()
            .filter(|a| seen.insert(a.key()))
            .collect();

        Self {
            descriptor,
            addresses,
        }
    }

    /// Service id of this route.
    pub fn service_id(&self) -> &str {
        &self.descriptor.id
    }

    /// Hosting endpoints.
    pub fn addresses(&self) -> &[EndpointAddress] {
        &self.addresses
    }

    /// Whether the route lists the endpoint.
    pub fn contains(&self, address: &EndpointAddress) -> bool {
        self.addresses.contains(address)
    }

    /// A copy of this route with `other` addresses merged in.
    pub fn merged_with(&self, other: impl IntoIterator<Item = EndpointAddress>) -> Self {
        Self::new(
            self.descriptor.clone(),
            self.addresses.iter().cloned().chain(other),
        )
    }

    /// A copy of this route without the given addresses.
    pub fn without(&self, removed: &[EndpointAddress]) -> Self {
        Self::new(
            self.descriptor.clone(),
            self.addresses
                .iter()
                .filter(|a| !removed.contains(a))
                .cloned(),
        )
    }

    /// Encode for storage in a registry node.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a registry node, re-applying deduplication.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: ServiceRoute = serde_json::from_slice(bytes)
            .map_err(|e| TrellisError::invalid_route(e.to_string()))?;
        Ok(Self::new(raw.descriptor, raw.addresses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> EndpointAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_route_deduplicates() {
        let route = ServiceRoute::new(
            ServiceDescriptor::new("order.create"),
            vec![
                addr("10.0.0.1:80"),
                addr("10.0.0.2:80"),
                EndpointAddress::new("10.0.0.1", 80).with_ws_port(96),
            ],
        );

        assert_eq!(route.addresses().len(), 2);
        assert_eq!(route.addresses()[0], addr("10.0.0.1:80"));
    }

    #[test]
    fn test_merge_and_remove() {
        let route = ServiceRoute::new(ServiceDescriptor::new("a"), vec![addr("10.0.0.1:80")]);

        let merged = route.merged_with(vec![addr("10.0.0.1:80"), addr("10.0.0.3:80")]);
        assert_eq!(merged.addresses().len(), 2);

        let trimmed = merged.without(&[addr("10.0.0.1:80")]);
        assert_eq!(trimmed.addresses(), &[addr("10.0.0.3:80")]);

        let empty = trimmed.without(&[addr("10.0.0.3:80")]);
        assert!(empty.addresses().is_empty());
    }

    #[test]
    fn test_descriptor_metadata_accessors() {
        let d = ServiceDescriptor::new("user.get")
            .with_route_path("/API/User/Get")
            .with_metadata(META_GROUP_NAME, "users")
            .with_metadata(META_WAIT_EXECUTION, false);

        assert_eq!(d.group_name(), Some("users"));
        assert!(!d.wait_execution());
        assert!(!d.disable_network());
        assert_eq!(d.normalized_path(), "api/user/get");
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(ServiceDescriptor::new("ok.id").validate().is_ok());
        assert!(ServiceDescriptor::new("").validate().is_err());
        assert!(ServiceDescriptor::new("bad/id").validate().is_err());
    }

    #[test]
    fn test_bytes_roundtrip_dedups() {
        let json = br#"{
            "descriptor": {"id": "svc"},
            "addresses": [
                {"host": "h", "port": 1},
                {"host": "h", "port": 1}
            ]
        }"#;

        let route = ServiceRoute::from_bytes(json).unwrap();
        assert_eq!(route.addresses().len(), 1);
        assert_eq!(route.descriptor.authorization_kind, AuthorizationKind::AppSecret);

        let again = ServiceRoute::from_bytes(&route.to_bytes().unwrap()).unwrap();
        assert_eq!(again, route);

        assert!(ServiceRoute::from_bytes(b"not json").is_err());
    }
}
