//! Hostname to backend route table
//!
//! Lookups take a shared read lock so concurrent requests never block each
//! other; registrations and removals take the write lock, so a request either
//! sees the table before or after a mutation, never halfway through.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Backend address a hostname is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http",
            host: host.into(),
            port,
        }
    }

    /// `host:port` authority, with brackets around IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

#[derive(Debug, Clone)]
struct Route {
    target: Target,
    /// Container that registered the route, if it came from discovery
    container_id: Option<String>,
}

/// Concurrency-safe mapping from hostname to backend target
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Route>>,
}

/// Route table shared between the proxy and discovery
pub type SharedRouteTable = Arc<RouteTable>;

/// Lowercase and strip surrounding whitespace so lookups are case-insensitive
fn normalize(hostname: &str) -> String {
    hostname.trim().to_ascii_lowercase()
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for `hostname`
    pub fn add_route(&self, hostname: &str, target: Target) {
        self.insert(hostname, Route { target, container_id: None });
    }

    /// Insert or replace the route for `hostname`, recording the owning container
    pub fn add_container_route(&self, hostname: &str, target: Target, container_id: &str) {
        self.insert(
            hostname,
            Route {
                target,
                container_id: Some(container_id.to_string()),
            },
        );
    }

    fn insert(&self, hostname: &str, route: Route) {
        let hostname = normalize(hostname);
        let previous = self.routes.write().insert(hostname.clone(), route);
        if let Some(previous) = previous {
            debug!(hostname, previous = %previous.target, "Replaced existing route");
        }
    }

    /// Remove the route for `hostname`; absent hostnames are ignored
    pub fn remove_route(&self, hostname: &str) -> Option<Target> {
        self.routes
            .write()
            .remove(&normalize(hostname))
            .map(|route| route.target)
    }

    /// Remove the route for `hostname` only if `container_id` still owns it
    ///
    /// Returns true when a route was removed.
    pub fn remove_container_route(&self, hostname: &str, container_id: &str) -> bool {
        let hostname = normalize(hostname);
        let mut routes = self.routes.write();
        match routes.get(&hostname) {
            Some(route) if route.container_id.as_deref() == Some(container_id) => {
                routes.remove(&hostname);
                true
            }
            Some(route) => {
                debug!(
                    hostname,
                    container_id,
                    owner = ?route.container_id,
                    "Route owned by another container, keeping it"
                );
                false
            }
            None => false,
        }
    }

    /// Current target for `hostname`
    pub fn lookup(&self, hostname: &str) -> Option<Target> {
        self.routes
            .read()
            .get(&normalize(hostname))
            .map(|route| route.target.clone())
    }

    /// Snapshot of registered hostnames
    pub fn list_routes(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    /// Snapshot of `(hostname, container_id)` pairs for routes owned by containers
    pub fn container_routes(&self) -> Vec<(String, String)> {
        self.routes
            .read()
            .iter()
            .filter_map(|(hostname, route)| {
                route
                    .container_id
                    .as_ref()
                    .map(|id| (hostname.clone(), id.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
