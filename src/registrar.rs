//! Turns labeled containers into routes, and the event handlers built on it

use crate::container::{
    Container, ContainerDetail, ContainerEvent, ContainerSource, DEFAULT_PORT, DOMAIN_LABEL,
    PORT_LABEL,
};
use crate::error::{HandlerError, RegistrationError};
use crate::events::EventHandler;
use crate::routes::{SharedRouteTable, Target};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Registers containers in the route table and remembers which hostname
/// each container owns
pub struct Registrar {
    source: Arc<dyn ContainerSource>,
    routes: SharedRouteTable,
    /// container id -> hostname
    hostnames: DashMap<String, String>,
}

impl Registrar {
    pub fn new(source: Arc<dyn ContainerSource>, routes: SharedRouteTable) -> Self {
        Self {
            source,
            routes,
            hostnames: DashMap::new(),
        }
    }

    /// Register a container from a listing
    ///
    /// Returns `Ok(None)` when the container has no domain label.
    pub async fn register_container(
        &self,
        container: &Container,
    ) -> Result<Option<Target>, RegistrationError> {
        let Some(domain) = container.domain() else {
            info!(
                container_id = %container.id,
                labels = ?container.labels,
                "dockname.domain label not found, skipping container"
            );
            return Ok(None);
        };
        let port = resolve_port(&container.id, &container.labels)?;

        let detail = self.source.inspect(&container.id).await?;
        self.bind(&container.id, domain, port, &detail).map(Some)
    }

    /// Register a container known only by id, reading labels from inspection
    pub async fn register_by_id(&self, container_id: &str) -> Result<Option<Target>, RegistrationError> {
        let detail = self.source.inspect(container_id).await?;

        let Some(domain) = detail.labels.get(DOMAIN_LABEL) else {
            debug!(container_id, "dockname.domain label not found, skipping container");
            return Ok(None);
        };
        let port = resolve_port(container_id, &detail.labels)?;

        self.bind(container_id, domain, port, &detail).map(Some)
    }

    fn bind(
        &self,
        container_id: &str,
        domain: &str,
        port: u16,
        detail: &ContainerDetail,
    ) -> Result<Target, RegistrationError> {
        let (network, ip) = detail
            .first_address()
            .ok_or_else(|| RegistrationError::NoAddress(container_id.to_string()))?;
        let target = Target::http(ip, port);
        let hostname = domain.trim().to_ascii_lowercase();

        let unchanged = self.routes.lookup(&hostname).as_ref() == Some(&target)
            && self.owner_hostname(container_id).as_deref() == Some(hostname.as_str());

        self.routes.add_container_route(&hostname, target.clone(), container_id);

        // A container recreated with a different domain label gives up its old route
        if let Some(previous) = self.hostnames.insert(container_id.to_string(), hostname.clone()) {
            if previous != hostname && self.routes.remove_container_route(&previous, container_id) {
                info!(container_id, hostname = %previous, "Removed stale route after domain change");
            }
        }

        if unchanged {
            debug!(container_id, hostname, target = %target, "Container route unchanged");
        } else {
            info!(
                container_id,
                network,
                ip,
                hostname,
                target = %target,
                "Registered container"
            );
        }

        Ok(target)
    }

    /// Remove the route owned by a container
    ///
    /// The hostname comes from the registration index, or from the domain label
    /// in `attributes` for containers registered before a restart of the index.
    pub fn deregister(&self, container_id: &str, attributes: &HashMap<String, String>) -> Option<String> {
        let hostname = self
            .hostnames
            .remove(container_id)
            .map(|(_, hostname)| hostname)
            .or_else(|| attributes.get(DOMAIN_LABEL).map(|d| d.trim().to_ascii_lowercase()))?;

        if self.routes.remove_container_route(&hostname, container_id) {
            info!(container_id, hostname, "Deregistered container");
            Some(hostname)
        } else {
            debug!(container_id, hostname, "No route owned by container");
            None
        }
    }

    /// Drop routes whose owning container is not in `live`
    pub fn prune(&self, live: &HashSet<String>) -> Vec<String> {
        let mut removed = Vec::new();
        for (hostname, container_id) in self.routes.container_routes() {
            if live.contains(&container_id) {
                continue;
            }
            if self.routes.remove_container_route(&hostname, &container_id) {
                info!(container_id, hostname, "Removed route of vanished container");
                removed.push(hostname);
            }
            self.hostnames.remove(&container_id);
        }
        removed
    }

    fn owner_hostname(&self, container_id: &str) -> Option<String> {
        self.hostnames.get(container_id).map(|entry| entry.value().clone())
    }

    pub fn routes(&self) -> &SharedRouteTable {
        &self.routes
    }
}

/// Backend port from the port label, defaulting to 80
fn resolve_port(container_id: &str, labels: &HashMap<String, String>) -> Result<u16, RegistrationError> {
    match labels.get(PORT_LABEL).map(|p| p.trim()) {
        None | Some("") => Ok(DEFAULT_PORT),
        Some(value) => value.parse().map_err(|_| RegistrationError::InvalidPort {
            container_id: container_id.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Adds a route when a labeled container starts
pub struct StartHandler {
    registrar: Arc<Registrar>,
}

impl StartHandler {
    pub fn new(registrar: Arc<Registrar>) -> Self {
        Self { registrar }
    }
}

#[async_trait]
impl EventHandler for StartHandler {
    async fn handle_event(&self, event: &ContainerEvent) -> Result<(), HandlerError> {
        // Docker puts container labels in the actor attributes; without them
        // the container has to be inspected to find out
        if !event.attributes.is_empty() && !event.attributes.contains_key(DOMAIN_LABEL) {
            debug!(container_id = %event.container_id, "dockname.domain label not found, skipping container");
            return Ok(());
        }

        self.registrar.register_by_id(&event.container_id).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "register-route"
    }
}

/// Removes a container's route when it stops, dies or is killed
pub struct StopHandler {
    registrar: Arc<Registrar>,
}

impl StopHandler {
    pub fn new(registrar: Arc<Registrar>) -> Self {
        Self { registrar }
    }
}

#[async_trait]
impl EventHandler for StopHandler {
    async fn handle_event(&self, event: &ContainerEvent) -> Result<(), HandlerError> {
        self.registrar.deregister(&event.container_id, &event.attributes);
        Ok(())
    }

    fn name(&self) -> &str {
        "deregister-route"
    }
}
