//! Container data model and the source contract used by discovery
//!
//! A [`ContainerSource`] enumerates running containers, inspects a single
//! container's network attachments, and exposes a live lifecycle event
//! subscription. The Docker implementation lives in [`crate::docker`].

use crate::error::SourceError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

/// Label holding the hostname a container should be reachable under
pub const DOMAIN_LABEL: &str = "dockname.domain";
/// Label holding the backend port (defaults to [`DEFAULT_PORT`])
pub const PORT_LABEL: &str = "dockname.port";
/// Port used when a container has no port label
pub const DEFAULT_PORT: u16 = 80;
/// Event category for container lifecycle events
pub const CONTAINER_EVENT_CATEGORY: &str = "container";

/// Address record of one network attachment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkAddress {
    /// IPv4 address on the network (empty when not assigned)
    pub ip_address: String,
    pub gateway: String,
}

/// A container as returned by enumeration
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    /// Display name without the leading `/`
    pub name: String,
    pub labels: HashMap<String, String>,
    pub status: String,
    pub networks: HashMap<String, NetworkAddress>,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Hostname from the domain label, if the container opted in
    pub fn domain(&self) -> Option<&str> {
        self.labels.get(DOMAIN_LABEL).map(String::as_str)
    }
}

/// Result of inspecting a single container
#[derive(Debug, Clone, Default)]
pub struct ContainerDetail {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// Network attachments ordered by network name
    pub networks: BTreeMap<String, NetworkAddress>,
}

impl ContainerDetail {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_network(mut self, name: &str, ip_address: &str) -> Self {
        self.networks.insert(
            name.to_string(),
            NetworkAddress {
                ip_address: ip_address.to_string(),
                gateway: String::new(),
            },
        );
        self
    }

    /// First network, in name order, that carries a non-empty address
    pub fn first_address(&self) -> Option<(&str, &str)> {
        self.networks
            .iter()
            .find(|(_, net)| !net.ip_address.is_empty())
            .map(|(name, net)| (name.as_str(), net.ip_address.as_str()))
    }
}

/// A lifecycle notification from the event stream
#[derive(Debug, Clone, Default)]
pub struct ContainerEvent {
    /// Event category; only `"container"` events are routed
    pub category: String,
    /// Action string such as `start` or `die`
    pub action: String,
    pub container_id: String,
    /// Actor attributes (container labels, name, image)
    pub attributes: HashMap<String, String>,
    /// Unix timestamp of the event, when known
    pub time: Option<i64>,
}

impl ContainerEvent {
    pub fn container(action: &str, container_id: &str) -> Self {
        Self {
            category: CONTAINER_EVENT_CATEGORY.to_string(),
            action: action.to_string(),
            container_id: container_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_container_event(&self) -> bool {
        self.category == CONTAINER_EVENT_CATEGORY
    }
}

/// Paired receivers of one event subscription
pub struct EventStreams {
    pub events: mpsc::Receiver<ContainerEvent>,
    pub errors: mpsc::Receiver<SourceError>,
}

/// Capability to enumerate, inspect and watch containers
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// List running containers
    async fn list(&self) -> Result<Vec<Container>, SourceError>;

    /// Inspect one container's network attachments
    async fn inspect(&self, id: &str) -> Result<ContainerDetail, SourceError>;

    /// Subscribe to lifecycle events
    ///
    /// Every event raised after this call is delivered, including events
    /// raised before the underlying stream has connected. Events are buffered
    /// in the channel until read.
    fn watch(&self) -> EventStreams;
}
