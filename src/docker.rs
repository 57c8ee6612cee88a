//! Docker implementation of the container source

use crate::container::{
    Container, ContainerDetail, ContainerEvent, ContainerSource, EventStreams, NetworkAddress,
    CONTAINER_EVENT_CATEGORY,
};
use crate::error::SourceError;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EndpointSettings, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events buffered between the Docker stream and the watch loop
const EVENT_BUFFER: usize = 256;
/// Request timeout for the Docker API client
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Container source backed by the Docker Engine API
pub struct DockerSource {
    client: Docker,
}

impl DockerSource {
    /// Connect to the Docker daemon and check that it answers
    ///
    /// An explicit `docker_host` wins over `DOCKER_HOST`, which wins over the
    /// well-known socket locations.
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let from_env = std::env::var("DOCKER_HOST").ok();
        let client = match docker_host.or(from_env.as_deref()) {
            Some(host) => connect_to_host(host)
                .map_err(|e| anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e))?,
            None => find_local_socket().await?,
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(path) = host.strip_prefix("unix://") {
        Ok(Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Ok(Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?)
    } else {
        anyhow::bail!("expected unix:///path/to/socket or tcp://host:port, got '{}'", host)
    }
}

/// Socket paths used by common Docker installations
fn candidate_sockets() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/var/run/docker.sock")];
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        paths.push(home.join(".docker/run/docker.sock"));
        paths.push(home.join(".colima/default/docker.sock"));
        paths.push(home.join(".rd/docker.sock"));
    }
    if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR") {
        paths.push(PathBuf::from(runtime).join("podman/podman.sock"));
    }
    paths
}

/// Try each existing socket until one answers a ping
async fn find_local_socket() -> anyhow::Result<Docker> {
    let mut failures = Vec::new();

    for path in candidate_sockets().iter().filter(|p| p.exists()) {
        let Some(path_str) = path.to_str() else { continue };
        match Docker::connect_with_socket(path_str, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
            Ok(client) => match client.ping().await {
                Ok(_) => {
                    debug!(path = path_str, "Using Docker socket");
                    return Ok(client);
                }
                Err(e) => failures.push(format!("{}: not responding ({})", path_str, e)),
            },
            Err(e) => failures.push(format!("{}: {}", path_str, e)),
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        let tried = if failures.is_empty() {
            "no Docker socket found".to_string()
        } else {
            failures.join("; ")
        };
        anyhow::anyhow!(
            "Cannot connect to Docker daemon ({}). Start dockerd or set DOCKER_HOST or docker.host: {}",
            tried,
            e
        )
    })
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn list(&self) -> Result<Vec<Container>, SourceError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let summaries = self.client.list_containers(Some(options)).await?;
        Ok(summaries.into_iter().filter_map(container_from_summary).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, SourceError> {
        match self.client.inspect_container(id, None).await {
            Ok(response) => Ok(detail_from_inspect(id, response)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(SourceError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn watch(&self) -> EventStreams {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let client = self.client.clone();

        let options = events_options(SystemTime::now());

        tokio::spawn(async move {
            let mut stream = Box::pin(client.events(Some(options)));
            info!("Subscribed to Docker events");

            loop {
                tokio::select! {
                    _ = events_tx.closed() => {
                        debug!("Event receiver dropped, closing Docker event stream");
                        break;
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(message)) => {
                                if events_tx.send(event_from_message(message)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Docker event stream failed");
                                let _ = errors_tx.send(SourceError::Docker(e)).await;
                                break;
                            }
                            None => {
                                let _ = errors_tx.send(SourceError::StreamClosed).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        EventStreams {
            events: events_rx,
            errors: errors_rx,
        }
    }
}

/// Container events from `since` onwards
///
/// The daemon replays events raised after `since` before streaming live ones,
/// so anything that happens between `watch()` returning and the stream
/// request reaching the daemon is still delivered.
fn events_options(since: SystemTime) -> EventsOptions<String> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec![CONTAINER_EVENT_CATEGORY.to_string()]);
    let since = since
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .ok();

    EventsOptions::<String> {
        since,
        filters,
        ..Default::default()
    }
}

fn address_from_endpoint(endpoint: EndpointSettings) -> NetworkAddress {
    NetworkAddress {
        ip_address: endpoint.ip_address.unwrap_or_default(),
        gateway: endpoint.gateway.unwrap_or_default(),
    }
}

/// Convert a container listing entry; entries without an id are dropped
fn container_from_summary(summary: ContainerSummary) -> Option<Container> {
    let id = summary.id?;
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let networks = summary
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, address_from_endpoint(endpoint)))
        .collect();

    Some(Container {
        id,
        name,
        labels: summary.labels.unwrap_or_default(),
        status: summary.state.or(summary.status).unwrap_or_default(),
        networks,
    })
}

fn detail_from_inspect(id: &str, response: ContainerInspectResponse) -> ContainerDetail {
    let networks = response
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, address_from_endpoint(endpoint)))
        .collect();

    ContainerDetail {
        id: response.id.unwrap_or_else(|| id.to_string()),
        labels: response
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default(),
        networks,
    }
}

fn event_from_message(message: EventMessage) -> ContainerEvent {
    let (container_id, attributes) = message
        .actor
        .map(|actor| (actor.id.unwrap_or_default(), actor.attributes.unwrap_or_default()))
        .unwrap_or_default();

    ContainerEvent {
        category: message.typ.map(|t| t.to_string()).unwrap_or_default(),
        action: message.action.unwrap_or_default(),
        container_id,
        attributes,
        time: message.time,
    }
}
