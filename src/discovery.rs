//! Discovery orchestrator
//!
//! Bootstraps the route table from the current container list, serves HTTP
//! traffic through it, and keeps it in sync with container lifecycle events.
//!
//! The event subscription is opened before the initial snapshot is taken, so
//! events that happen while the snapshot is being registered wait in the
//! channel and are applied afterwards. Registration is an upsert and removal of
//! an absent route is a no-op, so replaying an event the snapshot already
//! covered is harmless.

use crate::config::Config;
use crate::container::{ContainerEvent, ContainerSource, EventStreams};
use crate::error::{DiscoveryError, SourceError};
use crate::events::{EventAction, EventHandler, EventRegistry};
use crate::pool::PoolConfig;
use crate::proxy::ProxyServer;
use crate::registrar::{Registrar, StartHandler, StopHandler};
use crate::routes::{RouteTable, SharedRouteTable};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lifecycle of a discovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Initializing,
    Watching,
    Stopped,
    Failed,
}

/// Raises the shutdown signal shared by the watch loop and the listener
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Composes the container source, route table and event registry
pub struct Discovery {
    source: Arc<dyn ContainerSource>,
    routes: SharedRouteTable,
    registrar: Arc<Registrar>,
    registry: EventRegistry,
    config: Config,
    shutdown_tx: Arc<watch::Sender<bool>>,
    state: RwLock<DiscoveryState>,
}

impl Discovery {
    pub fn new(source: Arc<dyn ContainerSource>, config: Config) -> Self {
        let routes: SharedRouteTable = Arc::new(RouteTable::new());
        let registrar = Arc::new(Registrar::new(Arc::clone(&source), Arc::clone(&routes)));

        let mut registry = EventRegistry::new();
        registry.register_handler(
            EventAction::Start,
            Arc::new(StartHandler::new(Arc::clone(&registrar))),
        );
        let stop: Arc<dyn EventHandler> = Arc::new(StopHandler::new(Arc::clone(&registrar)));
        for action in [EventAction::Stop, EventAction::Die, EventAction::Kill] {
            registry.register_handler(action, Arc::clone(&stop));
        }

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            source,
            routes,
            registrar,
            registry,
            config,
            shutdown_tx: Arc::new(shutdown_tx),
            state: RwLock::new(DiscoveryState::Initializing),
        }
    }

    pub fn routes(&self) -> SharedRouteTable {
        Arc::clone(&self.routes)
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.read()
    }

    fn set_state(&self, state: DiscoveryState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Discovery state changed");
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> Result<(), DiscoveryError> {
        let addr = self.config.server.bind_addr().map_err(|e| {
            DiscoveryError::Server(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(DiscoveryState::Failed);
                return Err(DiscoveryError::Server(e));
            }
        };
        self.run_on(listener).await
    }

    /// Run on an already bound listener until shutdown
    ///
    /// Returns `Ok(())` after a requested shutdown. If the event stream cannot
    /// be recovered the listener is drained and the stream error is returned.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), DiscoveryError> {
        self.set_state(DiscoveryState::Initializing);

        let streams = self.source.watch();

        if let Err(e) = self.initialize().await {
            self.set_state(DiscoveryState::Failed);
            return Err(e);
        }

        let server = ProxyServer::new(
            Arc::clone(&self.routes),
            self.shutdown_tx.subscribe(),
            PoolConfig {
                max_idle_per_host: self.config.server.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(self.config.server.pool_idle_timeout_secs),
            },
        )
        .with_drain_timeout(self.config.server.drain_timeout());
        let mut server_task = tokio::spawn(server.serve(listener));

        self.set_state(DiscoveryState::Watching);

        let result = tokio::select! {
            watched = self.watch(streams) => {
                // Stops the listener when the watch loop gave up
                self.shutdown();
                watched.and(join_server(server_task.await))
            }
            served = &mut server_task => {
                if !*self.shutdown_tx.borrow() {
                    error!("Proxy server stopped unexpectedly");
                }
                self.shutdown();
                join_server(served)
            }
        };

        match &result {
            Ok(()) => {
                self.set_state(DiscoveryState::Stopped);
                info!("Discovery stopped");
            }
            Err(e) => {
                self.set_state(DiscoveryState::Failed);
                error!(error = %e, "Discovery failed");
            }
        }
        result
    }

    /// Register every labeled container of the current snapshot
    ///
    /// Stops at the first container that cannot be registered. Returns the
    /// number of routes added.
    pub async fn initialize(&self) -> Result<usize, DiscoveryError> {
        let containers = self.source.list().await.map_err(DiscoveryError::List)?;
        info!(container_count = containers.len(), "Getting initial container list");

        let mut registered = 0;
        for container in &containers {
            match self.registrar.register_container(container).await {
                Ok(Some(_)) => registered += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(container_id = %container.id, error = %e, "Failed to register container");
                    return Err(DiscoveryError::Register {
                        container_id: container.id.clone(),
                        source: e,
                    });
                }
            }
        }

        info!(registered, "Initial containers registered");
        Ok(registered)
    }

    /// Reconcile the route table with the current container list
    ///
    /// Unlike `initialize`, a container that fails to register is logged and
    /// skipped.
    pub async fn resync(&self) -> Result<(), SourceError> {
        let containers = self.source.list().await?;

        let mut live = HashSet::with_capacity(containers.len());
        for container in &containers {
            live.insert(container.id.clone());
            if container.domain().is_none() {
                continue;
            }
            if let Err(e) = self.registrar.register_container(container).await {
                warn!(container_id = %container.id, error = %e, "Failed to register container during resync");
            }
        }

        let removed = self.registrar.prune(&live);
        debug!(containers = containers.len(), removed = removed.len(), "Resync complete");
        Ok(())
    }

    /// Process events until shutdown, or until the stream fails beyond the retry budget
    pub async fn watch(&self, mut streams: EventStreams) -> Result<(), DiscoveryError> {
        let watch_config = &self.config.watch;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // A zero interval turns periodic resync off
        let mut resync = (!watch_config.update_interval().is_zero()).then(|| {
            let mut interval = tokio::time::interval(watch_config.update_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.reset();
            interval
        });

        let mut attempts: u32 = 0;
        let mut errors_open = true;

        info!(
            update_interval_secs = watch_config.update_interval_secs,
            retry_attempts = watch_config.retry_attempts,
            "Watching container events"
        );

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let failure = tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Stopping container watch");
                        return Ok(());
                    }
                    continue;
                }
                event = streams.events.recv() => match event {
                    Some(event) => {
                        attempts = 0;
                        self.handle_event(&event).await;
                        continue;
                    }
                    // Prefer the error that ended the stream, if one was sent
                    None => streams.errors.try_recv().unwrap_or(SourceError::StreamClosed),
                },
                err = streams.errors.recv(), if errors_open => match err {
                    Some(err) => err,
                    None => {
                        errors_open = false;
                        continue;
                    }
                },
                _ = next_resync(&mut resync) => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Periodic resync failed");
                    }
                    continue;
                }
            };

            attempts += 1;
            if attempts > watch_config.retry_attempts {
                error!(error = %failure, "Error monitoring events");
                return Err(DiscoveryError::Stream {
                    attempts: attempts - 1,
                    source: failure,
                });
            }

            let delay = watch_config.backoff(attempts);
            warn!(
                error = %failure,
                attempt = attempts,
                max_attempts = watch_config.retry_attempts,
                delay_ms = delay.as_millis() as u64,
                "Event stream failed, reconnecting"
            );

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Stopping container watch");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            streams = self.source.watch();
            errors_open = true;

            // Catch up on anything that happened while disconnected
            if let Err(e) = self.resync().await {
                warn!(error = %e, "Resync after reconnect failed");
            }
        }
    }

    async fn handle_event(&self, event: &ContainerEvent) {
        if !event.is_container_event() {
            return;
        }

        debug!(
            container_id = %event.container_id,
            action = %event.action,
            "Container event received"
        );

        // Handler failures are logged by the registry; the loop keeps going
        if let Err(e) = self.registry.dispatch(event).await {
            debug!(error = %e, "Event dispatch aborted");
        }
    }
}

/// Next resync tick; never resolves when periodic resync is off
async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn join_server(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), DiscoveryError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DiscoveryError::Server(e)),
        Err(e) => Err(DiscoveryError::Server(std::io::Error::other(e))),
    }
}
