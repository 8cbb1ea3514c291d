//! Broker core
//!
//! Owns the shared state (topic indices, sessions, retained store, pipe
//! index, connection registry), opens the listeners, and drives one
//! connection task per accepted socket. A fixed pool of runtime workers
//! executes the tasks; work items are not pinned to workers.

mod connection;
mod notify;
mod router;

pub use connection::Connection;
pub use router::Router;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info};

use crate::auth::{Authenticator, StaticAuth};
use crate::bridge::BridgeClient;
use crate::config::{BridgeSettings, ConfigError, ListenerUrl, Settings, TransportKind};
use crate::protocol::Packet;
use crate::session::SessionStore;
use crate::topic::{PipeIndex, RetainStore, SubscriptionStore};
use crate::transport::{configure_stream, WsStream};

/// Opaque per-connection handle minted by the listener; unique for the
/// lifetime of a connection.
pub type PipeId = u32;

/// Writer-side handle to a live connection, registered after CONNECT.
/// Routing enqueues packets here; the connection task drains the queue in
/// order, so per-pipe outbound ordering follows enqueue order.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub pipe: PipeId,
    pub client_id: Arc<str>,
    sender: mpsc::Sender<Packet>,
}

impl ConnectionHandle {
    pub fn try_send(&self, packet: Packet) -> Result<(), mpsc::error::TrySendError<Packet>> {
        self.sender.try_send(packet)
    }
}

/// Broker configuration, assembled from [`Settings`]
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub tcp: ListenerUrl,
    pub websocket: Option<ListenerUrl>,
    /// Maximum outstanding work items (concurrent connections served)
    pub parallel: usize,
    /// Cap on accumulated user-property bytes per packet
    pub property_size: usize,
    /// Bound on per-pipe outbound queues and cached-session queues
    pub msq_len: usize,
    /// Interval of the qos retransmit/expiry timer
    pub qos_duration: Duration,
}

impl BrokerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let tcp = ListenerUrl::parse(&settings.url)?;
        if tcp.kind != TransportKind::Tcp {
            return Err(ConfigError::Validation(
                "url must use a broker+tcp scheme".to_string(),
            ));
        }
        let websocket = if settings.websocket.enable {
            Some(ListenerUrl::parse(&settings.websocket.url)?)
        } else {
            None
        };
        Ok(Self {
            tcp,
            websocket,
            parallel: settings.parallel,
            property_size: settings.property_size,
            msq_len: settings.msq_len,
            qos_duration: Duration::from_secs(settings.qos_duration),
        })
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tcp: ListenerUrl {
                kind: TransportKind::Tcp,
                host: "0.0.0.0".to_string(),
                port: 1883,
                path: "/".to_string(),
            },
            websocket: None,
            parallel: 32,
            property_size: 64,
            msq_len: 64,
            qos_duration: Duration::from_secs(10),
        }
    }
}

/// State shared by every connection task, the router and the bridge
pub(crate) struct Shared {
    pub sessions: Arc<SessionStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub retained: Arc<RetainStore>,
    pub pipes: Arc<PipeIndex>,
    pub connections: Arc<DashMap<PipeId, Arc<ConnectionHandle>>>,
    /// client id -> live pipe, for takeover eviction
    pub client_pipes: Arc<DashMap<Arc<str>, PipeId>>,
    pub router: Arc<Router>,
    pub authenticator: Arc<dyn Authenticator>,
    pub property_size: usize,
    pub msq_len: usize,
    pub qos_duration: Duration,
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    shared: Arc<Shared>,
    next_pipe: AtomicU32,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(StaticAuth::allow_all()))
    }

    pub fn with_authenticator(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let retained = Arc::new(RetainStore::new());
        let pipes = Arc::new(PipeIndex::new());
        let connections: Arc<DashMap<PipeId, Arc<ConnectionHandle>>> = Arc::new(DashMap::new());
        let client_pipes: Arc<DashMap<Arc<str>, PipeId>> = Arc::new(DashMap::new());

        let router = Arc::new(Router::new(
            subscriptions.clone(),
            retained.clone(),
            sessions.clone(),
            connections.clone(),
        ));

        let shared = Arc::new(Shared {
            sessions,
            subscriptions,
            retained,
            pipes,
            connections,
            client_pipes,
            router,
            authenticator,
            property_size: config.property_size,
            msq_len: config.msq_len,
            qos_duration: config.qos_duration,
        });

        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            shared,
            next_pipe: AtomicU32::new(1),
            shutdown,
        }
    }

    /// The shared routing surface (also fed by the bridge ingress)
    pub fn router(&self) -> Arc<Router> {
        self.shared.router.clone()
    }

    /// Attach and start the outbound bridge
    pub fn attach_bridge(&self, settings: BridgeSettings) -> Arc<BridgeClient> {
        let bridge = BridgeClient::spawn(settings, self.shared.router.clone(), self.shutdown.subscribe());
        self.shared.router.set_bridge(bridge.clone());
        bridge
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Bind the listeners and serve until shutdown. Bind failures are
    /// fatal and propagate to the caller.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.tcp.bind_addr()).await?;
        info!("MQTT/TCP listening on {}", self.config.tcp.bind_addr());

        if let Some(ref ws) = self.config.websocket {
            let ws_listener = TcpListener::bind(ws.bind_addr()).await?;
            info!("MQTT/WebSocket listening on {} (path {})", ws.bind_addr(), ws.path);
            self.spawn_ws_accept_loop(ws_listener, ws.path.clone());
        }

        self.spawn_session_sweeper();

        // `parallel` bounds the number of outstanding work items; further
        // accepts wait until a connection task retires.
        let permits = Arc::new(Semaphore::new(self.config.parallel));
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => {
                    // the semaphore is never closed while the broker runs
                    match permit {
                        Ok(p) => p,
                        Err(_) => return Ok(()),
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            };

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = configure_stream(&stream) {
                                debug!("socket option setup failed for {}: {}", addr, e);
                            }
                            let pipe = self.next_pipe.fetch_add(1, Ordering::Relaxed);
                            debug!("pipe {} accepted from {}", pipe, addr);

                            let shared = self.shared.clone();
                            let shutdown_rx = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                let conn = Connection::new(stream, pipe, shared);
                                conn.run(shutdown_rx).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                            drop(permit);
                        }
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    fn spawn_ws_accept_loop(&self, listener: TcpListener, path: String) {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let next_pipe = Arc::new(AtomicU32::new(0x8000_0000));
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown_rx.recv() => return,
                };

                match accepted {
                    Ok((stream, addr)) => {
                        let shared = shared.clone();
                        let shutdown_rx = shutdown.subscribe();
                        let path = path.clone();
                        let pipe = next_pipe.fetch_add(1, Ordering::Relaxed);

                        tokio::spawn(async move {
                            match WsStream::accept(stream, &path).await {
                                Ok(ws) => {
                                    debug!("pipe {} accepted over websocket from {}", pipe, addr);
                                    let conn = Connection::new(ws, pipe, shared);
                                    conn.run(shutdown_rx).await;
                                }
                                Err(e) => {
                                    debug!("websocket handshake failed for {}: {}", addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => error!("websocket accept failed: {}", e),
                }
            }
        });
    }

    /// The qos timer doubles as the session sweeper: retransmits are
    /// driven per-connection, expiry of cached sessions is driven here.
    /// An expiring session takes its detached topic-index entries along.
    fn spawn_session_sweeper(&self) {
        let sessions = self.shared.sessions.clone();
        let subscriptions = self.shared.subscriptions.clone();
        let interval = self.shared.qos_duration;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for (client_id, filters) in sessions.take_expired() {
                            for filter in filters {
                                subscriptions.unsubscribe_client(&filter, &client_id);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
