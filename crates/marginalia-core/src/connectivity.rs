//! Connectivity monitor
//!
//! Tracks whether the remote is presumed reachable. Reachability comes from
//! whatever the host platform reports (or from a periodic TCP probe) and is
//! published on a watch channel. Listeners see edges only: reporting the
//! same state twice notifies nobody.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, info};

use crate::subscription::{CancelHandle, CancelToken};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Publishes online/offline state to listeners
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    /// Record the current reachability, returning whether it changed
    pub fn report(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Register a listener for connectivity changes
    ///
    /// The current state is delivered once on registration, then every
    /// change. A quick flap that returns to the last delivered state before
    /// the listener runs is not reported.
    pub fn subscribe(&self, on_change: impl Fn(bool) + Send + Sync + 'static) -> CancelHandle {
        let mut rx = self.tx.subscribe();

        let (token_tx, token_rx) = oneshot::channel::<CancelToken>();
        let task = tokio::spawn(async move {
            let Ok(token) = token_rx.await else {
                return;
            };

            let mut last = *rx.borrow_and_update();
            if token.is_cancelled() {
                return;
            }
            on_change(last);

            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online == last || token.is_cancelled() {
                    continue;
                }
                last = online;
                on_change(online);
            }
            debug!("Connectivity monitor dropped, listener finished");
        });

        let abort = task.abort_handle();
        let handle = CancelHandle::new(move || abort.abort());
        let _ = token_tx.send(handle.token());
        handle
    }
}

/// Source of reachability readings
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether the remote can currently be reached
    async fn probe(&self) -> bool;
}

/// Probe that opens a TCP connection to the sync server
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Probe the host and port of a `ws://` or `wss://` URL
    pub fn from_url(url: &str) -> Option<Self> {
        let uri: Uri = url.parse().ok()?;
        let host = uri.host()?;
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("wss") | Some("https") => 443,
            _ => 80,
        });
        Some(Self::new(host, port))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }
}

/// Periodically probe reachability and report it to the monitor
pub fn spawn_probe(
    monitor: Arc<ConnectivityMonitor>,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
) -> CancelHandle {
    let task = tokio::spawn(async move {
        loop {
            let online = probe.probe().await;
            monitor.report(online);
            tokio::time::sleep(interval).await;
        }
    });
    let abort = task.abort_handle();
    CancelHandle::new(move || abort.abort())
}
