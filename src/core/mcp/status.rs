use futures_util::future::select_ok;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::BridgeEvent;
use super::bridge::ToolBridge;

pub const DEFAULT_PROBE_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Aggregate reachability of the configured tool servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Connecting,
    Ready,
    Stopped,
    Unavailable,
}

impl ConnectivityStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "MCP connecting…",
            Self::Ready => "MCP connected",
            Self::Stopped => "MCP not connected",
            Self::Unavailable => "MCP unavailable",
        }
    }

    /// Ready and Unavailable never change once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Unavailable)
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// How long the active probe keeps trying after the monitor starts.
    pub window: Duration,
    pub interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_PROBE_WINDOW,
            interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// Shared write side of the status cell. Writes after cancellation are dropped.
#[derive(Clone)]
struct StatusCell {
    tx: Arc<watch::Sender<ConnectivityStatus>>,
    cancel: CancellationToken,
}

impl StatusCell {
    fn set(&self, next: ConnectivityStatus) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let changed = self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!("{}", next.label());
        }
        changed
    }

    fn get(&self) -> ConnectivityStatus {
        *self.tx.borrow()
    }
}

/// Watches the tool servers behind a bridge until stopped or dropped.
pub struct StatusMonitor {
    status: watch::Receiver<ConnectivityStatus>,
    cancel: CancellationToken,
    probe_done: CancellationToken,
}

impl StatusMonitor {
    /// Must be called inside a Tokio runtime. With no bridge the monitor settles on
    /// `Unavailable` immediately and spawns nothing.
    pub fn start(bridge: Option<Arc<dyn ToolBridge>>, settings: ProbeSettings) -> Self {
        let (tx, status) = watch::channel(ConnectivityStatus::Connecting);
        let cancel = CancellationToken::new();
        let probe_done = CancellationToken::new();

        let Some(bridge) = bridge else {
            tx.send_replace(ConnectivityStatus::Unavailable);
            probe_done.cancel();
            return Self {
                status,
                cancel,
                probe_done,
            };
        };

        let cell = StatusCell {
            tx: Arc::new(tx),
            cancel: cancel.clone(),
        };
        let deadline = Instant::now() + settings.window;

        // Subscribe before setup so notifications sent while servers start are not lost.
        let events = bridge.subscribe();
        tokio::spawn(listen_events(events, cell.clone()));
        let done = probe_done.clone();
        tokio::spawn(async move {
            let _done = done.drop_guard();
            probe(bridge, cell, settings, deadline).await;
        });

        Self {
            status,
            cancel,
            probe_done,
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.clone()
    }

    /// Resolves once setup and the active probe are over, including after `stop`. Push events
    /// may still change the status afterwards.
    pub async fn probe_finished(&self) {
        self.probe_done.cancelled().await;
    }

    /// Unregisters event handling and stops polling. In-flight calls finish unobserved.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen_events(mut events: broadcast::Receiver<BridgeEvent>, cell: StatusCell) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cell.cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(BridgeEvent::ToolsListChanged { id }) => {
                debug!("MCP [{}] reported its tools", id);
                cell.set(ConnectivityStatus::Ready);
            }
            Ok(BridgeEvent::Error { id, message }) => {
                debug!("MCP [{}] error: {}", id, message);
                cell.set(ConnectivityStatus::Stopped);
            }
            Ok(BridgeEvent::Close { id }) => {
                debug!("MCP [{}] closed", id);
                cell.set(ConnectivityStatus::Stopped);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("MCP status missed {} bridge events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn probe(
    bridge: Arc<dyn ToolBridge>,
    cell: StatusCell,
    settings: ProbeSettings,
    deadline: Instant,
) {
    let setup = tokio::select! {
        biased;
        _ = cell.cancel.cancelled() => return,
        setup = timeout_at(deadline, bridge.create_from_config()) => setup,
    };
    let ids = match setup {
        Ok(Ok(ids)) => ids,
        Ok(Err(e)) => {
            warn!("MCP setup failed: {}", e);
            cell.set(ConnectivityStatus::Stopped);
            return;
        }
        Err(_elapsed) => {
            warn!("MCP setup did not finish within {:?}", settings.window);
            cell.set(ConnectivityStatus::Stopped);
            return;
        }
    };
    if ids.is_empty() {
        debug!("No MCP servers configured");
        cell.set(ConnectivityStatus::Stopped);
        return;
    }

    while cell.get() != ConnectivityStatus::Ready {
        let started = Instant::now();
        if started >= deadline {
            break;
        }
        let attempt = select_ok(ids.iter().map(|id| bridge.list_tools(id)));
        let outcome = tokio::select! {
            biased;
            _ = cell.cancel.cancelled() => return,
            outcome = timeout_at(deadline, attempt) => outcome,
        };
        match outcome {
            Ok(Ok((tools, _rest))) => {
                debug!("MCP probe listed {} tools", tools.len());
                cell.set(ConnectivityStatus::Ready);
                return;
            }
            Ok(Err(e)) => debug!("MCP probe attempt failed: {}", e),
            Err(_elapsed) => break,
        }
        tokio::select! {
            biased;
            _ = cell.cancel.cancelled() => return,
            _ = sleep_until((started + settings.interval).min(deadline)) => {}
        }
    }

    if cell.get() != ConnectivityStatus::Ready {
        cell.set(ConnectivityStatus::Stopped);
    }
}
