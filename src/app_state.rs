//! Foreground/background state of the host application.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Whether the application is currently in interactive use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Foreground,
    Background,
}

impl AppState {
    pub fn is_foreground(&self) -> bool {
        matches!(self, Self::Foreground)
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Foreground => write!(f, "foreground"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// Tracks the latest application state reported by the host.
pub struct AppStateMonitor {
    tx: watch::Sender<AppState>,
}

impl AppStateMonitor {
    pub fn new(initial: AppState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Record a transition. Returns the previous state.
    pub fn set(&self, state: AppState) -> AppState {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "App state changed");
        }
        previous
    }

    pub fn current(&self) -> AppState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}

impl Default for AppStateMonitor {
    fn default() -> Self {
        Self::new(AppState::Background)
    }
}
