use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Coarse gating state for revealing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderPhase {
    /// Head scripts are still running; body content is withheld.
    Head,
    /// Every head script reached a terminal status.
    Body,
    /// Every script in the document reached a terminal status.
    Complete,
}

impl Default for RenderPhase {
    fn default() -> Self {
        Self::Head
    }
}

impl RenderPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Body => "body",
            Self::Complete => "complete",
        }
    }

    fn successor(self) -> Option<Self> {
        match self {
            Self::Head => Some(Self::Body),
            Self::Body => Some(Self::Complete),
            Self::Complete => None,
        }
    }
}

/// Forward-only render phase, observable through a watch channel.
pub struct PhaseTracker {
    tx: watch::Sender<RenderPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RenderPhase::Head);
        Self { tx }
    }

    pub fn current(&self) -> RenderPhase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RenderPhase> {
        self.tx.subscribe()
    }

    pub fn body_released(&self) -> bool {
        self.current() >= RenderPhase::Body
    }

    /// Move to `next` if it is the immediate successor of the current phase.
    pub fn advance(&self, next: RenderPhase) -> bool {
        let current = self.current();
        if current.successor() != Some(next) {
            warn!(
                target: "sandbox::phase",
                from = current.as_str(),
                to = next.as_str(),
                "refusing render phase transition"
            );
            return false;
        }
        self.tx.send_replace(next);
        debug!(target: "sandbox::phase", phase = next.as_str(), "render phase advanced");
        true
    }
}
