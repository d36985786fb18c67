use std::time::Instant;

use kuchiki::NodeRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::phase::RenderPhase;
use super::script_fetcher::FetchError;

/// Minimal classification of the `type`/`language` attribute of a `<script>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    /// Traditional classic scripts (JavaScript).
    Classic,
    /// `<script type="module">`.
    Module,
    /// Unknown/unsupported type (templates, VBScript, data blocks).
    Unknown,
}

/// Whether the code ships inside the document or must be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    Inline,
    External,
}

/// Where the script source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptSource {
    Inline { code: String },
    External { src: String },
}

impl ScriptSource {
    pub fn kind(&self) -> ScriptKind {
        match self {
            Self::Inline { .. } => ScriptKind::Inline,
            Self::External { .. } => ScriptKind::External,
        }
    }

    /// Human readable reference used in logs and bridge diagnostics.
    pub fn label(&self, id: usize) -> String {
        match self {
            Self::Inline { .. } => format!("inline-script-{id}.js"),
            Self::External { src } => src.clone(),
        }
    }
}

/// Position of a task in document order.
///
/// `position` is assigned when the document is materialized. Scripts that a
/// running script writes into the document extend its `nested` path by one
/// index, so they run after it, after anything written earlier by the same
/// script, and before its next sibling. Comparison is lexicographic; an
/// order is never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScriptOrder {
    pub position: u32,
    pub nested: Vec<u32>,
}

impl ScriptOrder {
    pub fn top_level(position: u32) -> Self {
        Self {
            position,
            nested: Vec::new(),
        }
    }

    /// The order of the `index`-th script written by this one (1-based).
    pub fn child(&self, index: u32) -> Self {
        let mut nested = self.nested.clone();
        nested.push(index);
        Self {
            position: self.position,
            nested,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptStatus {
    Discovered,
    Fetching,
    Ready,
    Executing,
    Executed,
    Errored,
}

impl ScriptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Errored)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Discovered => 0,
            Self::Fetching => 1,
            Self::Ready => 2,
            Self::Executing => 3,
            Self::Executed | Self::Errored => 4,
        }
    }

    /// Status only moves forward; `Errored` may be entered from any
    /// non-terminal status.
    pub fn can_advance_to(self, next: ScriptStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Errored => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// A script reference found while materializing content, not yet ordered.
#[derive(Debug, Clone)]
pub struct DiscoveredScript {
    pub source: ScriptSource,
    /// The `<script>` element; document writes land right after it.
    pub marker: Option<NodeRef>,
}

impl DiscoveredScript {
    pub fn inline(code: impl Into<String>) -> Self {
        Self {
            source: ScriptSource::Inline { code: code.into() },
            marker: None,
        }
    }

    pub fn external(src: impl Into<String>) -> Self {
        Self {
            source: ScriptSource::External { src: src.into() },
            marker: None,
        }
    }
}

/// One unit of ordered script work.
#[derive(Debug)]
pub struct ScriptTask {
    pub id: usize,
    pub order: ScriptOrder,
    pub phase: RenderPhase,
    pub source: ScriptSource,
    pub marker: Option<NodeRef>,
    pub(crate) status: ScriptStatus,
    pub(crate) error: Option<String>,
    pub(crate) fetched: Option<String>,
}

impl ScriptTask {
    pub(crate) fn new(id: usize, order: ScriptOrder, phase: RenderPhase, script: DiscoveredScript) -> Self {
        Self {
            id,
            order,
            phase,
            source: script.source,
            marker: script.marker,
            status: ScriptStatus::Discovered,
            error: None,
            fetched: None,
        }
    }

    pub fn kind(&self) -> ScriptKind {
        self.source.kind()
    }

    pub fn status(&self) -> ScriptStatus {
        self.status
    }

    pub fn label(&self) -> String {
        self.source.label(self.id)
    }

    pub(crate) fn transition(&mut self, next: ScriptStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "script {} cannot move from {:?} to {:?}",
            self.id,
            self.status,
            next
        );
        self.status = next;
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.transition(ScriptStatus::Errored);
    }
}

/// Summary of a task once it left the queue.
#[derive(Debug, Clone)]
pub struct ScriptRecord {
    pub id: usize,
    pub order: ScriptOrder,
    pub phase: RenderPhase,
    pub kind: ScriptKind,
    pub label: String,
    pub status: ScriptStatus,
    pub error: Option<String>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl ScriptRecord {
    pub fn executed(&self) -> bool {
        self.status == ScriptStatus::Executed
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("uncaught exception: {0}")]
    Exception(String),
    #[error("failed to load {src}: {source}")]
    Fetch {
        src: String,
        #[source]
        source: FetchError,
    },
}
