pub mod dom;
pub mod environment;
pub mod phase;
pub mod processor;
pub mod runtime;
pub mod script;
pub mod script_fetcher;
pub mod sequencer;
pub mod session;
pub mod timers;
pub mod writer;

pub use dom::ContentDocument;
pub use environment::SandboxEnvironment;
pub use phase::{PhaseTracker, RenderPhase};
pub use runtime::QuickJsEngine;
pub use script::{DiscoveredScript, ScriptError, ScriptOrder, ScriptRecord, ScriptStatus, ScriptTask};
pub use script_fetcher::{FetchError, FetchScript, ScriptFetcher};
pub use sequencer::{DrainReport, ScriptEngine, Sequencer};
pub use session::{SandboxSession, SessionReport};
pub use writer::DocumentWriter;
