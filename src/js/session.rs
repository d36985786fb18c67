use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use super::dom::ContentDocument;
use super::environment::SandboxEnvironment;
use super::phase::{PhaseTracker, RenderPhase};
use super::processor::{collect_scripts, MaterializedScript};
use super::script::ScriptRecord;
use super::script_fetcher::FetchScript;
use super::sequencer::{DrainReport, ScriptEngine, Sequencer};
use crate::bridge::{actions, Capability, ContextPort, HostBridge, LoadedSummary};
use crate::config::SandboxConfig;
use crate::storage::StorageShim;

/// What happened while a session ran.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub executed: usize,
    pub errored: usize,
    pub async_errors: usize,
    /// Why host capabilities were disabled, if they were.
    pub degraded: Option<String>,
    pub records: Vec<ScriptRecord>,
}

impl SessionReport {
    pub fn summary(&self) -> LoadedSummary {
        LoadedSummary {
            executed: self.executed,
            errored: self.errored,
            async_errors: self.async_errors,
        }
    }
}

/// Runs one content document inside a sandbox environment.
pub struct SandboxSession {
    environment: SandboxEnvironment,
    sequencer: Sequencer,
    tracker: PhaseTracker,
    records: Vec<ScriptRecord>,
    loaded: bool,
}

impl SandboxSession {
    /// Connect to the host (if any), materialize `html` and register its
    /// scripts. Nothing runs until [`SandboxSession::run`].
    ///
    /// A host that never answers the handshake does not fail the session;
    /// storage and messaging are disabled instead.
    pub async fn bootstrap(
        html: &str,
        port: Option<ContextPort>,
        fetcher: Rc<dyn FetchScript>,
        config: &SandboxConfig,
    ) -> Result<Self> {
        let (bridge, storage) = connect(port, config).await;

        let document = ContentDocument::parse(html);
        let scripts = collect_scripts(&document);
        let environment =
            SandboxEnvironment::new(document, storage, bridge, config.max_pending_jobs)
                .context("failed to create sandbox environment")?;

        let mut sequencer = Sequencer::new(fetcher);
        for MaterializedScript { phase, script } in scripts {
            sequencer.register(phase, script);
        }
        info!(
            target: "sandbox::session",
            scripts = sequencer.pending(),
            degraded = !environment.bridge().is_available(),
            "session bootstrapped"
        );

        Ok(Self {
            environment,
            sequencer,
            tracker: PhaseTracker::new(),
            records: Vec::new(),
            loaded: false,
        })
    }

    /// Execute every script in order, releasing the body once the head is
    /// done, then report the load to the host.
    pub async fn run(&mut self) -> SessionReport {
        if self.loaded {
            return self.report();
        }

        let head = self.sequencer.drain_phase(&self.environment).await;
        self.absorb(head);
        if !self.sequencer.head_complete() {
            warn!(target: "sandbox::session", "head tasks outstanding after head drain");
        }
        self.advance(RenderPhase::Body);

        let body = self.sequencer.drain_all(&self.environment).await;
        self.absorb(body);

        self.environment.finish_parsing();
        self.run_written().await;
        self.advance(RenderPhase::Complete);

        self.loaded = true;
        let report = self.report();
        if let Some(bridge) = self.environment.bridge().available() {
            let summary = report.summary();
            bridge.send(
                actions::CONTENT_LOADED,
                json!({
                    "executed": summary.executed,
                    "errored": summary.errored,
                    "async_errors": summary.async_errors,
                }),
            );
        }
        info!(
            target: "sandbox::session",
            executed = report.executed,
            errored = report.errored,
            "content loaded"
        );
        report
    }

    /// Keep the event loop going for up to `duration`: due timers run, and
    /// scripts they write are sequenced like any other.
    ///
    /// Returns early when no timers remain.
    pub async fn settle(&mut self, duration: Duration) -> SessionReport {
        let deadline = Instant::now() + duration;
        self.environment.pump();
        self.run_written().await;

        while self.environment.has_pending_timers() {
            tokio::select! {
                _ = self.environment.timers_due() => {}
                _ = sleep_until(deadline) => break,
            }
            self.environment.pump();
            self.run_written().await;
        }

        self.report()
    }

    pub fn phase(&self) -> watch::Receiver<RenderPhase> {
        self.tracker.subscribe()
    }

    pub fn current_phase(&self) -> RenderPhase {
        self.tracker.current()
    }

    /// Whether every head script reached a terminal status.
    pub fn body_released(&self) -> bool {
        self.tracker.body_released()
    }

    pub fn environment(&self) -> &SandboxEnvironment {
        &self.environment
    }

    pub fn degraded(&self) -> Option<&str> {
        self.environment.bridge().reason()
    }

    pub fn document_html(&self) -> String {
        self.environment.document_html()
    }

    pub fn report(&self) -> SessionReport {
        let executed = self.records.iter().filter(|record| record.executed()).count();
        SessionReport {
            executed,
            errored: self.records.len() - executed,
            async_errors: self.environment.async_errors(),
            degraded: self.degraded().map(str::to_string),
            records: self.records.clone(),
        }
    }

    async fn run_written(&mut self) {
        loop {
            let written = self.environment.take_discovered();
            if written.is_empty() {
                break;
            }
            self.sequencer.register_late(self.tracker.current(), written);
            let report = self.sequencer.drain_all(&self.environment).await;
            self.absorb(report);
        }
    }

    fn absorb(&mut self, report: DrainReport) {
        if let Some(bridge) = self.environment.bridge().available() {
            for record in report.records.iter().filter(|record| !record.executed()) {
                bridge.send(
                    actions::SCRIPT_ERROR,
                    json!({
                        "id": record.id,
                        "src": record.label,
                        "message": record.error.clone().unwrap_or_default(),
                    }),
                );
            }
        }
        self.records.extend(report.records);
    }

    fn advance(&self, phase: RenderPhase) {
        if !self.tracker.advance(phase) {
            return;
        }
        if let Some(bridge) = self.environment.bridge().available() {
            bridge.send(actions::RENDER_PHASE, json!({ "phase": phase.as_str() }));
        }
    }
}

async fn connect(
    port: Option<ContextPort>,
    config: &SandboxConfig,
) -> (Capability<HostBridge>, Capability<StorageShim>) {
    let Some(port) = port else {
        warn!(target: "sandbox::session", "no host port; running without host capabilities");
        return (
            Capability::unavailable("no host port"),
            Capability::unavailable("no host port"),
        );
    };

    let bridge = HostBridge::new(port);
    match bridge
        .handshake(config.handshake_attempts, config.handshake_timeout())
        .await
    {
        Ok(ack) => {
            let storage = StorageShim::seeded(bridge.clone(), ack.storage);
            (Capability::Available(bridge), Capability::Available(storage))
        }
        Err(err) => {
            warn!(target: "sandbox::session", error = %err, "host handshake failed; degrading");
            let reason = err.to_string();
            (
                Capability::unavailable(reason.clone()),
                Capability::unavailable(reason),
            )
        }
    }
}
