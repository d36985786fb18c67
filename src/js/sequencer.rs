use std::collections::{BTreeMap, HashMap};
use std::future::pending;
use std::rc::Rc;
use std::time::Instant;

use futures_util::future::LocalBoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::phase::RenderPhase;
use super::script::{
    DiscoveredScript, ScriptError, ScriptOrder, ScriptRecord, ScriptSource, ScriptStatus,
    ScriptTask,
};
use super::script_fetcher::{FetchError, FetchScript};

/// What the sequencer needs from whoever actually runs script code.
pub trait ScriptEngine {
    /// Run one task to completion. Must not return before the code finished.
    fn execute(&self, task: &ScriptTask, source: &str) -> Result<(), ScriptError>;

    /// Scripts that appeared in output written since the last call.
    fn take_discovered(&self) -> Vec<DiscoveredScript> {
        Vec::new()
    }

    /// Resolves when there is work (timers) that may run while the cursor
    /// waits on a fetch.
    fn idle_work(&self) -> LocalBoxFuture<'_, ()> {
        Box::pin(pending())
    }

    fn run_idle_work(&self) {}
}

type FetchFuture = LocalBoxFuture<'static, (ScriptOrder, Result<String, FetchError>)>;

enum Wake {
    Fetched(ScriptOrder, Result<String, FetchError>),
    Idle,
}

/// Outcome of one drain call, in execution order.
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    pub records: Vec<ScriptRecord>,
}

impl DrainReport {
    pub fn executed(&self) -> usize {
        self.records.iter().filter(|record| record.executed()).count()
    }

    pub fn errored(&self) -> usize {
        self.records.len() - self.executed()
    }
}

/// Runs registered scripts one at a time in document order.
///
/// External sources start downloading as soon as they are registered, but
/// the cursor only ever moves to the next task once the current one is
/// executed or errored. A failure is recorded and the cursor moves on.
pub struct Sequencer {
    fetcher: Rc<dyn FetchScript>,
    queue: BTreeMap<ScriptOrder, ScriptTask>,
    in_flight: FuturesUnordered<FetchFuture>,
    next_position: u32,
    written: HashMap<ScriptOrder, u32>,
    next_id: usize,
    last_executed: Option<ScriptOrder>,
    head_outstanding: usize,
}

impl Sequencer {
    pub fn new(fetcher: Rc<dyn FetchScript>) -> Self {
        Self {
            fetcher,
            queue: BTreeMap::new(),
            in_flight: FuturesUnordered::new(),
            next_position: 0,
            written: HashMap::new(),
            next_id: 0,
            last_executed: None,
            head_outstanding: 0,
        }
    }

    /// Register a script found while materializing the document.
    pub fn register(&mut self, phase: RenderPhase, script: DiscoveredScript) -> ScriptOrder {
        let order = ScriptOrder::top_level(self.next_position);
        self.next_position += 1;
        self.enqueue(order.clone(), phase, script);
        order
    }

    /// Register scripts written by the task at `parent`; they run right after
    /// it and whatever it wrote before, ahead of the parent's next sibling.
    pub fn register_nested(
        &mut self,
        parent: &ScriptOrder,
        phase: RenderPhase,
        scripts: Vec<DiscoveredScript>,
    ) {
        for script in scripts {
            let index = {
                let slot = self.written.entry(parent.clone()).or_insert(0);
                *slot += 1;
                *slot
            };
            let order = parent.child(index);
            debug!(target: "sandbox::sequencer", ?parent, ?order, "registered written script");
            self.enqueue(order, phase, script);
        }
    }

    /// Register scripts written outside a running task (timers, post-load
    /// handlers). They follow the most recently executed task.
    pub fn register_late(&mut self, phase: RenderPhase, scripts: Vec<DiscoveredScript>) {
        if scripts.is_empty() {
            return;
        }
        let parent = self
            .last_executed
            .clone()
            .unwrap_or_else(|| ScriptOrder::top_level(0));
        self.register_nested(&parent, phase, scripts);
    }

    /// Number of tasks that have not reached a terminal status.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn head_complete(&self) -> bool {
        self.head_outstanding == 0
    }

    /// Drain every head task. Returns once none remain.
    pub async fn drain_phase(&mut self, engine: &dyn ScriptEngine) -> DrainReport {
        self.drain_until(engine, RenderPhase::Head).await
    }

    /// Drain everything that is queued, including scripts registered while
    /// draining.
    pub async fn drain_all(&mut self, engine: &dyn ScriptEngine) -> DrainReport {
        self.drain_until(engine, RenderPhase::Complete).await
    }

    async fn drain_until(&mut self, engine: &dyn ScriptEngine, limit: RenderPhase) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            let Some((order, task)) = self.queue.first_key_value() else {
                break;
            };
            let order = order.clone();
            if task.phase > limit {
                break;
            }

            match task.status() {
                ScriptStatus::Fetching => {
                    let phase = task.phase;
                    self.wait_for_cursor(engine, order, phase).await;
                }
                ScriptStatus::Errored => {
                    if let Some(task) = self.queue.remove(&order) {
                        report.records.push(self.retire(task, None, None));
                    }
                }
                _ => {
                    if let Some(record) = self.execute(engine, order) {
                        report.records.push(record);
                    }
                }
            }
        }

        report
    }

    fn enqueue(&mut self, order: ScriptOrder, phase: RenderPhase, script: DiscoveredScript) {
        let id = self.next_id;
        self.next_id += 1;
        let mut task = ScriptTask::new(id, order.clone(), phase, script);

        if let ScriptSource::External { src } = &task.source {
            let src = src.clone();
            task.transition(ScriptStatus::Fetching);
            let fetch = self.fetcher.fetch(&src);
            let key = order.clone();
            self.in_flight
                .push(Box::pin(async move { (key, fetch.await) }));
        }
        if phase == RenderPhase::Head {
            self.head_outstanding += 1;
        }
        debug!(target: "sandbox::sequencer", id, ?order, label = %task.label(), "script registered");
        self.queue.insert(order, task);
    }

    /// Suspend until the fetch at the cursor (or any other fetch) settles,
    /// letting timers run in between.
    async fn wait_for_cursor(
        &mut self,
        engine: &dyn ScriptEngine,
        cursor: ScriptOrder,
        phase: RenderPhase,
    ) {
        if self.in_flight.is_empty() {
            if let Some(task) = self.queue.get_mut(&cursor) {
                task.fail("fetch was never started".to_string());
            }
            return;
        }

        let wake = {
            let idle = engine.idle_work();
            tokio::select! {
                biased;
                Some((order, result)) = self.in_flight.next() => Wake::Fetched(order, result),
                _ = idle => Wake::Idle,
            }
        };

        match wake {
            Wake::Fetched(order, result) => self.complete_fetch(order, result),
            Wake::Idle => {
                engine.run_idle_work();
                let written = engine.take_discovered();
                self.register_late(phase, written);
            }
        }
    }

    fn complete_fetch(&mut self, order: ScriptOrder, result: Result<String, FetchError>) {
        let Some(task) = self.queue.get_mut(&order) else {
            return;
        };
        match result {
            Ok(body) => {
                debug!(target: "sandbox::sequencer", id = task.id, bytes = body.len(), "script fetched");
                task.fetched = Some(body);
                task.transition(ScriptStatus::Ready);
            }
            Err(err) => {
                let err = ScriptError::Fetch {
                    src: task.label(),
                    source: err,
                };
                warn!(target: "sandbox::sequencer", id = task.id, error = %err, "script fetch failed");
                task.fail(err.to_string());
            }
        }
    }

    fn execute(&mut self, engine: &dyn ScriptEngine, order: ScriptOrder) -> Option<ScriptRecord> {
        let mut task = self.queue.remove(&order)?;
        let fetched = task.fetched.take();
        let source = match &task.source {
            ScriptSource::Inline { code } => Some(code.clone()),
            ScriptSource::External { .. } => fetched,
        };
        let Some(source) = source else {
            task.fail("script body missing".to_string());
            return Some(self.retire(task, None, None));
        };

        task.transition(ScriptStatus::Executing);
        let started_at = Instant::now();
        let result = engine.execute(&task, &source);
        let finished_at = Instant::now();

        match result {
            Ok(()) => task.transition(ScriptStatus::Executed),
            Err(err) => {
                warn!(target: "sandbox::sequencer", id = task.id, label = %task.label(), error = %err, "script failed");
                task.fail(err.to_string());
            }
        }

        let written = engine.take_discovered();
        self.register_nested(&order, task.phase, written);
        self.last_executed = Some(order);

        Some(self.retire(task, Some(started_at), Some(finished_at)))
    }

    fn retire(
        &mut self,
        task: ScriptTask,
        started_at: Option<Instant>,
        finished_at: Option<Instant>,
    ) -> ScriptRecord {
        if task.phase == RenderPhase::Head {
            self.head_outstanding = self.head_outstanding.saturating_sub(1);
        }
        let kind = task.kind();
        let label = task.label();
        let status = task.status();
        ScriptRecord {
            id: task.id,
            order: task.order,
            phase: task.phase,
            kind,
            label,
            status,
            error: task.error,
            started_at,
            finished_at,
        }
    }
}
