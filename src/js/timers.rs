use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct TimerEntry {
    repeating: bool,
    task: JoinHandle<()>,
}

/// Backs `setTimeout`/`setInterval` with tokio tasks.
///
/// Each timer sleeps on the runtime and reports its id when due. Callbacks are
/// never invoked from the spawned task: the owner drains [`take_fired`] and
/// calls into the engine on the script thread.
///
/// [`take_fired`]: TimerManager::take_fired
pub struct TimerManager {
    handle: Handle,
    next_id: Cell<u32>,
    timers: RefCell<HashMap<u32, TimerEntry>>,
    fired_rx: RefCell<UnboundedReceiver<u32>>,
    fired_tx: UnboundedSender<u32>,
    due: RefCell<VecDeque<u32>>,
    notify: Arc<Notify>,
}

impl TimerManager {
    pub fn new(handle: Handle) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            handle,
            next_id: Cell::new(1),
            timers: RefCell::new(HashMap::new()),
            fired_rx: RefCell::new(rx),
            fired_tx: tx,
            due: RefCell::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    fn next_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1).max(1));
        id
    }

    pub fn has_active_timers(&self) -> bool {
        !self.timers.borrow().is_empty()
    }

    pub fn register(&self, delay_ms: f64, repeating: bool) -> u32 {
        let id = self.next_id();
        let mut duration = if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_secs_f64(delay_ms / 1_000.0)
        } else {
            Duration::ZERO
        };
        if repeating && duration.is_zero() {
            duration = Duration::from_millis(1);
        }

        let tx = self.fired_tx.clone();
        let notify = Arc::clone(&self.notify);
        let task = if repeating {
            self.handle.spawn(async move {
                loop {
                    sleep(duration).await;
                    if tx.send(id).is_err() {
                        break;
                    }
                    notify.notify_one();
                }
            })
        } else {
            self.handle.spawn(async move {
                sleep(duration).await;
                if tx.send(id).is_ok() {
                    notify.notify_one();
                }
            })
        };

        self.timers
            .borrow_mut()
            .insert(id, TimerEntry { repeating, task });
        tracing::trace!(target: "sandbox::timers", id, delay_ms, repeating, "timer registered");
        id
    }

    pub fn clear(&self, id: u32) {
        if let Some(entry) = self.timers.borrow_mut().remove(&id) {
            entry.task.abort();
        }
    }

    /// Ids of timers that came due since the last call, in firing order.
    ///
    /// One-shot timers are retired here; ids cleared after they fired are
    /// dropped.
    pub fn take_fired(&self) -> Vec<u32> {
        self.collect();
        let due: Vec<u32> = self.due.borrow_mut().drain(..).collect();

        let mut timers = self.timers.borrow_mut();
        due.into_iter()
            .filter(|id| match timers.get(id).map(|entry| entry.repeating) {
                Some(true) => true,
                Some(false) => {
                    timers.remove(id);
                    true
                }
                None => false,
            })
            .collect()
    }

    /// Resolves once at least one timer has fired and not been taken yet.
    pub async fn fired(&self) {
        loop {
            let notified = self.notify.notified();
            self.collect();
            if !self.due.borrow().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn collect(&self) {
        let mut rx = self.fired_rx.borrow_mut();
        let mut due = self.due.borrow_mut();
        while let Ok(id) = rx.try_recv() {
            due.push_back(id);
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for (_, entry) in self.timers.borrow_mut().drain() {
            entry.task.abort();
        }
    }
}
