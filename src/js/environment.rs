use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context as AnyhowContext, Result};
use futures_util::future::LocalBoxFuture;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, IntoJs, Value};
use serde_json::{json, Value as JsonValue};
use tokio::runtime::Handle;

use super::dom::ContentDocument;
use super::runtime::QuickJsEngine;
use super::script::{DiscoveredScript, ScriptError, ScriptTask};
use super::sequencer::ScriptEngine;
use super::timers::TimerManager;
use super::writer::DocumentWriter;
use crate::bridge::{actions, Capability, HostBridge};
use crate::storage::{StorageEntry, StorageShim};

/// The restricted context content runs in.
///
/// Owns the QuickJS engine and installs the only privileged surface content
/// can reach: the storage shim, the document writer, timers and a
/// fire-and-forget `sandbox.send`.
pub struct SandboxEnvironment {
    engine: QuickJsEngine,
    writer: Rc<RefCell<DocumentWriter>>,
    storage: Rc<RefCell<Capability<StorageShim>>>,
    bridge: Capability<HostBridge>,
    timers: Rc<TimerManager>,
}

impl SandboxEnvironment {
    pub fn new(
        document: ContentDocument,
        storage: Capability<StorageShim>,
        bridge: Capability<HostBridge>,
        max_pending_jobs: usize,
    ) -> Result<Self> {
        let handle =
            Handle::try_current().context("sandbox environment needs a running tokio runtime")?;
        let engine = QuickJsEngine::with_job_limit(max_pending_jobs)?;
        let writer = Rc::new(RefCell::new(DocumentWriter::new(document)));
        let storage = Rc::new(RefCell::new(storage));
        let timers = Rc::new(TimerManager::new(handle));

        install_bindings(
            &engine,
            Rc::clone(&writer),
            Rc::clone(&storage),
            bridge.clone(),
            Rc::clone(&timers),
        )
        .context("failed to install sandbox bindings")?;

        Ok(Self {
            engine,
            writer,
            storage,
            bridge,
            timers,
        })
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.engine.eval(source, filename)
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.engine.eval_with(source, filename)
    }

    /// Run due timer callbacks and pending jobs until neither has work left.
    /// Returns the number of timer callbacks invoked.
    pub fn pump(&self) -> usize {
        let mut callbacks = 0;
        loop {
            let fired = self.timers.take_fired();
            for id in &fired {
                if let Err(err) = self
                    .engine
                    .call_method("sandbox", "__invokeTimer", *id)
                {
                    self.engine
                        .record_async_error(&format!("timer {id} threw: {err}"));
                }
            }
            callbacks += fired.len();
            let jobs = self.engine.run_pending_jobs();
            if fired.is_empty() && jobs == 0 {
                break;
            }
        }
        callbacks
    }

    /// Resolves once a timer is due.
    pub async fn timers_due(&self) {
        self.timers.fired().await
    }

    pub fn has_pending_timers(&self) -> bool {
        self.timers.has_active_timers()
    }

    pub fn async_errors(&self) -> usize {
        self.engine.async_errors()
    }

    pub fn bridge(&self) -> &Capability<HostBridge> {
        &self.bridge
    }

    pub fn storage_entries(&self) -> Vec<StorageEntry> {
        self.storage
            .borrow()
            .available()
            .map(StorageShim::entries)
            .unwrap_or_default()
    }

    pub fn finish_parsing(&self) {
        self.writer.borrow_mut().finish_parsing();
    }

    pub fn document(&self) -> ContentDocument {
        self.writer.borrow().document().clone()
    }

    pub fn document_html(&self) -> String {
        self.writer.borrow().document().to_html()
    }
}

impl ScriptEngine for SandboxEnvironment {
    fn execute(&self, task: &ScriptTask, source: &str) -> Result<(), ScriptError> {
        self.writer.borrow_mut().begin_script(task.marker.as_ref());
        let result = self.engine.eval(source, &task.label());
        self.writer.borrow_mut().end_script();
        result.map_err(|err| ScriptError::Exception(err.to_string()))
    }

    fn take_discovered(&self) -> Vec<DiscoveredScript> {
        self.writer.borrow_mut().take_discovered()
    }

    fn idle_work(&self) -> LocalBoxFuture<'_, ()> {
        Box::pin(self.timers.fired())
    }

    fn run_idle_work(&self) {
        self.pump();
    }
}

fn install_bindings(
    engine: &QuickJsEngine,
    writer: Rc<RefCell<DocumentWriter>>,
    storage: Rc<RefCell<Capability<StorageShim>>>,
    bridge: Capability<HostBridge>,
    timers: Rc<TimerManager>,
) -> Result<()> {
    engine.with_context(|ctx| {
        let global = ctx.globals();

        // Storage
        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(ctx.clone(), move |_ctx: Ctx<'_>| -> rquickjs::Result<u32> {
                Ok(storage_ref.borrow().len() as u32)
            })?
            .with_name("__sandbox_storage_length")?;
            global.set("__sandbox_storage_length", func)?;
        }

        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(
                ctx.clone(),
                move |index: f64| -> rquickjs::Result<Option<String>> {
                    Ok(storage_ref
                        .borrow()
                        .key(storage_index(index))
                        .map(str::to_string))
                },
            )?
            .with_name("__sandbox_storage_key")?;
            global.set("__sandbox_storage_key", func)?;
        }

        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(
                ctx.clone(),
                move |key: String| -> rquickjs::Result<Option<String>> {
                    Ok(storage_ref.borrow().get_item(&key).map(str::to_string))
                },
            )?
            .with_name("__sandbox_storage_get")?;
            global.set("__sandbox_storage_get", func)?;
        }

        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(
                ctx.clone(),
                move |key: String, value: String| -> rquickjs::Result<()> {
                    storage_ref.borrow_mut().set_item(&key, &value);
                    Ok(())
                },
            )?
            .with_name("__sandbox_storage_set")?;
            global.set("__sandbox_storage_set", func)?;
        }

        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<()> {
                storage_ref.borrow_mut().remove_item(&key);
                Ok(())
            })?
            .with_name("__sandbox_storage_remove")?;
            global.set("__sandbox_storage_remove", func)?;
        }

        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(ctx.clone(), move |_ctx: Ctx<'_>| -> rquickjs::Result<()> {
                storage_ref.borrow_mut().clear();
                Ok(())
            })?
            .with_name("__sandbox_storage_clear")?;
            global.set("__sandbox_storage_clear", func)?;
        }

        {
            let storage_ref = Rc::clone(&storage);
            let func = Function::new(
                ctx.clone(),
                move |_ctx: Ctx<'_>| -> rquickjs::Result<Vec<String>> {
                    Ok(storage_ref.borrow().keys())
                },
            )?
            .with_name("__sandbox_storage_keys")?;
            global.set("__sandbox_storage_keys", func)?;
        }

        // Document stream
        {
            let writer_ref = Rc::clone(&writer);
            let func = Function::new(ctx.clone(), move |markup: String| -> rquickjs::Result<()> {
                writer_ref.borrow_mut().write(&markup);
                Ok(())
            })?
            .with_name("__sandbox_document_write")?;
            global.set("__sandbox_document_write", func)?;
        }

        {
            let writer_ref = Rc::clone(&writer);
            let func = Function::new(ctx.clone(), move |_ctx: Ctx<'_>| -> rquickjs::Result<()> {
                writer_ref.borrow_mut().open();
                Ok(())
            })?
            .with_name("__sandbox_document_open")?;
            global.set("__sandbox_document_open", func)?;
        }

        {
            let writer_ref = Rc::clone(&writer);
            let func = Function::new(ctx.clone(), move |_ctx: Ctx<'_>| -> rquickjs::Result<()> {
                writer_ref.borrow_mut().close();
                Ok(())
            })?
            .with_name("__sandbox_document_close")?;
            global.set("__sandbox_document_close", func)?;
        }

        {
            let writer_ref = Rc::clone(&writer);
            let func = Function::new(
                ctx.clone(),
                move |_ctx: Ctx<'_>| -> rquickjs::Result<String> {
                    let state = if writer_ref.borrow().is_parsing_complete() {
                        "complete"
                    } else {
                        "loading"
                    };
                    Ok(state.to_string())
                },
            )?
            .with_name("__sandbox_document_ready_state")?;
            global.set("__sandbox_document_ready_state", func)?;
        }

        // Host messages
        {
            let bridge_ref = bridge.clone();
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, name: String, payload: Opt<String>| -> rquickjs::Result<bool> {
                    let Some(bridge) = bridge_ref.available() else {
                        tracing::debug!(target: "sandbox::bridge", command = %name, "host unavailable; command dropped");
                        return Ok(false);
                    };
                    let payload = match payload.0 {
                        Some(raw) => match serde_json::from_str::<JsonValue>(&raw) {
                            Ok(value) => value,
                            Err(err) => {
                                return throw_error(&ctx, format!("invalid command payload: {err}"))
                            }
                        },
                        None => JsonValue::Null,
                    };
                    bridge.send(actions::COMMAND, json!({ "name": name, "payload": payload }));
                    Ok(true)
                },
            )?
            .with_name("__sandbox_bridge_send")?;
            global.set("__sandbox_bridge_send", func)?;
        }

        {
            let available = bridge.is_available();
            let func = Function::new(ctx.clone(), move |_ctx: Ctx<'_>| -> rquickjs::Result<bool> {
                Ok(available)
            })?
            .with_name("__sandbox_bridge_available")?;
            global.set("__sandbox_bridge_available", func)?;
        }

        // Timers
        {
            let timers_ref = Rc::clone(&timers);
            let func = Function::new(
                ctx.clone(),
                move |delay_ms: f64, repeating: bool| -> rquickjs::Result<u32> {
                    Ok(timers_ref.register(delay_ms.max(0.0), repeating))
                },
            )?
            .with_name("__sandbox_schedule_timer")?;
            global.set("__sandbox_schedule_timer", func)?;
        }

        {
            let timers_ref = Rc::clone(&timers);
            let func = Function::new(
                ctx.clone(),
                move |id: f64| -> rquickjs::Result<()> {
                    timers_ref.clear(id as u32);
                    Ok(())
                },
            )?
            .with_name("__sandbox_cancel_timer")?;
            global.set("__sandbox_cancel_timer", func)?;
        }

        match ctx.eval::<(), _>(SANDBOX_BOOTSTRAP.as_bytes()) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let rquickjs::Error::Exception = err {
                    let value: Value<'_> = ctx.catch();
                    tracing::error!(target: "quickjs", "sandbox bootstrap failed: {:?}", value);
                }
                Err(err)
            }
        }
    })
}

/// WebIDL `unsigned long` conversion: NaN and infinities become 0, anything
/// else wraps modulo 2^32.
fn storage_index(value: f64) -> usize {
    if !value.is_finite() {
        return 0;
    }
    value.trunc().rem_euclid(4_294_967_296.0) as usize
}

fn throw_error<T>(ctx: &Ctx<'_>, message: String) -> rquickjs::Result<T> {
    tracing::warn!(target: "quickjs", "{message}");
    let value = message.into_js(ctx)?;
    Err(ctx.throw(value))
}

const SANDBOX_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;

    const native = {
        length: global.__sandbox_storage_length,
        key: global.__sandbox_storage_key,
        get: global.__sandbox_storage_get,
        set: global.__sandbox_storage_set,
        remove: global.__sandbox_storage_remove,
        clear: global.__sandbox_storage_clear,
        keys: global.__sandbox_storage_keys,
    };

    const orNull = (value) => (value === undefined ? null : value);

    const storageMethods = {
        key(index) {
            return orNull(native.key(Number(index)));
        },
        getItem(key) {
            return orNull(native.get(String(key)));
        },
        setItem(key, value) {
            native.set(String(key), String(value));
        },
        removeItem(key) {
            native.remove(String(key));
        },
        clear() {
            native.clear();
        },
    };

    const isBuiltin = (prop) =>
        prop === 'length' || Object.prototype.hasOwnProperty.call(storageMethods, prop);

    const localStorage = new Proxy({}, {
        get(target, prop) {
            if (typeof prop === 'symbol') {
                return prop === Symbol.toStringTag ? 'Storage' : undefined;
            }
            if (prop === 'length') {
                return native.length();
            }
            if (Object.prototype.hasOwnProperty.call(storageMethods, prop)) {
                return storageMethods[prop];
            }
            return native.get(prop);
        },
        set(target, prop, value) {
            if (typeof prop === 'symbol') {
                return false;
            }
            native.set(prop, String(value));
            return true;
        },
        deleteProperty(target, prop) {
            if (typeof prop !== 'symbol') {
                native.remove(prop);
            }
            return true;
        },
        has(target, prop) {
            if (typeof prop === 'symbol') {
                return false;
            }
            return isBuiltin(prop) || native.get(prop) !== undefined;
        },
        ownKeys() {
            return native.keys();
        },
        getOwnPropertyDescriptor(target, prop) {
            if (typeof prop === 'symbol') {
                return undefined;
            }
            const value = native.get(prop);
            if (value === undefined) {
                return undefined;
            }
            return { value, writable: true, enumerable: true, configurable: true };
        },
    });

    Object.defineProperty(global, 'localStorage', {
        value: localStorage,
        enumerable: true,
        configurable: false,
        writable: false,
    });

    const document = typeof global.document === 'object' && global.document !== null
        ? global.document
        : {};
    const joinMarkup = (args) => Array.prototype.map.call(args, String).join('');
    document.write = function (...args) {
        global.__sandbox_document_write(joinMarkup(args));
    };
    document.writeln = function (...args) {
        global.__sandbox_document_write(joinMarkup(args) + '\n');
    };
    document.open = function () {
        global.__sandbox_document_open();
        return document;
    };
    document.close = function () {
        global.__sandbox_document_close();
    };
    Object.defineProperty(document, 'readyState', {
        get() {
            return global.__sandbox_document_ready_state();
        },
        configurable: true,
    });
    global.document = document;

    const TIMER_STORE = new Map();
    const scheduleNativeTimer = global.__sandbox_schedule_timer;
    const cancelNativeTimer = global.__sandbox_cancel_timer;

    function normalizeDelay(value) {
        const num = Number(value);
        if (!Number.isFinite(num) || num < 0) {
            return 0;
        }
        return num;
    }

    function scheduleTimer(callback, delay, repeating, args) {
        let handler = callback;
        if (typeof handler === 'string') {
            const code = handler;
            handler = () => (0, eval)(code);
        }
        if (typeof handler !== 'function') {
            throw new TypeError('Timer callback must be a function');
        }
        const id = scheduleNativeTimer(normalizeDelay(delay), !!repeating);
        TIMER_STORE.set(id, { callback: handler, args, repeating: !!repeating });
        return id;
    }

    function cancelTimer(id) {
        const num = Math.trunc(Number(id));
        if (!Number.isFinite(num) || num <= 0) {
            return;
        }
        TIMER_STORE.delete(num);
        cancelNativeTimer(num);
    }

    global.setTimeout = (callback, delay, ...args) => scheduleTimer(callback, delay, false, args);
    global.setInterval = (callback, delay, ...args) => scheduleTimer(callback, delay, true, args);
    global.clearTimeout = cancelTimer;
    global.clearInterval = cancelTimer;

    const sandbox = {
        get available() {
            return global.__sandbox_bridge_available();
        },
        send(name, payload) {
            const encoded = JSON.stringify(payload);
            return encoded === undefined
                ? global.__sandbox_bridge_send(String(name))
                : global.__sandbox_bridge_send(String(name), encoded);
        },
        __invokeTimer(id) {
            const entry = TIMER_STORE.get(id);
            if (!entry) {
                return;
            }
            if (!entry.repeating) {
                TIMER_STORE.delete(id);
            }
            entry.callback.apply(global, entry.args);
        },
    };
    Object.defineProperty(global, 'sandbox', {
        value: Object.freeze(sandbox),
        enumerable: false,
        configurable: false,
        writable: false,
    });
})();
"#;
