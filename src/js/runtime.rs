use std::cell::Cell;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, Object, Runtime, Value};

/// Upper bound on promise jobs drained after one evaluation.
pub const DEFAULT_MAX_PENDING_JOBS: usize = 1000;

/// JavaScript runtime backed by QuickJS.
///
/// The engine owns the QuickJS runtime and context and provides helpers for evaluating
/// scripts. It also installs a minimal `console` implementation that forwards logs to
/// Rust tracing. Exceptions thrown by promise jobs or hooks invoked outside of a
/// script evaluation are counted as asynchronous errors instead of being lost.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
    max_pending_jobs: usize,
    async_errors: Cell<usize>,
}

impl QuickJsEngine {
    /// Create a new QuickJS engine with `console.log` wired up to `tracing`.
    pub fn new() -> Result<Self> {
        Self::with_job_limit(DEFAULT_MAX_PENDING_JOBS)
    }

    pub fn with_job_limit(max_pending_jobs: usize) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let engine = Self {
            runtime,
            context,
            max_pending_jobs: max_pending_jobs.max(1),
            async_errors: Cell::new(0),
        };
        engine.init_globals()?;
        Ok(engine)
    }

    /// Evaluate a script and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script and convert the result into `V`.
    ///
    /// Promise jobs queued by the script are drained afterwards; their failures
    /// do not fail the evaluation.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = Self::with_source_url(source, filename);
        let value = self
            .context
            .with(|ctx| ctx.eval::<V, _>(script))
            .map_err(|err| self.exception_to_error(err))?;

        self.run_pending_jobs();
        Ok(value)
    }

    /// Call `globalThis[object][method](arg)` and drain the jobs it queued.
    pub fn call_method(&self, object: &str, method: &str, arg: u32) -> Result<()> {
        self.context
            .with(|ctx| -> rquickjs::Result<()> {
                let target: Object = ctx.globals().get(object)?;
                let function: Function = target.get(method)?;
                function.call::<_, ()>((arg,))
            })
            .map_err(|err| self.exception_to_error(err))?;

        self.run_pending_jobs();
        Ok(())
    }

    /// Execute pending jobs in the QuickJS job queue.
    ///
    /// Returns how many jobs ran. A job that throws is logged, counted and
    /// skipped; draining stops after the configured limit.
    pub fn run_pending_jobs(&self) -> usize {
        let mut job_count = 0;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= self.max_pending_jobs {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            self.max_pending_jobs
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(_) => {
                    job_count += 1;
                    let message = self
                        .context
                        .with(|ctx| capture_exception_message(&ctx))
                        .unwrap_or_else(|| "QuickJS job exception".to_string());
                    self.record_async_error(&message);
                }
            }
        }

        if job_count > 0 {
            tracing::debug!(target: "quickjs", "Executed {} pending jobs", job_count);
        }
        job_count
    }

    /// Number of errors raised outside a script evaluation so far.
    pub fn async_errors(&self) -> usize {
        self.async_errors.get()
    }

    pub(crate) fn record_async_error(&self, message: &str) {
        self.async_errors.set(self.async_errors.get() + 1);
        tracing::error!(target: "quickjs", error = %message, "asynchronous script error");
    }

    /// Provide access to the underlying QuickJS context for advanced integrations.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }

    fn exception_to_error(&self, err: JsError) -> anyhow::Error {
        match err {
            JsError::Exception => {
                let message = self
                    .context
                    .with(|ctx| capture_exception_message(&ctx))
                    .unwrap_or_else(|| "QuickJS exception".to_string());
                anyhow::anyhow!(message)
            }
            other => anyhow::Error::from(other),
        }
    }

    fn init_globals(&self) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn =
                    Function::new(ctx.clone(), log_from_js)?.with_name("__sandbox_log")?;
                global.set("__sandbox_log", log_fn)?;

                ctx.eval::<(), _>(GLOBAL_ALIASES.as_bytes())?;
                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

fn log_from_js(message: String) -> rquickjs::Result<()> {
    tracing::info!(target: "quickjs", message = %message);
    Ok(())
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();
    if exception.is_undefined() {
        return None;
    }

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            let name = obj
                .get::<_, String>("name")
                .unwrap_or_else(|_| "Error".to_string());
            return Some(format!("{name}: {message}"));
        }
    }
    if let Some(text) = exception.as_string().and_then(|s| s.to_string().ok()) {
        return Some(text);
    }

    Some(format!("{:?}", exception))
}

const GLOBAL_ALIASES: &str = r#"
(() => {
    const global = globalThis;
    if (typeof global.window === 'undefined') { global.window = global; }
    if (typeof global.self === 'undefined') { global.self = global; }
})();
"#;

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logImpl = (...args) => {
        try {
            global.__sandbox_log(args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logImpl;
    global.console.error = logImpl;
    global.console.warn = logImpl;
    global.console.info = logImpl;
    global.console.debug = logImpl;
})();
"#;
