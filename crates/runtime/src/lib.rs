//! The worker sandbox: an in-process QuickJS engine (`rquickjs`) exposing a
//! browser-shaped Web platform API surface to untrusted worker scripts.
//!
//! Grounded directly in `hyperlight-js-runtime::JsRuntime` — the guest-side
//! crate that owns the QuickJS `Context`, installs globals, and runs
//! handlers via `Context::with`/`Module::declare`/`Persistent<Function>`.
//! localflare keeps that exact shape (a `&mut self`, synchronous engine
//! driven by blocking `Promise::finish`, one engine instance reused across
//! calls) but drops the hyperlight guest/host VM split: there is no
//! separate host crate marshalling JSON across a VM boundary, and no
//! snapshot/restore cycle, since there's no hypervisor memory to restore.
//! Callers that need this off the async executor thread (e.g.
//! `localflare-pool`) run it inside `tokio::task::spawn_blocking`, exactly
//! as a CPU-bound synchronous engine call should be hosted.

mod execution;
mod metrics;
mod native;
mod script;
pub mod types;

pub use execution::ExecutionContext;
pub use localflare_common::{LocalflareError, Result};
pub use script::Script;
pub use types::{CfStub, FetchRequest, FetchResponse, QueueBatchInit, QueueBatchResult, QueueMessageInit};

use rquickjs::{CatchResultExt, Context, Ctx, Function, Module, Object, Runtime};
use tracing::{instrument, Level};

use crate::metrics::{ExecutionMetricGuard, RuntimeMetricsGuard};
use crate::native::NativeModuleLoader;

const BOOTSTRAP_SOURCE: &str = include_str!("js/bootstrap.js");
const BOOTSTRAP_MODULE_NAME: &str = "localflare:bootstrap";

/// A binding module installable into a runtime's globals before a worker
/// script runs. Implemented by `localflare-bindings`; kept as a trait here
/// so this crate doesn't depend on the binding crate's storage types.
pub trait BindingModule: Send {
    /// The global name this binding is exposed under in the worker script
    /// (e.g. `"MY_KV"`).
    fn binding_name(&self) -> &str;

    /// Install this binding's JS-facing object onto `globalThis`.
    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()>;
}

trait CatchJsErrorExt {
    type Ok;
    fn catch_into(self, ctx: &Ctx<'_>) -> Result<Self::Ok>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;
    fn catch_into(self, ctx: &Ctx<'_>) -> Result<T> {
        self.catch(ctx)
            .map_err(|e| LocalflareError::Internal(format!("{e:#?}")))
    }
}

/// A loaded worker sandbox: one `rquickjs` engine with the platform surface
/// and (after [`JsRuntime::load_worker`]) a worker's fetch handler
/// installed. One `JsRuntime` is reused across many requests by the pool
/// (see `localflare-pool`) rather than forked per call.
pub struct JsRuntime {
    runtime: Runtime,
    context: Context,
    _metric_guard: RuntimeMetricsGuard,
}

// SAFETY: `rquickjs::Context` is not `Send` only because it holds a raw
// pointer the compiler can't reason about; rquickjs itself implements
// `Send` for `Context` under the "parallel" feature for the same reason
// this is sound. Every public method here takes `&self`/`&mut self` and
// `localflare-pool` only ever hands one `JsRuntime` to one caller at a
// time (via its idle channel / loaded-runtime cache), so there is never
// concurrent access from two threads. Grounded in the identical
// `unsafe impl Send for JsRuntime` in `hyperlight-js-runtime::lib`.
unsafe impl Send for JsRuntime {}

impl JsRuntime {
    /// Build a fresh runtime with the platform globals installed, but no
    /// worker script loaded yet.
    #[instrument(err(Debug), level = Level::INFO)]
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| LocalflareError::Internal(format!("failed to create JS runtime: {e}")))?;
        let context = Context::full(&runtime)
            .map_err(|e| LocalflareError::Internal(format!("failed to create JS context: {e}")))?;

        runtime.set_loader(NativeModuleLoader, NativeModuleLoader);

        let instance = Self {
            runtime,
            context,
            _metric_guard: RuntimeMetricsGuard::new(),
        };
        instance.load_bootstrap()?;
        Ok(instance)
    }

    #[instrument(err(Debug), skip(self), level = Level::DEBUG)]
    fn load_bootstrap(&self) -> Result<()> {
        self.context.with(|ctx| -> Result<()> {
            let module =
                Module::declare(ctx.clone(), BOOTSTRAP_MODULE_NAME, BOOTSTRAP_SOURCE)
                    .catch_into(&ctx)?;
            let (_module, promise) = module.eval().catch_into(&ctx)?;
            promise.finish::<()>().catch_into(&ctx)?;
            Ok(())
        })
    }

    /// Install binding objects onto `globalThis` under their configured
    /// names. Call before loading the worker script.
    #[instrument(skip(self, bindings), level = Level::DEBUG)]
    pub fn install_bindings(&self, bindings: &[Box<dyn BindingModule>]) -> Result<()> {
        self.context.with(|ctx| -> Result<()> {
            for binding in bindings {
                binding.install(&ctx).catch_into(&ctx)?;
            }
            Ok(())
        })
    }

    /// Compile and evaluate a worker's script as an ES module. Fails with
    /// [`LocalflareError::ScriptCompile`] on syntax errors or a top-level
    /// throw.
    #[instrument(err(Debug), skip(self, script), level = Level::INFO)]
    pub fn load_worker(&self, script: &Script) -> Result<()> {
        let name = script
            .base_path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "worker".to_string());

        self.context.with(|ctx| -> Result<()> {
            let module = Module::declare(ctx.clone(), name, script.content())
                .map_err(|e| LocalflareError::ScriptCompile(e.to_string()))?;
            let (_module, promise) = module
                .eval()
                .map_err(|e| LocalflareError::ScriptCompile(e.to_string()))?;
            promise
                .finish::<()>()
                .catch(&ctx)
                .map_err(|e| LocalflareError::ScriptCompile(format!("{e:#?}")))?;
            Ok(())
        })
    }

    /// Dispatch one `fetch` event to the worker's registered handler,
    /// enforcing `exec_ctx`'s deadline via the engine's interrupt handler.
    /// Mirrors the wall-clock monitor the teacher races against guest
    /// execution, minus the separate-thread kill step — there is no
    /// second VM thread here, just the interrupt callback halting the
    /// same in-process engine loop at its next opcode check.
    #[instrument(err(Debug), skip(self, request), level = Level::INFO)]
    pub fn dispatch_fetch(
        &self,
        request: FetchRequest,
        exec_ctx: &ExecutionContext,
    ) -> Result<FetchResponse> {
        let mut metric_guard = ExecutionMetricGuard::new();
        let interrupt_ctx = exec_ctx.clone();
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || interrupt_ctx.is_expired())));
        let result = self.dispatch_fetch_inner(request, exec_ctx);
        self.runtime.set_interrupt_handler(None);
        if let Err(ref e) = result {
            metric_guard.record_error(e.code());
        }
        result
    }

    fn dispatch_fetch_inner(
        &self,
        request: FetchRequest,
        exec_ctx: &ExecutionContext,
    ) -> Result<FetchResponse> {
        self.context.with(|ctx| -> Result<FetchResponse> {
            let request_init = build_request_init(&ctx, &request).catch_into(&ctx)?;

            let dispatch: Function = ctx
                .globals()
                .get("__dispatchFetch")
                .map_err(|e| LocalflareError::Internal(format!("__dispatchFetch missing: {e}")))?;
            let promise: rquickjs::Promise = dispatch
                .call((request_init, exec_ctx.deadline_millis()))
                .map_err(|e| classify_dispatch_error(&ctx, e))?;
            let response: Object = promise
                .finish()
                .map_err(|e| classify_dispatch_error(&ctx, e))?;

            let status: u16 = response.get("status").catch_into(&ctx)?;
            let headers: Vec<(String, String)> = response.get("headers").catch_into(&ctx)?;
            let body: Vec<u8> = response.get("body").catch_into(&ctx)?;

            Ok(FetchResponse {
                status,
                headers,
                body,
            })
        })
    }

    /// Dispatch one `alarm` event to the worker's registered handler (a
    /// durable object script). Mirrors [`Self::dispatch_fetch`] minus the
    /// request/response shape: the handler either completes or throws, and
    /// any thrown exception propagates to the caller for the scheduler's
    /// retry/backoff policy to apply.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn dispatch_alarm(&self, exec_ctx: &ExecutionContext) -> Result<()> {
        let mut metric_guard = ExecutionMetricGuard::new();
        let interrupt_ctx = exec_ctx.clone();
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || interrupt_ctx.is_expired())));
        let result = self.dispatch_alarm_inner(exec_ctx);
        self.runtime.set_interrupt_handler(None);
        if let Err(ref e) = result {
            metric_guard.record_error(e.code());
        }
        result
    }

    fn dispatch_alarm_inner(&self, exec_ctx: &ExecutionContext) -> Result<()> {
        self.context.with(|ctx| -> Result<()> {
            let dispatch: Function = ctx
                .globals()
                .get("__dispatchAlarm")
                .map_err(|e| LocalflareError::Internal(format!("__dispatchAlarm missing: {e}")))?;
            let promise: rquickjs::Promise = dispatch
                .call((exec_ctx.deadline_millis(),))
                .map_err(|e| classify_dispatch_error(&ctx, e))?;
            promise
                .finish::<()>()
                .map_err(|e| classify_dispatch_error(&ctx, e))?;
            Ok(())
        })
    }

    /// Dispatch one batch of due queue messages to the worker's registered
    /// `queue` handler. Per-message ack/retry outcomes are collected by the
    /// sandbox side even if the handler throws partway through, so the
    /// caller can apply the "unhandled throw retries every un-acked
    /// message" batch contract without losing whatever the handler did
    /// manage to resolve first.
    #[instrument(err(Debug), skip(self, batch), level = Level::INFO)]
    pub fn dispatch_queue(&self, batch: QueueBatchInit, exec_ctx: &ExecutionContext) -> Result<QueueBatchResult> {
        let mut metric_guard = ExecutionMetricGuard::new();
        let interrupt_ctx = exec_ctx.clone();
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || interrupt_ctx.is_expired())));
        let result = self.dispatch_queue_inner(batch, exec_ctx);
        self.runtime.set_interrupt_handler(None);
        if let Err(ref e) = result {
            metric_guard.record_error(e.code());
        }
        result
    }

    fn dispatch_queue_inner(&self, batch: QueueBatchInit, exec_ctx: &ExecutionContext) -> Result<QueueBatchResult> {
        self.context.with(|ctx| -> Result<QueueBatchResult> {
            let batch_init = build_queue_batch_init(&ctx, &batch).catch_into(&ctx)?;

            let dispatch: Function = ctx
                .globals()
                .get("__dispatchQueue")
                .map_err(|e| LocalflareError::Internal(format!("__dispatchQueue missing: {e}")))?;
            let promise: rquickjs::Promise = dispatch
                .call((batch_init, exec_ctx.deadline_millis()))
                .map_err(|e| classify_dispatch_error(&ctx, e))?;
            let result: Object = promise
                .finish()
                .map_err(|e| classify_dispatch_error(&ctx, e))?;

            let acked: Vec<String> = result.get("acked").catch_into(&ctx)?;
            let retried: Vec<(String, i64)> = result.get("retried").catch_into(&ctx)?;
            let threw: Option<String> = result.get("threw").catch_into(&ctx)?;

            Ok(QueueBatchResult { acked, retried, threw })
        })
    }

    /// Await any `waitUntil` futures the last dispatched fetch event
    /// registered, bounded by `exec_ctx`'s deadline.
    #[instrument(err(Debug), skip(self), level = Level::DEBUG)]
    pub fn drain_wait_until(&self, exec_ctx: &ExecutionContext) -> Result<()> {
        let exec_ctx = exec_ctx.clone();
        self.runtime
            .set_interrupt_handler(Some(Box::new(move || exec_ctx.is_expired())));
        let result = self.context.with(|ctx| -> Result<()> {
            let drain: Function = ctx
                .globals()
                .get("__drainWaitUntil")
                .catch_into(&ctx)?;
            let promise: rquickjs::Promise = drain.call(()).catch_into(&ctx)?;
            promise
                .finish::<()>()
                .map_err(|_| LocalflareError::DeadlineExceeded)
        });
        self.runtime.set_interrupt_handler(None);
        result
    }
}

fn build_request_init<'js>(ctx: &Ctx<'js>, request: &FetchRequest) -> rquickjs::Result<Object<'js>> {
    let request_init = Object::new(ctx.clone())?;
    request_init.set("url", request.url.as_str())?;
    request_init.set("method", request.method.as_str())?;

    let headers_obj = Object::new(ctx.clone())?;
    for (name, value) in &request.headers {
        headers_obj.set(name.as_str(), value.as_str())?;
    }
    request_init.set("headers", headers_obj)?;

    if let Some(body) = &request.body {
        request_init.set("body", body.clone())?;
    }

    let cf_obj = Object::new(ctx.clone())?;
    cf_obj.set("colo", request.cf.colo.as_str())?;
    cf_obj.set("country", request.cf.country.as_str())?;
    cf_obj.set("city", request.cf.city.as_str())?;
    cf_obj.set("timezone", request.cf.timezone.as_str())?;
    request_init.set("cf", cf_obj)?;

    Ok(request_init)
}

fn build_queue_batch_init<'js>(ctx: &Ctx<'js>, batch: &QueueBatchInit) -> rquickjs::Result<Object<'js>> {
    let batch_init = Object::new(ctx.clone())?;
    batch_init.set("queueName", batch.queue_name.as_str())?;

    let messages = rquickjs::Array::new(ctx.clone())?;
    for (i, message) in batch.messages.iter().enumerate() {
        let message_obj = Object::new(ctx.clone())?;
        message_obj.set("id", message.id.as_str())?;
        message_obj.set("body", message.body.clone())?;
        message_obj.set("timestampMillis", message.timestamp_millis)?;
        message_obj.set("attempts", message.attempts)?;
        messages.set(i, message_obj)?;
    }
    batch_init.set("messages", messages)?;

    Ok(batch_init)
}

/// Maps an exception thrown out of `__dispatchFetch` to a stable error
/// kind. `NoHandlerError` carries `.code === "no-handler"`; everything else
/// that escapes (rather than being converted to a 500 `Response` inside
/// `__dispatchFetch` itself) is a pass-through-enabled handler exception.
fn classify_dispatch_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> LocalflareError {
    let message = match rquickjs::CatchResultExt::catch(Err::<(), _>(err), ctx) {
        Err(caught) => caught.to_string(),
        Ok(()) => unreachable!(),
    };
    if message.contains("no-handler") {
        LocalflareError::NoHandler
    } else {
        LocalflareError::HandlerException(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bootstrap_installs_web_platform_globals() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith(new Response('ok', { status: 200 }));
            });
            "#,
        );
        runtime.load_worker(&script).expect("worker should load");
        let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
        let response = runtime
            .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
            .expect("dispatch should succeed");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
    }

    #[test]
    fn missing_handler_fails_with_no_handler() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content("export default {};");
        runtime.load_worker(&script).expect("worker should load");
        let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
        let err = runtime
            .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
            .expect_err("dispatch should fail without a fetch listener");
        assert_eq!(err.code(), "no-handler");
    }

    #[test]
    fn alarm_dispatch_invokes_the_registered_handler() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content(
            r#"
            globalThis.__alarmFired = false;
            addEventListener('alarm', (event) => {
                globalThis.__alarmFired = true;
            });
            addEventListener('fetch', (event) => {
                event.respondWith(new Response(String(globalThis.__alarmFired)));
            });
            "#,
        );
        runtime.load_worker(&script).expect("worker should load");
        let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
        runtime.dispatch_alarm(&exec_ctx).expect("alarm dispatch should succeed");
        let response = runtime
            .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
            .unwrap();
        assert_eq!(response.body, b"true");
    }

    #[test]
    fn alarm_dispatch_without_handler_fails_with_no_handler() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content("export default {};");
        runtime.load_worker(&script).expect("worker should load");
        let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
        let err = runtime
            .dispatch_alarm(&exec_ctx)
            .expect_err("dispatch should fail without an alarm listener");
        assert_eq!(err.code(), "no-handler");
    }

    #[test]
    fn queue_dispatch_collects_per_message_ack_and_retry() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content(
            r#"
            addEventListener('queue', async (event) => {
                for (const message of event.batch.messages) {
                    if (message.id === 'keep') message.retry({ delaySeconds: 30 });
                    else message.ack();
                }
            });
            "#,
        );
        runtime.load_worker(&script).expect("worker should load");
        let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
        let batch = QueueBatchInit {
            queue_name: "jobs".to_string(),
            messages: vec![
                QueueMessageInit { id: "done".to_string(), body: b"a".to_vec(), timestamp_millis: 0, attempts: 1 },
                QueueMessageInit { id: "keep".to_string(), body: b"b".to_vec(), timestamp_millis: 0, attempts: 1 },
            ],
        };
        let result = runtime.dispatch_queue(batch, &exec_ctx).expect("dispatch should succeed");
        assert_eq!(result.acked, vec!["done".to_string()]);
        assert_eq!(result.retried, vec![("keep".to_string(), 30)]);
        assert!(result.threw.is_none());
    }

    #[test]
    fn queue_dispatch_reports_thrown_error_and_surviving_outcomes() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content(
            r#"
            addEventListener('queue', async (event) => {
                event.batch.messages[0].ack();
                throw new Error('boom');
            });
            "#,
        );
        runtime.load_worker(&script).expect("worker should load");
        let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
        let batch = QueueBatchInit {
            queue_name: "jobs".to_string(),
            messages: vec![QueueMessageInit { id: "m1".to_string(), body: b"a".to_vec(), timestamp_millis: 0, attempts: 1 }],
        };
        let result = runtime.dispatch_queue(batch, &exec_ctx).expect("dispatch should not error at the host level");
        assert_eq!(result.acked, vec!["m1".to_string()]);
        assert!(result.threw.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn script_compile_error_surfaces_as_script_compile() {
        let runtime = JsRuntime::new().expect("runtime should build");
        let script = Script::from_content("this is not valid javascript {{{");
        let err = runtime
            .load_worker(&script)
            .expect_err("malformed script should fail to compile");
        assert_eq!(err.code(), "script-compile");
    }
}
