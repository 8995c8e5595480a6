//! Behaviour of fetch handlers: respondWith, waitUntil, exceptions, and the
//! no-handler case.

use std::time::Duration;

use localflare_runtime::{ExecutionContext, FetchRequest, JsRuntime, LocalflareError, Script};

#[test]
fn respond_with_echoes_request_headers() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(
        r#"
        addEventListener('fetch', (event) => {
            const name = event.request.headers.get("x-name") ?? "nobody";
            event.respondWith(new Response("hello, " + name));
        });
        "#,
    );
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    let request = FetchRequest::new("GET", "http://localhost/").with_header("x-name", "world");
    let response = runtime
        .dispatch_fetch(request, &exec_ctx)
        .expect("dispatch should succeed");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello, world");
}

#[test]
fn thrown_exception_becomes_500_unless_pass_through_requested() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(
        r#"
        addEventListener('fetch', (event) => {
            event.respondWith((async () => {
                throw new Error("boom");
            })());
        });
        "#,
    );
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    let response = runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect("handler exceptions are caught into a 500, not propagated");
    assert_eq!(response.status, 500);
}

#[test]
fn pass_through_on_exception_propagates_the_throw() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(
        r#"
        addEventListener('fetch', (event) => {
            event.passThroughOnException();
            event.respondWith((async () => {
                throw new Error("boom");
            })());
        });
        "#,
    );
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    let err = runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect_err("a pass-through exception should surface as an error");
    assert_eq!(err.code(), "handler-exception");
}

#[test]
fn respond_with_never_called_fails_with_no_handler() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(
        r#"
        addEventListener('fetch', (event) => {
            // Registered, but never calls respondWith.
        });
        "#,
    );
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    let err = runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect_err("no respondWith call should fail the same way as no listener");
    assert_eq!(err.code(), "no-handler");
}

#[test]
fn wait_until_runs_in_the_background_and_drains_after_response() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(
        r#"
        globalThis.__sideEffect = false;
        addEventListener('fetch', (event) => {
            event.respondWith(new Response("ok"));
            event.waitUntil((async () => {
                globalThis.__sideEffect = true;
            })());
        });
        "#,
    );
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    let response = runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect("dispatch should succeed");
    assert_eq!(response.body, b"ok");

    runtime
        .drain_wait_until(&exec_ctx)
        .expect("draining wait-until futures should succeed");
}

#[test]
fn busy_loop_handler_is_interrupted_at_its_deadline() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(
        r#"
        addEventListener('fetch', (event) => {
            const start = Date.now();
            while (Date.now() - start < 10000) {
                // busy-wait past the deadline
            }
            event.respondWith(new Response("should never get here"));
        });
        "#,
    );
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_millis(50));
    let err = runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect_err("a busy loop past the deadline should be interrupted");
    assert!(!matches!(err, LocalflareError::NoHandler));
}
