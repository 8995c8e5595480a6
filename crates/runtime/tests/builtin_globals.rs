//! Web platform globals the bootstrap module installs onto every runtime.

use std::time::Duration;

use localflare_runtime::{ExecutionContext, FetchRequest, JsRuntime, Script};

fn dispatch(runtime: &JsRuntime, worker: &str) -> localflare_runtime::FetchResponse {
    let script = Script::from_content(worker);
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect("dispatch should succeed")
}

#[test]
fn builtin_globals_should_be_defined() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let response = dispatch(
        &runtime,
        r#"
        function assert(condition, message) {
            if (!condition) throw new Error(message);
        }

        addEventListener('fetch', (event) => {
            assert(typeof fetch === "undefined" || typeof fetch === "function", "fetch shape");
            assert(typeof Headers === "function", "Headers should be defined");
            assert(typeof Request === "function", "Request should be defined");
            assert(typeof Response === "function", "Response should be defined");
            assert(typeof TextEncoder === "function", "TextEncoder should be defined");
            assert(typeof TextDecoder === "function", "TextDecoder should be defined");
            assert(typeof URL === "function", "URL should be defined");
            assert(typeof URLSearchParams === "function", "URLSearchParams should be defined");
            assert(typeof crypto === "object", "crypto should be defined");
            assert(typeof crypto.subtle === "object", "crypto.subtle should be defined");
            assert(typeof crypto.randomUUID === "function", "crypto.randomUUID should be defined");
            assert(typeof structuredClone === "function", "structuredClone should be defined");
            assert(typeof performance.now === "function", "performance.now should be defined");
            assert(typeof AbortController === "function", "AbortController should be defined");
            assert(typeof ReadableStream === "function", "ReadableStream should be defined");
            assert(typeof String.bytesFrom === "function", "String.bytesFrom should be defined");
            event.respondWith(new Response("ok"));
        });
        "#,
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
}

#[test]
fn headers_are_case_insensitive_and_join_multi_values() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let response = dispatch(
        &runtime,
        r#"
        addEventListener('fetch', (event) => {
            const headers = new Headers();
            headers.append("X-Thing", "a");
            headers.append("x-thing", "b");
            const joined = headers.get("X-THING");
            event.respondWith(new Response(joined));
        });
        "#,
    );
    assert_eq!(response.body, b"a, b");
}

#[test]
fn url_resolves_relative_paths_against_base() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let response = dispatch(
        &runtime,
        r#"
        addEventListener('fetch', (event) => {
            const url = new URL("/widgets?x=1", "https://example.com/api/");
            event.respondWith(new Response(url.pathname + url.search));
        });
        "#,
    );
    assert_eq!(response.body, b"/widgets?x=1");
}

#[test]
fn structured_clone_deep_copies_nested_objects() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let response = dispatch(
        &runtime,
        r#"
        addEventListener('fetch', (event) => {
            const original = { nested: { value: 1 } };
            const clone = structuredClone(original);
            clone.nested.value = 2;
            event.respondWith(new Response(String(original.nested.value === 1 && clone.nested.value === 2)));
        });
        "#,
    );
    assert_eq!(response.body, b"true");
}

#[test]
fn abort_controller_signals_listeners() {
    let runtime = JsRuntime::new().expect("runtime should build");
    let response = dispatch(
        &runtime,
        r#"
        addEventListener('fetch', (event) => {
            const controller = new AbortController();
            let aborted = false;
            controller.signal.addEventListener("abort", () => { aborted = true; });
            controller.abort("stop");
            event.respondWith(new Response(String(aborted && controller.signal.aborted)));
        });
        "#,
    );
    assert_eq!(response.body, b"true");
}
