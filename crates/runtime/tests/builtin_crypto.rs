//! Test the WebCrypto surface the bootstrap module exposes.

use std::time::Duration;

use localflare_runtime::{ExecutionContext, FetchRequest, FetchResponse, JsRuntime, Script};

fn dispatch(worker: &str) -> FetchResponse {
    let runtime = JsRuntime::new().expect("runtime should build");
    let script = Script::from_content(worker);
    runtime.load_worker(&script).expect("worker should load");
    let exec_ctx = ExecutionContext::with_timeout(Duration::from_secs(5));
    runtime
        .dispatch_fetch(FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
        .expect("dispatch should succeed")
}

#[test]
fn subtle_digest_sha256_matches_known_vector() {
    let response = dispatch(
        r#"
        addEventListener('fetch', (event) => {
            event.respondWith((async () => {
                const data = new TextEncoder().encode("abc");
                const digest = await crypto.subtle.digest("SHA-256", data);
                const hex = Array.from(new Uint8Array(digest))
                    .map((b) => b.toString(16).padStart(2, "0"))
                    .join("");
                return new Response(hex);
            })());
        });
        "#,
    );
    assert_eq!(
        response.body,
        b"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_vec()
    );
}

#[test]
fn random_uuid_returns_a_v4_shaped_string() {
    let response = dispatch(
        r#"
        addEventListener('fetch', (event) => {
            const id = crypto.randomUUID();
            const isUuid = /^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$/.test(id);
            event.respondWith(new Response(String(isUuid)));
        });
        "#,
    );
    assert_eq!(response.body, b"true");
}

#[test]
fn atob_btoa_round_trip() {
    let response = dispatch(
        r#"
        addEventListener('fetch', (event) => {
            const encoded = btoa("hello world");
            const decoded = atob(encoded);
            event.respondWith(new Response(decoded));
        });
        "#,
    );
    assert_eq!(response.body, b"hello world");
}

#[test]
fn get_random_values_fills_the_typed_array() {
    let response = dispatch(
        r#"
        addEventListener('fetch', (event) => {
            const bytes = new Uint8Array(16);
            crypto.getRandomValues(bytes);
            const allZero = bytes.every((b) => b === 0);
            event.respondWith(new Response(String(!allZero)));
        });
        "#,
    );
    assert_eq!(response.body, b"true");
}
