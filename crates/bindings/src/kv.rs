//! The `KvNamespace` binding: `get`/`put`/`delete`/`list` against one
//! `localflare-storage` KV namespace.
//!
//! Methods return plain values rather than JS `Promise`s — every storage
//! call here is synchronous and in-process, so `await binding.get(key)` in
//! worker code resolves on the next microtask tick the same way `await`
//! resolves any non-thenable value. No hand-rolled `Promise` plumbing is
//! needed to keep the async-looking worker-facing contract.

use std::sync::Arc;

use localflare_common::NamespaceId;
use localflare_runtime::BindingModule;
use localflare_storage::{now_epoch_seconds, KvStore};
use rquickjs::{Ctx, Exception, Function, Object, Value};

use crate::convert::throw;

/// Reads the `{type}` shorthand out of `.get`'s second argument, which may be
/// a bare string (`"json"`) or an options object (`{type: "json"}`). Defaults
/// to `"text"`, matching the binding's historical behavior of decoding a
/// string by default.
fn kv_get_type<'js>(options: &Option<Value<'js>>) -> String {
    match options {
        Some(v) => {
            if let Some(s) = v.as_string() {
                s.to_string().unwrap_or_else(|_| "text".to_string())
            } else if let Some(obj) = v.as_object() {
                obj.get::<_, Option<String>>("type").unwrap_or(None).unwrap_or_else(|| "text".to_string())
            } else {
                "text".to_string()
            }
        }
        None => "text".to_string(),
    }
}

/// Coerces raw KV bytes into the JS shape `.get`'s `type` asked for.
fn kv_value_as<'js>(ctx: &Ctx<'js>, bytes: Vec<u8>, kv_type: &str) -> rquickjs::Result<Value<'js>> {
    use rquickjs::IntoJs;
    match kv_type {
        "text" => String::from_utf8_lossy(&bytes).into_owned().into_js(ctx),
        "json" => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let json: Object<'js> = ctx.globals().get("JSON")?;
            let parse: Function<'js> = json.get("parse")?;
            parse.call((text,))
        }
        "arrayBuffer" => {
            let wrap: Function<'js> = ctx.eval("(bytes) => new Uint8Array(bytes).buffer")?;
            wrap.call((bytes,))
        }
        "stream" => {
            let wrap: Function<'js> = ctx.eval(
                r#"(bytes) => new ReadableStream({
                    start(controller) {
                        controller.enqueue(new Uint8Array(bytes));
                        controller.close();
                    },
                })"#,
            )?;
            wrap.call((bytes,))
        }
        other => Err(Exception::throw_type(ctx, &format!("Unsupported KV get type: {other}"))),
    }
}

pub struct KvBinding {
    name: String,
    store: Arc<KvStore>,
    namespace: NamespaceId,
}

impl KvBinding {
    pub fn new(name: impl Into<String>, store: Arc<KvStore>, namespace: NamespaceId) -> Self {
        Self {
            name: name.into(),
            store,
            namespace,
        }
    }
}

impl BindingModule for KvBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let namespace = self.namespace;

        {
            let store = self.store.clone();
            let get = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String, options: Option<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                    let pair = store.get(namespace, &key).map_err(|e| throw(&ctx, e))?;
                    match pair {
                        Some(pair) => kv_value_as(&ctx, pair.value, &kv_get_type(&options)),
                        None => Ok(Value::new_null(ctx.clone())),
                    }
                },
            )?
            .with_name("get")?;
            obj.set("get", get)?;
        }

        {
            let store = self.store.clone();
            let get_with_metadata = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Object<'js>> {
                    let pair = store.get(namespace, &key).map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    result.set("value", pair.as_ref().map(|p| p.value.clone()))?;
                    result.set("metadata", pair.and_then(|p| p.metadata))?;
                    Ok(result)
                },
            )?
            .with_name("getWithMetadata")?;
            obj.set("getWithMetadata", get_with_metadata)?;
        }

        {
            let store = self.store.clone();
            let put = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, key: String, value: Vec<u8>, options: Option<Object<'_>>| -> rquickjs::Result<()> {
                    let (metadata, expiration) = match &options {
                        Some(options) => {
                            let metadata: Option<String> = options.get("metadata").unwrap_or(None);
                            let expiration: Option<i64> = options.get("expiration").unwrap_or(None);
                            let expiration_ttl: Option<i64> = options.get("expirationTtl").unwrap_or(None);
                            let expiration = expiration.or_else(|| expiration_ttl.map(|ttl| now_epoch_seconds() + ttl));
                            (metadata, expiration)
                        }
                        None => (None, None),
                    };
                    store.put(namespace, &key, value, metadata, expiration).map_err(|e| throw(&ctx, e))
                },
            )?
            .with_name("put")?;
            obj.set("put", put)?;
        }

        {
            let store = self.store.clone();
            let delete = Function::new(ctx.clone(), move |ctx: Ctx<'_>, key: String| -> rquickjs::Result<()> {
                store.delete(namespace, &key).map_err(|e| throw(&ctx, e))
            })?
            .with_name("delete")?;
            obj.set("delete", delete)?;
        }

        {
            let store = self.store.clone();
            let list = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, options: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                    let (prefix, limit, cursor) = match &options {
                        Some(options) => (
                            options.get::<_, Option<String>>("prefix").unwrap_or(None),
                            options.get::<_, Option<usize>>("limit").unwrap_or(None).unwrap_or(1000),
                            options.get::<_, Option<String>>("cursor").unwrap_or(None),
                        ),
                        None => (None, 1000, None),
                    };
                    let page = store
                        .list(namespace, prefix.as_deref(), limit, cursor.as_deref())
                        .map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    result.set("keys", page.keys)?;
                    result.set("cursor", page.cursor)?;
                    Ok(result)
                },
            )?
            .with_name("list")?;
            obj.set("list", list)?;
        }

        ctx.globals().set(self.binding_name(), obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_storage::MetaDb;

    #[test]
    fn installs_a_usable_get_put_delete_object() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(KvStore::new(db));
        let namespace = store.create_namespace("test").unwrap();
        let binding = KvBinding::new("MY_KV", store, namespace);

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await MY_KV.put('a', 'hello');
                    const text = await MY_KV.get('a');
                    const bytes = await MY_KV.get('a', 'arrayBuffer');
                    const bytesOk = new TextDecoder().decode(bytes) === 'hello';
                    return new Response(text, { status: text === 'hello' && bytesOk ? 200 : 500 });
                })());
            });
            "#,
        );
        runtime.load_worker(&script).unwrap();
        let exec_ctx = localflare_runtime::ExecutionContext::with_timeout(std::time::Duration::from_secs(5));
        let response = runtime
            .dispatch_fetch(localflare_runtime::FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn get_coerces_to_the_requested_type() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(KvStore::new(db));
        let namespace = store.create_namespace("test").unwrap();
        let binding = KvBinding::new("MY_KV", store, namespace);

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await MY_KV.put('cfg', JSON.stringify({ enabled: true }));
                    const parsed = await MY_KV.get('cfg', { type: 'json' });
                    const missing = await MY_KV.get('does-not-exist');
                    const ok = parsed.enabled === true && missing === null;
                    return new Response('ok', { status: ok ? 200 : 500 });
                })());
            });
            "#,
        );
        runtime.load_worker(&script).unwrap();
        let exec_ctx = localflare_runtime::ExecutionContext::with_timeout(std::time::Duration::from_secs(5));
        let response = runtime
            .dispatch_fetch(localflare_runtime::FetchRequest::new("GET", "http://localhost/"), &exec_ctx)
            .unwrap();
        assert_eq!(response.status, 200);
    }
}
