//! The `DurableObjectNamespace` binding: `idFromName`/`idFromString`/
//! `newUniqueId`/`get`, the last producing a stub whose `.fetch()` and
//! `.storage` delegate to one instance's storage and fetch handler.
//!
//! Actual instance dispatch (loading the Durable Object class, running its
//! `fetch`/`alarm` handlers, keeping it warm between calls) is the
//! scheduler's job, not this binding's — [`DurableObjectDispatcher`] is the
//! seam the scheduler crate implements and hands in at construction time,
//! the same way the runtime pool is handed to the root bin crate rather
//! than built here.

use std::sync::Arc;

use localflare_common::{LocalflareError, NamespaceId, Result};
use localflare_runtime::{BindingModule, FetchRequest, FetchResponse};
use localflare_storage::{DoListOptions, DurableObjectStore};
use rquickjs::{Ctx, Function, Object, Value};

use crate::convert::throw;

/// Dispatches a fetch (or, in the future, an alarm) into a running Durable
/// Object instance. Implemented by `localflare-scheduler`.
pub trait DurableObjectDispatcher: Send + Sync {
    fn fetch(&self, instance_id: &str, request: FetchRequest) -> Result<FetchResponse>;
}

pub struct DurableObjectBinding {
    name: String,
    store: Arc<DurableObjectStore>,
    namespace: NamespaceId,
    dispatcher: Arc<dyn DurableObjectDispatcher>,
}

impl DurableObjectBinding {
    pub fn new(
        name: impl Into<String>,
        store: Arc<DurableObjectStore>,
        namespace: NamespaceId,
        dispatcher: Arc<dyn DurableObjectDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            namespace,
            dispatcher,
        }
    }
}

fn id_object<'js>(ctx: &Ctx<'js>, id: &str, name: Option<&str>) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("id", id)?;
    obj.set("name", name)?;
    let id_owned = id.to_string();
    let to_string = Function::new(ctx.clone(), move || id_owned.clone())?.with_name("toString")?;
    obj.set("toString", to_string)?;
    Ok(obj)
}

fn extract_request<'js>(ctx: &Ctx<'js>, input: Value<'js>, init: Option<Object<'js>>) -> rquickjs::Result<FetchRequest> {
    let (url, mut method, mut headers, mut body) = if let Some(s) = input.as_string() {
        (s.to_string()?, "GET".to_string(), Vec::new(), None)
    } else if let Some(obj) = input.as_object() {
        let url: String = obj.get("url").unwrap_or_default();
        let method: String = obj.get("method").unwrap_or_else(|_| "GET".to_string());
        (url, method, Vec::new(), None)
    } else {
        (String::new(), "GET".to_string(), Vec::new(), None)
    };

    if let Some(init) = init {
        if let Ok(m) = init.get::<_, String>("method") {
            method = m;
        }
        if let Ok(b) = init.get::<_, Vec<u8>>("body") {
            body = Some(b);
        }
        if let Ok(h) = init.get::<_, Vec<(String, String)>>("headers") {
            headers = h;
        }
    }

    let mut request = FetchRequest::new(method, url);
    request.headers = headers;
    request.body = body;
    Ok(request)
}

fn response_to_object<'js>(ctx: &Ctx<'js>, response: FetchResponse) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("status", response.status)?;
    obj.set("body", response.body)?;
    let headers = Object::new(ctx.clone())?;
    for (name, value) in &response.headers {
        headers.set(name.as_str(), value.as_str())?;
    }
    obj.set("headers", headers)?;
    Ok(obj)
}

impl BindingModule for DurableObjectBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let namespace = self.namespace;

        {
            let store = self.store.clone();
            let id_from_name = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Object<'js>> {
                    let id = store.id_from_name(namespace, &name);
                    id_object(&ctx, &id, Some(&name))
                },
            )?
            .with_name("idFromName")?;
            obj.set("idFromName", id_from_name)?;
        }

        {
            let store = self.store.clone();
            let id_from_string = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, id: String| -> rquickjs::Result<Object<'js>> {
                    let id = store.id_from_string(&id).map_err(|e| throw(&ctx, e))?;
                    id_object(&ctx, &id, None)
                },
            )?
            .with_name("idFromString")?;
            obj.set("idFromString", id_from_string)?;
        }

        {
            let store = self.store.clone();
            let new_unique_id = Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Object<'js>> {
                let id = store.new_unique_id();
                id_object(&ctx, &id, None)
            })?
            .with_name("newUniqueId")?;
            obj.set("newUniqueId", new_unique_id)?;
        }

        {
            let store = self.store.clone();
            let dispatcher = self.dispatcher.clone();
            let get = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, id_obj: Object<'js>| -> rquickjs::Result<Object<'js>> {
                    let id: String = id_obj.get("id")?;
                    store.ensure_instance(namespace, &id).map_err(|e| throw(&ctx, e))?;

                    let stub = Object::new(ctx.clone())?;
                    stub.set("id", id_obj)?;

                    let dispatcher = dispatcher.clone();
                    let instance_id = id.clone();
                    let fetch = Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'js>, input: Value<'js>, init: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                            let request = extract_request(&ctx, input, init)?;
                            let response = dispatcher
                                .fetch(&instance_id, request)
                                .map_err(|e| throw(&ctx, e))?;
                            response_to_object(&ctx, response)
                        },
                    )?
                    .with_name("fetch")?;
                    stub.set("fetch", fetch)?;
                    Ok(stub)
                },
            )?
            .with_name("get")?;
            obj.set("get", get)?;
        }

        ctx.globals().set(self.binding_name(), obj)
    }
}

/// The per-instance storage surface exposed inside a Durable Object's own
/// script, as opposed to [`DurableObjectBinding`] which faces the parent
/// worker that calls `.get(id).fetch(...)`. Installed by the scheduler into
/// the dedicated runtime it keeps warm for one instance, so unlike every
/// other binding here it closes over a fixed `instance_id` rather than a
/// namespace.
pub struct DurableObjectStorageBinding {
    name: String,
    store: Arc<DurableObjectStore>,
    instance_id: String,
}

impl DurableObjectStorageBinding {
    pub fn new(name: impl Into<String>, store: Arc<DurableObjectStore>, instance_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store,
            instance_id: instance_id.into(),
        }
    }
}

impl BindingModule for DurableObjectStorageBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let instance_id = self.instance_id.clone();

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let get = Function::new(ctx.clone(), move |ctx: Ctx<'_>, key: String| -> rquickjs::Result<Option<Vec<u8>>> {
                store.get(&instance_id, &key).map_err(|e| throw(&ctx, e))
            })?
            .with_name("get")?;
            obj.set("get", get)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let get_multiple = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, keys: Vec<String>| -> rquickjs::Result<Object<'js>> {
                    let pairs = store.get_multiple(&instance_id, &keys).map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    for (key, value) in pairs {
                        result.set(key.as_str(), value)?;
                    }
                    Ok(result)
                },
            )?
            .with_name("getMultiple")?;
            obj.set("getMultiple", get_multiple)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let put = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, key: String, value: Vec<u8>| -> rquickjs::Result<()> {
                    store.put(&instance_id, &key, value).map_err(|e| throw(&ctx, e))
                },
            )?
            .with_name("put")?;
            obj.set("put", put)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let put_multiple = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, entries: Vec<(String, Vec<u8>)>| -> rquickjs::Result<()> {
                    store.put_multiple(&instance_id, &entries).map_err(|e| throw(&ctx, e))
                },
            )?
            .with_name("putMultiple")?;
            obj.set("putMultiple", put_multiple)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let delete = Function::new(ctx.clone(), move |ctx: Ctx<'_>, key: String| -> rquickjs::Result<()> {
                store.delete(&instance_id, &key).map_err(|e| throw(&ctx, e))
            })?
            .with_name("delete")?;
            obj.set("delete", delete)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let delete_multiple = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, keys: Vec<String>| -> rquickjs::Result<()> {
                    store.delete_multiple(&instance_id, &keys).map_err(|e| throw(&ctx, e))
                },
            )?
            .with_name("deleteMultiple")?;
            obj.set("deleteMultiple", delete_multiple)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let delete_all = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<()> {
                store.delete_all(&instance_id).map_err(|e| throw(&ctx, e))
            })?
            .with_name("deleteAll")?;
            obj.set("deleteAll", delete_all)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let list = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, options: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                    let (start, end, prefix, reverse, limit) = match &options {
                        Some(options) => (
                            options.get::<_, Option<String>>("start").unwrap_or(None),
                            options.get::<_, Option<String>>("end").unwrap_or(None),
                            options.get::<_, Option<String>>("prefix").unwrap_or(None),
                            options.get::<_, Option<bool>>("reverse").unwrap_or(None).unwrap_or(false),
                            options.get::<_, Option<usize>>("limit").unwrap_or(None).unwrap_or(0),
                        ),
                        None => (None, None, None, false, 0),
                    };
                    let entries = store
                        .list(
                            &instance_id,
                            &DoListOptions {
                                start: start.as_deref(),
                                end: end.as_deref(),
                                prefix: prefix.as_deref(),
                                reverse,
                                limit,
                            },
                        )
                        .map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    for (key, value) in entries {
                        result.set(key.as_str(), value)?;
                    }
                    Ok(result)
                },
            )?
            .with_name("list")?;
            obj.set("list", list)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let set_alarm = Function::new(ctx.clone(), move |ctx: Ctx<'_>, scheduled_time: i64| -> rquickjs::Result<()> {
                store.set_alarm(&instance_id, scheduled_time).map_err(|e| throw(&ctx, e))
            })?
            .with_name("setAlarm")?;
            obj.set("setAlarm", set_alarm)?;
        }

        {
            let store = self.store.clone();
            let instance_id = instance_id.clone();
            let delete_alarm = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<()> {
                store.delete_alarm(&instance_id).map_err(|e| throw(&ctx, e))
            })?
            .with_name("deleteAlarm")?;
            obj.set("deleteAlarm", delete_alarm)?;
        }

        ctx.globals().set(self.binding_name(), obj)
    }
}

struct UnimplementedDispatcher;

impl DurableObjectDispatcher for UnimplementedDispatcher {
    fn fetch(&self, instance_id: &str, _request: FetchRequest) -> Result<FetchResponse> {
        Err(LocalflareError::Unsupported(format!(
            "no scheduler wired up to dispatch to instance {instance_id}"
        )))
    }
}

/// A dispatcher that always reports the namespace has no scheduler attached
/// yet — useful for bindings installed standalone (e.g. in tests) before a
/// `localflare-scheduler::DurableObjectScheduler` exists to take over.
pub fn unimplemented_dispatcher() -> Arc<dyn DurableObjectDispatcher> {
    Arc::new(UnimplementedDispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_storage::MetaDb;

    #[test]
    fn id_from_name_round_trips_through_the_binding() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(DurableObjectStore::new(db));
        let namespace = store.create_namespace("rooms", "worker.js", "Room").unwrap();
        let binding = DurableObjectBinding::new("ROOMS", store, namespace, unimplemented_dispatcher());

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    const a = ROOMS.idFromName('lobby');
                    const b = ROOMS.idFromName('lobby');
                    return new Response('ok', { status: a.toString() === b.toString() ? 200 : 500 });
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
    fn storage_binding_put_then_get_round_trips_and_lists() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(DurableObjectStore::new(db));
        let namespace = store.create_namespace("rooms", "worker.js", "Room").unwrap();
        let instance_id = store.id_from_name(namespace, "lobby");
        store.ensure_instance(namespace, &instance_id).unwrap();
        let binding = DurableObjectStorageBinding::new("storage", store, instance_id);

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await storage.put('count', new TextEncoder().encode('1'));
                    const value = await storage.get('count');
                    const text = new TextDecoder().decode(value);
                    const listed = await storage.list({ prefix: 'cou' });
                    const ok = text === '1' && new TextDecoder().decode(listed.count) === '1';
                    return new Response(text, { status: ok ? 200 : 500 });
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
