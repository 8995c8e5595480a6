//! The AI Gateway binding: wraps an [`AiBinding`]-shaped `.run()` with a
//! cache (keyed by `(model, canonicalized inputs)`), a request log, and a
//! fixed-window rate limit, all backed by `localflare-storage::GatewayStore`.

use std::sync::Arc;

use localflare_common::LocalflareError;
use localflare_runtime::BindingModule;
use localflare_storage::{GatewayLogEntry, GatewayStore};
use rquickjs::{Ctx, Function, Object, Value};

use crate::ai::call_model;
use crate::convert::throw;

pub struct AiGatewayBinding {
    name: String,
    gateway_id: String,
    base_url: String,
    client: reqwest::blocking::Client,
    store: Arc<GatewayStore>,
    cache_ttl_secs: i64,
    rate_limit: Option<(i64, u64)>,
    log_bodies: bool,
}

impl AiGatewayBinding {
    pub fn new(
        name: impl Into<String>,
        gateway_id: impl Into<String>,
        base_url: impl Into<String>,
        store: Arc<GatewayStore>,
        cache_ttl_secs: i64,
        rate_limit: Option<(i64, u64)>,
        log_bodies: bool,
    ) -> Self {
        Self {
            name: name.into(),
            gateway_id: gateway_id.into(),
            base_url: base_url.into(),
            client: reqwest::blocking::Client::new(),
            store,
            cache_ttl_secs,
            rate_limit,
            log_bodies,
        }
    }
}

fn cache_key<'js>(ctx: &Ctx<'js>, model: &str, inputs: &Object<'js>) -> rquickjs::Result<String> {
    let json: Object<'js> = ctx.globals().get("JSON")?;
    let stringify: Function<'js> = json.get("stringify")?;
    let canonical: String = stringify.call((inputs.clone(),))?;
    Ok(format!("workers-ai:{model}:{canonical}"))
}

impl BindingModule for AiGatewayBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let gateway_id = self.gateway_id.clone();
        let base_url = self.base_url.clone();
        let client = self.client.clone();
        let store = self.store.clone();
        let cache_ttl_secs = self.cache_ttl_secs;
        let rate_limit = self.rate_limit;
        let log_bodies = self.log_bodies;

        let run = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, model: String, inputs: Object<'js>, options: Option<Object<'js>>| -> rquickjs::Result<Value<'js>> {
                if let Some((window_secs, limit)) = rate_limit {
                    let rejected = store
                        .check_and_increment_rate_limit(&gateway_id, window_secs, limit)
                        .map_err(|e| throw(&ctx, e))?;
                    if rejected {
                        return Err(throw(
                            &ctx,
                            LocalflareError::PermissionDenied(format!("gateway {gateway_id} rate limit exceeded")),
                        ));
                    }
                }

                let key = cache_key(&ctx, &model, &inputs)?;
                if let Some(cached_bytes) = store.cache_get(&gateway_id, &key).map_err(|e| throw(&ctx, e))? {
                    let cached_text = String::from_utf8_lossy(&cached_bytes).into_owned();
                    let json: Object<'js> = ctx.globals().get("JSON")?;
                    let parse: Function<'js> = json.get("parse")?;
                    let parsed: Object<'js> = parse.call((cached_text,))?;
                    parsed.set("cached", true)?;
                    return Ok(parsed.into_value());
                }

                let start = std::time::Instant::now();
                let outcome = call_model(&ctx, &client, &base_url, &model, &inputs, &options);
                let duration_ms = start.elapsed().as_millis() as i64;

                let (result, request_bytes, response_bytes, status) = outcome.map_err(|e| throw(&ctx, e))?;

                let json: Object<'js> = ctx.globals().get("JSON")?;
                let stringify: Function<'js> = json.get("stringify")?;
                let result_text: String = stringify.call((result.clone(),))?;
                store
                    .cache_put(&gateway_id, &key, result_text.into_bytes(), cache_ttl_secs)
                    .map_err(|e| throw(&ctx, e))?;

                store
                    .log(&GatewayLogEntry {
                        gateway_id: gateway_id.clone(),
                        duration_ms,
                        status: status as i64,
                        request: log_bodies.then_some(request_bytes),
                        response: log_bodies.then_some(response_bytes),
                    })
                    .map_err(|e| throw(&ctx, e))?;

                if let Some(result_obj) = result.as_object() {
                    result_obj.set("cached", false)?;
                }
                Ok(result)
            },
        )?
        .with_name("run")?;
        obj.set("run", run)?;

        ctx.globals().set(self.binding_name(), obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_storage::MetaDb;

    #[test]
    fn installs_a_callable_run_function() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let store = Arc::new(GatewayStore::new(MetaDb::open_in_memory().unwrap()));
        let binding = AiGatewayBinding::new("AI", "gw-1", "http://127.0.0.1:1", store, 300, Some((60, 100)), false);
        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    return new Response('ok', { status: typeof AI.run === 'function' ? 200 : 500 });
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
