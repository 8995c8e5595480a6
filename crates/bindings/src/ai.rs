//! The `Ai` binding: `.run(model, inputs, options?)` resolves a symbolic
//! model name to a text-generation or embeddings route and forwards to the
//! out-of-process model server over plain HTTP.
//!
//! The request is built and serialized in JS (`JSON.stringify`) so the
//! arbitrary-shaped `inputs`/`options` objects never need a hand-rolled
//! `Value` <-> `serde_json::Value` bridge; the response is parsed back with
//! `JSON.parse` for the same reason.

use localflare_common::{LocalflareError, Result};
use localflare_runtime::BindingModule;
use rquickjs::{Ctx, Function, Object, Value};

use crate::convert::throw;

pub struct AiBinding {
    name: String,
    base_url: String,
    client: reqwest::blocking::Client,
}

impl AiBinding {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

/// One model-server round trip: stringifies `{model, prompt|text, stream,
/// options}` in JS, POSTs it, and parses the response back with
/// `JSON.parse`. Returns the parsed response alongside the raw request and
/// response bytes (for gateway logging) and the HTTP status.
pub fn call_model<'js>(
    ctx: &Ctx<'js>,
    client: &reqwest::blocking::Client,
    base_url: &str,
    model: &str,
    inputs: &Object<'js>,
    options: &Option<Object<'js>>,
) -> Result<(Value<'js>, Vec<u8>, Vec<u8>, u16)> {
    let prompt: Option<String> = inputs.get("prompt").unwrap_or(None);
    let text: Option<String> = inputs.get("text").unwrap_or(None);
    let is_embeddings = prompt.is_none() && text.is_some();
    let path = if is_embeddings { "/api/embeddings" } else { "/api/generate" };

    let payload = Object::new(ctx.clone()).map_err(js_err)?;
    payload.set("model", model).map_err(js_err)?;
    if let Some(prompt) = &prompt {
        payload.set("prompt", prompt.as_str()).map_err(js_err)?;
    }
    if let Some(text) = &text {
        payload.set("text", text.as_str()).map_err(js_err)?;
    }
    if prompt.is_none() && text.is_none() {
        return Err(LocalflareError::InvalidArgument(
            "AI inputs must set either `prompt` or `text`".to_string(),
        ));
    }
    payload.set("stream", false).map_err(js_err)?;
    if let Some(options) = options {
        payload.set("options", options.clone()).map_err(js_err)?;
    }

    let json: Object<'js> = ctx.globals().get("JSON").map_err(js_err)?;
    let stringify: Function<'js> = json.get("stringify").map_err(js_err)?;
    let request_text: String = stringify.call((payload,)).map_err(js_err)?;

    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let http_response = client
        .post(&url)
        .header("content-type", "application/json")
        .body(request_text.clone())
        .send()
        .map_err(|e| LocalflareError::Internal(format!("AI model server request failed: {e}")))?;
    let status = http_response.status().as_u16();
    let response_text = http_response
        .text()
        .map_err(|e| LocalflareError::Internal(format!("AI model server response unreadable: {e}")))?;

    let parse: Function<'js> = json.get("parse").map_err(js_err)?;
    let parsed: Value<'js> = parse.call((response_text.clone(),)).map_err(js_err)?;
    let parsed_obj = parsed.as_object().cloned();

    let result = Object::new(ctx.clone()).map_err(js_err)?;
    if is_embeddings {
        let embedding: Value<'js> = parsed_obj
            .as_ref()
            .and_then(|o| o.get::<_, Value<'js>>("embedding").ok())
            .unwrap_or_else(|| Value::new_null(ctx.clone()));
        result.set("data", embedding).map_err(js_err)?;
    } else {
        let text: Option<String> = parsed_obj.as_ref().and_then(|o| o.get::<_, Option<String>>("response").unwrap_or(None));
        result.set("response", text).map_err(js_err)?;
    }

    Ok((result.into_value(), request_text.into_bytes(), response_text.into_bytes(), status))
}

fn js_err(e: rquickjs::Error) -> LocalflareError {
    LocalflareError::Internal(format!("AI binding JS interop failed: {e}"))
}

impl BindingModule for AiBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let base_url = self.base_url.clone();
        let client = self.client.clone();

        let run = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, model: String, inputs: Object<'js>, options: Option<Object<'js>>| -> rquickjs::Result<Value<'js>> {
                let (result, ..) = call_model(&ctx, &client, &base_url, &model, &inputs, &options).map_err(|e| throw(&ctx, e))?;
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

    #[test]
    fn binding_installs_a_callable_run_function() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let binding = AiBinding::new("AI", "http://127.0.0.1:1");
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
