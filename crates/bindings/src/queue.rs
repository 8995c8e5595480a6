//! The producer-side `Queue` binding: `send`/`sendBatch` against one
//! `localflare-storage` queue. Consumption (`pull`/`ack`/retry/dead-letter)
//! is driven by the scheduler, not exposed to worker code.

use std::sync::Arc;

use localflare_common::QueueId;
use localflare_runtime::BindingModule;
use localflare_storage::{MessageContentType, QueueStore};
use rquickjs::{Ctx, Function, Object, Value};

use crate::convert::throw;

pub struct QueueBinding {
    name: String,
    store: Arc<QueueStore>,
    queue: QueueId,
}

impl QueueBinding {
    pub fn new(name: impl Into<String>, store: Arc<QueueStore>, queue: QueueId) -> Self {
        Self {
            name: name.into(),
            store,
            queue,
        }
    }
}

/// Encodes a JS message body the way the real binding infers content type:
/// a string becomes `text`, a `Uint8Array` becomes `bytes`, everything else
/// is JSON-serialized.
fn encode_body<'js>(ctx: &Ctx<'js>, body: &Value<'js>, content_type: Option<&str>) -> rquickjs::Result<(Vec<u8>, MessageContentType)> {
    if let Some(content_type) = content_type {
        let kind = match content_type {
            "text" => MessageContentType::Text,
            "bytes" => MessageContentType::Bytes,
            "v8" => MessageContentType::V8,
            _ => MessageContentType::Json,
        };
        return Ok((encode_for(ctx, body, kind)?, kind));
    }
    if let Some(s) = body.as_string() {
        return Ok((s.to_string()?.into_bytes(), MessageContentType::Text));
    }
    if let Some(obj) = body.as_object() {
        if let Some(array) = obj.as_typed_array::<u8>() {
            return Ok((array.as_bytes().unwrap_or_default().to_vec(), MessageContentType::Bytes));
        }
    }
    encode_for(ctx, body, MessageContentType::Json).map(|bytes| (bytes, MessageContentType::Json))
}

fn encode_for<'js>(ctx: &Ctx<'js>, body: &Value<'js>, kind: MessageContentType) -> rquickjs::Result<Vec<u8>> {
    match kind {
        MessageContentType::Text => Ok(body.as_string().map(|s| s.to_string()).transpose()?.unwrap_or_default().into_bytes()),
        MessageContentType::Bytes | MessageContentType::V8 => Ok(body
            .as_object()
            .and_then(|o| o.as_typed_array::<u8>())
            .and_then(|a| a.as_bytes())
            .unwrap_or_default()
            .to_vec()),
        MessageContentType::Json => {
            let json: Object<'_> = ctx.globals().get("JSON")?;
            let stringify: Function<'_> = json.get("stringify")?;
            let text: String = stringify.call((body.clone(),))?;
            Ok(text.into_bytes())
        }
    }
}

impl BindingModule for QueueBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let queue = self.queue;

        {
            let store = self.store.clone();
            let send = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, body: Value<'js>, options: Option<Object<'js>>| -> rquickjs::Result<()> {
                    let (content_type, delay): (Option<String>, Option<i64>) = match &options {
                        Some(options) => (
                            options.get::<_, Option<String>>("contentType").unwrap_or(None),
                            options.get::<_, Option<i64>>("delaySeconds").unwrap_or(None),
                        ),
                        None => (None, None),
                    };
                    let (bytes, kind) = encode_body(&ctx, &body, content_type.as_deref())?;
                    store.send(queue, bytes, kind, delay).map_err(|e| throw(&ctx, e))?;
                    Ok(())
                },
            )?
            .with_name("send")?;
            obj.set("send", send)?;
        }

        {
            let store = self.store.clone();
            let send_batch = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, messages: Vec<Object<'js>>| -> rquickjs::Result<()> {
                    for message in messages {
                        let body: Value<'js> = message.get("body")?;
                        let options: Option<Object<'js>> = message.get("options").unwrap_or(None);
                        let (content_type, delay): (Option<String>, Option<i64>) = match &options {
                            Some(options) => (
                                options.get::<_, Option<String>>("contentType").unwrap_or(None),
                                options.get::<_, Option<i64>>("delaySeconds").unwrap_or(None),
                            ),
                            None => (None, None),
                        };
                        let (bytes, kind) = encode_body(&ctx, &body, content_type.as_deref())?;
                        store.send(queue, bytes, kind, delay).map_err(|e| throw(&ctx, e))?;
                    }
                    Ok(())
                },
            )?
            .with_name("sendBatch")?;
            obj.set("sendBatch", send_batch)?;
        }

        ctx.globals().set(self.binding_name(), obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_storage::{MetaDb, QueueSettings};

    fn default_settings() -> QueueSettings {
        QueueSettings {
            delivery_delay_secs: 0,
            message_ttl_secs: 3600,
            max_retries: 3,
            max_batch_size: 10,
            max_batch_timeout_ms: 1000,
            dead_letter_queue: None,
        }
    }

    #[test]
    fn sends_a_text_message_and_it_becomes_pullable() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(QueueStore::new(db));
        let queue = store.create_queue("jobs", &default_settings()).unwrap();
        let binding = QueueBinding::new("MY_QUEUE", store.clone(), queue);

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await MY_QUEUE.send('hello');
                    return new Response('ok', { status: 200 });
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

        let pulled = store.pull(queue, 10, 30).unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].body, b"hello");
    }
}
