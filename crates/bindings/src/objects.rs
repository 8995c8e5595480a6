//! The `R2Bucket`-shaped binding: object put/get/head/delete/list plus
//! multipart upload, backed by `localflare-storage::ObjectStore`.

use std::sync::Arc;

use localflare_common::{BucketId, LocalflareError};
use localflare_runtime::BindingModule;
use localflare_storage::{ObjectMeta, ObjectStore};
use rquickjs::{Ctx, Function, Object};

use crate::convert::throw;

pub struct ObjectBinding {
    name: String,
    store: Arc<ObjectStore>,
    bucket: BucketId,
}

impl ObjectBinding {
    pub fn new(name: impl Into<String>, store: Arc<ObjectStore>, bucket: BucketId) -> Self {
        Self {
            name: name.into(),
            store,
            bucket,
        }
    }
}

fn meta_to_object<'js>(ctx: &Ctx<'js>, meta: &ObjectMeta) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("key", meta.key.clone())?;
    obj.set("size", meta.size)?;
    obj.set("etag", meta.etag.clone())?;
    obj.set("uploaded", meta.updated)?;
    obj.set("customMetadata", meta.metadata.clone())?;
    let http_metadata = Object::new(ctx.clone())?;
    http_metadata.set("contentType", meta.content_type.clone())?;
    obj.set("httpMetadata", http_metadata)?;
    Ok(obj)
}

impl BindingModule for ObjectBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let bucket = self.bucket;

        {
            let store = self.store.clone();
            let put = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String, value: Vec<u8>, options: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                    let (content_type, metadata) = match &options {
                        Some(options) => (
                            options
                                .get::<_, Option<Object<'_>>>("httpMetadata")
                                .unwrap_or(None)
                                .and_then(|m| m.get::<_, Option<String>>("contentType").unwrap_or(None))
                                .unwrap_or_else(|| "application/octet-stream".to_string()),
                            options.get::<_, Option<String>>("customMetadata").unwrap_or(None),
                        ),
                        None => ("application/octet-stream".to_string(), None),
                    };
                    let meta = store.put(bucket, &key, value, &content_type, metadata).map_err(|e| throw(&ctx, e))?;
                    meta_to_object(&ctx, &meta)
                },
            )?
            .with_name("put")?;
            obj.set("put", put)?;
        }

        {
            let store = self.store.clone();
            let get = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Option<Object<'js>>> {
                    let entry = store.get(bucket, &key).map_err(|e| throw(&ctx, e))?;
                    entry
                        .map(|entry| {
                            let obj = meta_to_object(&ctx, &entry.meta)?;
                            obj.set("body", entry.bytes)?;
                            Ok(obj)
                        })
                        .transpose()
                },
            )?
            .with_name("get")?;
            obj.set("get", get)?;
        }

        {
            let store = self.store.clone();
            let head = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Option<Object<'js>>> {
                    store
                        .head(bucket, &key)
                        .map_err(|e| throw(&ctx, e))?
                        .map(|meta| meta_to_object(&ctx, &meta))
                        .transpose()
                },
            )?
            .with_name("head")?;
            obj.set("head", head)?;
        }

        {
            let store = self.store.clone();
            let delete = Function::new(ctx.clone(), move |ctx: Ctx<'_>, key: String| -> rquickjs::Result<()> {
                store.delete(bucket, &key).map_err(|e| throw(&ctx, e))
            })?
            .with_name("delete")?;
            obj.set("delete", delete)?;
        }

        {
            let store = self.store.clone();
            let list = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, options: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                    let (prefix, delimiter, limit, cursor) = match &options {
                        Some(options) => (
                            options.get::<_, Option<String>>("prefix").unwrap_or(None),
                            options.get::<_, Option<String>>("delimiter").unwrap_or(None),
                            options.get::<_, Option<usize>>("limit").unwrap_or(None).unwrap_or(1000),
                            options.get::<_, Option<String>>("cursor").unwrap_or(None),
                        ),
                        None => (None, None, 1000, None),
                    };
                    let page = store
                        .list(bucket, prefix.as_deref(), delimiter.as_deref(), limit, cursor.as_deref())
                        .map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    let objects = rquickjs::Array::new(ctx.clone())?;
                    for (i, meta) in page.objects.iter().enumerate() {
                        objects.set(i, meta_to_object(&ctx, meta)?)?;
                    }
                    result.set("objects", objects)?;
                    result.set("delimitedPrefixes", page.delimited_prefixes)?;
                    result.set("cursor", page.cursor)?;
                    Ok(result)
                },
            )?
            .with_name("list")?;
            obj.set("list", list)?;
        }

        {
            let store = self.store.clone();
            let create_multipart_upload = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String, options: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                    let (content_type, metadata) = match &options {
                        Some(options) => (
                            options
                                .get::<_, Option<Object<'_>>>("httpMetadata")
                                .unwrap_or(None)
                                .and_then(|m| m.get::<_, Option<String>>("contentType").unwrap_or(None))
                                .unwrap_or_else(|| "application/octet-stream".to_string()),
                            options.get::<_, Option<String>>("customMetadata").unwrap_or(None),
                        ),
                        None => ("application/octet-stream".to_string(), None),
                    };
                    let upload_id = store
                        .create_multipart_upload(bucket, &key, &content_type, metadata)
                        .map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    result.set("uploadId", upload_id)?;
                    result.set("key", key)?;
                    Ok(result)
                },
            )?
            .with_name("createMultipartUpload")?;
            obj.set("createMultipartUpload", create_multipart_upload)?;
        }

        {
            let store = self.store.clone();
            let resume_multipart_upload = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String, upload_id: String| -> rquickjs::Result<Object<'js>> {
                    let resumed_key = store.resume_multipart_upload(&upload_id).map_err(|e| throw(&ctx, e))?;
                    if resumed_key != key {
                        return Err(throw(
                            &ctx,
                            LocalflareError::NotFound(format!("multipart upload {upload_id} does not match key {key}")),
                        ));
                    }
                    let result = Object::new(ctx.clone())?;
                    result.set("uploadId", upload_id)?;
                    result.set("key", key)?;
                    Ok(result)
                },
            )?
            .with_name("resumeMultipartUpload")?;
            obj.set("resumeMultipartUpload", resume_multipart_upload)?;
        }

        {
            let store = self.store.clone();
            let upload_part = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, upload_id: String, part_number: u32, bytes: Vec<u8>| -> rquickjs::Result<Object<'js>> {
                    let etag = store.upload_part(&upload_id, part_number, bytes).map_err(|e| throw(&ctx, e))?;
                    let result = Object::new(ctx.clone())?;
                    result.set("partNumber", part_number)?;
                    result.set("etag", etag)?;
                    Ok(result)
                },
            )?
            .with_name("uploadPart")?;
            obj.set("uploadPart", upload_part)?;
        }

        {
            let store = self.store.clone();
            let complete = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, upload_id: String| -> rquickjs::Result<Object<'js>> {
                    let meta = store.complete_multipart_upload(&upload_id).map_err(|e| throw(&ctx, e))?;
                    meta_to_object(&ctx, &meta)
                },
            )?
            .with_name("completeMultipartUpload")?;
            obj.set("completeMultipartUpload", complete)?;
        }

        {
            let store = self.store.clone();
            let abort = Function::new(ctx.clone(), move |ctx: Ctx<'_>, upload_id: String| -> rquickjs::Result<()> {
                store.abort_multipart_upload(&upload_id).map_err(|e| throw(&ctx, e))
            })?
            .with_name("abortMultipartUpload")?;
            obj.set("abortMultipartUpload", abort)?;
        }

        ctx.globals().set(self.binding_name(), obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_storage::MetaDb;
    use tempfile::tempdir;

    #[test]
    fn installs_a_usable_put_get_object() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let dir = tempdir().unwrap();
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(ObjectStore::new(db, dir.path()));
        let bucket = store.create_bucket("test").unwrap();
        let binding = ObjectBinding::new("MY_BUCKET", store, bucket);

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await MY_BUCKET.put('a.txt', 'hello');
                    const obj = await MY_BUCKET.get('a.txt');
                    const text = new TextDecoder().decode(obj.body);
                    return new Response(text, { status: text === 'hello' ? 200 : 500 });
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
