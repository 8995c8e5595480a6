//! The `VectorizeIndex`-shaped binding: `insert`/`upsert`/`query`/
//! `getByIds`/`deleteByIds` against one `localflare-storage` vector index.

use std::sync::Arc;

use localflare_runtime::BindingModule;
use localflare_storage::{Match, QueryOptions, VectorEntry, VectorStore};
use rquickjs::{Array, Ctx, Function, Object};

use crate::convert::throw;

pub struct VectorBinding {
    name: String,
    store: Arc<VectorStore>,
    index: String,
}

impl VectorBinding {
    pub fn new(name: impl Into<String>, store: Arc<VectorStore>, index: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store,
            index: index.into(),
        }
    }
}

fn object_to_entry<'js>(ctx: &Ctx<'js>, obj: &Object<'js>) -> rquickjs::Result<VectorEntry> {
    let id: Option<String> = obj.get("id").unwrap_or(None);
    let values: Vec<f32> = obj.get("values")?;
    let namespace: Option<String> = obj.get("namespace").unwrap_or(None);
    let metadata_value: Option<Object<'js>> = obj.get("metadata").unwrap_or(None);
    let metadata = match metadata_value {
        Some(metadata) => {
            let json: Object<'_> = ctx.globals().get("JSON")?;
            let stringify: Function<'_> = json.get("stringify")?;
            let text: String = stringify.call((metadata,))?;
            Some(text)
        }
        None => None,
    };
    Ok(VectorEntry {
        id: id.unwrap_or_default(),
        namespace,
        values,
        metadata,
    })
}

fn match_to_object<'js>(ctx: &Ctx<'js>, m: &Match) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("id", m.id.clone())?;
    obj.set("score", m.score)?;
    if let Some(values) = &m.values {
        obj.set("values", values.clone())?;
    }
    if let Some(metadata) = &m.metadata {
        let json: Object<'_> = ctx.globals().get("JSON")?;
        let parse: Function<'_> = json.get("parse")?;
        let parsed: rquickjs::Value<'js> = parse.call((metadata.clone(),))?;
        obj.set("metadata", parsed)?;
    }
    Ok(obj)
}

impl BindingModule for VectorBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let index = self.index.clone();

        {
            let store = self.store.clone();
            let index = index.clone();
            let insert = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, vectors: Vec<Object<'js>>| -> rquickjs::Result<Vec<String>> {
                    let entries = vectors
                        .iter()
                        .map(|v| object_to_entry(&ctx, v))
                        .collect::<rquickjs::Result<Vec<_>>>()?;
                    store.insert(&index, &entries).map_err(|e| throw(&ctx, e))
                },
            )?
            .with_name("insert")?;
            obj.set("insert", insert)?;
        }

        {
            let store = self.store.clone();
            let index = index.clone();
            let upsert = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, vectors: Vec<Object<'js>>| -> rquickjs::Result<Vec<String>> {
                    let entries = vectors
                        .iter()
                        .map(|v| object_to_entry(&ctx, v))
                        .collect::<rquickjs::Result<Vec<_>>>()?;
                    store.upsert(&index, &entries).map_err(|e| throw(&ctx, e))
                },
            )?
            .with_name("upsert")?;
            obj.set("upsert", upsert)?;
        }

        {
            let store = self.store.clone();
            let index = index.clone();
            let get_by_ids = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, ids: Vec<String>| -> rquickjs::Result<Array<'js>> {
                    let entries = store.get_by_ids(&index, &ids).map_err(|e| throw(&ctx, e))?;
                    let out = Array::new(ctx.clone())?;
                    for (i, entry) in entries.iter().enumerate() {
                        let item = Object::new(ctx.clone())?;
                        item.set("id", entry.id.clone())?;
                        item.set("values", entry.values.clone())?;
                        item.set("namespace", entry.namespace.clone())?;
                        if let Some(metadata) = &entry.metadata {
                            let json: Object<'_> = ctx.globals().get("JSON")?;
                            let parse: Function<'_> = json.get("parse")?;
                            let parsed: rquickjs::Value<'js> = parse.call((metadata.clone(),))?;
                            item.set("metadata", parsed)?;
                        }
                        out.set(i, item)?;
                    }
                    Ok(out)
                },
            )?
            .with_name("getByIds")?;
            obj.set("getByIds", get_by_ids)?;
        }

        {
            let store = self.store.clone();
            let index = index.clone();
            let delete_by_ids = Function::new(ctx.clone(), move |ctx: Ctx<'_>, ids: Vec<String>| -> rquickjs::Result<u64> {
                store.delete_by_ids(&index, &ids).map_err(|e| throw(&ctx, e))
            })?
            .with_name("deleteByIds")?;
            obj.set("deleteByIds", delete_by_ids)?;
        }

        {
            let store = self.store.clone();
            let index = index.clone();
            let query = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, vector: Vec<f32>, options: Option<Object<'js>>| -> rquickjs::Result<Object<'js>> {
                    let (top_k, namespace, return_values, return_metadata, filter) = match &options {
                        Some(options) => {
                            let filter_obj: Option<Object<'_>> = options.get("filter").unwrap_or(None);
                            let filter = match filter_obj {
                                Some(f) => {
                                    let json: Object<'_> = ctx.globals().get("JSON")?;
                                    let stringify: Function<'_> = json.get("stringify")?;
                                    let text: String = stringify.call((f,))?;
                                    Some(text)
                                }
                                None => None,
                            };
                            (
                                options.get::<_, Option<usize>>("topK").unwrap_or(None).unwrap_or(5),
                                options.get::<_, Option<String>>("namespace").unwrap_or(None),
                                options.get::<_, Option<bool>>("returnValues").unwrap_or(None).unwrap_or(false),
                                options.get::<_, Option<bool>>("returnMetadata").unwrap_or(None).unwrap_or(false),
                                filter,
                            )
                        }
                        None => (5, None, false, false, None),
                    };
                    let query_options = QueryOptions {
                        top_k,
                        namespace: namespace.as_deref(),
                        return_values,
                        return_metadata,
                        filter: filter.as_deref(),
                    };
                    let matches = store.query(&index, &vector, &query_options).map_err(|e| throw(&ctx, e))?;
                    let out = Object::new(ctx.clone())?;
                    let array = Array::new(ctx.clone())?;
                    for (i, m) in matches.iter().enumerate() {
                        array.set(i, match_to_object(&ctx, m)?)?;
                    }
                    out.set("matches", array)?;
                    out.set("count", matches.len())?;
                    Ok(out)
                },
            )?
            .with_name("query")?;
            obj.set("query", query)?;
        }

        ctx.globals().set(self.binding_name(), obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localflare_storage::{MetaDb, Metric};

    #[test]
    fn insert_then_query_returns_the_nearest_match() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(VectorStore::new(db));
        store.create_index("idx", 2, Metric::Cosine).unwrap();
        let binding = VectorBinding::new("MY_VECTORIZE", store, "idx");

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await MY_VECTORIZE.insert([{ id: 'a', values: [1, 0] }, { id: 'b', values: [0, 1] }]);
                    const result = await MY_VECTORIZE.query([1, 0.1], { topK: 1 });
                    const ok = result.matches.length === 1 && result.matches[0].id === 'a';
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

    #[test]
    fn query_filter_restricts_matches_by_metadata() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let db = MetaDb::open_in_memory().unwrap();
        let store = Arc::new(VectorStore::new(db));
        store.create_index("idx", 2, Metric::Cosine).unwrap();
        let binding = VectorBinding::new("MY_VECTORIZE", store, "idx");

        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await MY_VECTORIZE.insert([
                        { id: 'a', values: [1, 0], metadata: { genre: 'drama' } },
                        { id: 'b', values: [1, 0.05], metadata: { genre: 'comedy' } },
                    ]);
                    const result = await MY_VECTORIZE.query([1, 0], { topK: 5, filter: { genre: 'comedy' } });
                    const ok = result.matches.length === 1 && result.matches[0].id === 'b';
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
