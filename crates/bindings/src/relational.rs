//! The D1-style relational binding: `.prepare(sql).bind(...).all()/.first()/
//! .run()/.raw()`, plus `.batch()`, `.exec()`, and `.dump()` on the database
//! object itself.
//!
//! A prepared statement is a plain JS object carrying its `sql` string and
//! bound `params` array as ordinary properties (`_sql`/`_params`) rather
//! than hidden Rust state, so `db.batch([...])` can read an array of them
//! back out without needing a native handle type.

use std::sync::Arc;

use localflare_common::{DbId, WireValue};
use localflare_runtime::BindingModule;
use localflare_storage::{QueryMeta, RelationalStore};
use rquickjs::prelude::Rest;
use rquickjs::{Array, Ctx, Function, Object, Value};

use crate::convert::{args_to_wire, row_to_object, throw};

pub struct RelationalBinding {
    name: String,
    store: Arc<RelationalStore>,
    db: DbId,
}

impl RelationalBinding {
    pub fn new(name: impl Into<String>, store: Arc<RelationalStore>, db: DbId) -> Self {
        Self {
            name: name.into(),
            store,
            db,
        }
    }
}

fn meta_to_object<'js>(ctx: &Ctx<'js>, meta: &QueryMeta) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("rows_read", meta.rows_read)?;
    obj.set("rows_written", meta.rows_written)?;
    obj.set("duration", meta.duration_ms)?;
    obj.set("changes", meta.changes)?;
    obj.set("last_row_id", meta.last_row_id)?;
    obj.set("changed_db", meta.changed_db)?;
    obj.set("served_by", meta.served_by.as_str())?;
    Ok(obj)
}

fn statement_object<'js>(ctx: &Ctx<'js>, sql: &str, params: &[WireValue]) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("_sql", sql)?;
    let array = Array::new(ctx.clone())?;
    for (i, param) in params.iter().enumerate() {
        array.set(i, crate::convert::from_wire(ctx, param)?)?;
    }
    obj.set("_params", array)?;

    let bind_sql = sql.to_string();
    let bind = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Object<'js>> {
            let params = args_to_wire(&ctx, &args)?;
            statement_object(&ctx, &bind_sql, &params)
        },
    )?
    .with_name("bind")?;
    obj.set("bind", bind)?;
    Ok(obj)
}

fn statement_sql_and_params<'js>(ctx: &Ctx<'js>, statement: &Object<'js>) -> rquickjs::Result<(String, Vec<WireValue>)> {
    let sql: String = statement.get("_sql")?;
    let params_array: Array<'js> = statement.get("_params")?;
    let mut params = Vec::with_capacity(params_array.len());
    for value in params_array.iter::<Value<'js>>() {
        params.push(crate::convert::to_wire(ctx, &value?)?);
    }
    Ok((sql, params))
}

impl BindingModule for RelationalBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let obj = Object::new(ctx.clone())?;
        let db = self.db;

        {
            let prepare = Function::new(ctx.clone(), move |ctx: Ctx<'js>, sql: String| -> rquickjs::Result<Object<'js>> {
                statement_object(&ctx, &sql, &[])
            })?
            .with_name("prepare")?;
            obj.set("prepare", prepare)?;
        }

        {
            let store = self.store.clone();
            let all = Function::new(ctx.clone(), move |ctx: Ctx<'js>, statement: Object<'js>| -> rquickjs::Result<Object<'js>> {
                let (sql, params) = statement_sql_and_params(&ctx, &statement)?;
                let result = store.all(db, &sql, &params).map_err(|e| throw(&ctx, e))?;
                let out = Object::new(ctx.clone())?;
                let results = Array::new(ctx.clone())?;
                for (i, row) in result.results.iter().enumerate() {
                    results.set(i, row_to_object(&ctx, row)?)?;
                }
                out.set("results", results)?;
                out.set("success", true)?;
                out.set("meta", meta_to_object(&ctx, &result.meta)?)?;
                Ok(out)
            })?
            .with_name("__all")?;
            obj.set("__all", all)?;
        }

        {
            let store = self.store.clone();
            let first = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, statement: Object<'js>, column: Option<String>| -> rquickjs::Result<Value<'js>> {
                    let (sql, params) = statement_sql_and_params(&ctx, &statement)?;
                    let result = store.all(db, &sql, &params).map_err(|e| throw(&ctx, e))?;
                    let Some(row) = result.results.first() else {
                        return Ok(Value::new_null(ctx.clone()));
                    };
                    match column {
                        Some(column) => match row.iter().find(|(name, _)| *name == column) {
                            Some((_, value)) => crate::convert::from_wire(&ctx, value),
                            None => Ok(Value::new_null(ctx.clone())),
                        },
                        None => row_to_object(&ctx, row).map(|o| o.into_value()),
                    }
                },
            )?
            .with_name("__first")?;
            obj.set("__first", first)?;
        }

        {
            let store = self.store.clone();
            let raw = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, statement: Object<'js>, options: Option<Object<'js>>| -> rquickjs::Result<Array<'js>> {
                    let (sql, params) = statement_sql_and_params(&ctx, &statement)?;
                    let result = store.all(db, &sql, &params).map_err(|e| throw(&ctx, e))?;
                    let want_column_names = options
                        .as_ref()
                        .and_then(|o| o.get::<_, Option<bool>>("columnNames").unwrap_or(None))
                        .unwrap_or(false);
                    let rows = Array::new(ctx.clone())?;
                    let mut i = 0usize;
                    if want_column_names {
                        if let Some(first_row) = result.results.first() {
                            let header = Array::new(ctx.clone())?;
                            for (j, (name, _)) in first_row.iter().enumerate() {
                                header.set(j, name.as_str())?;
                            }
                            rows.set(i, header)?;
                            i += 1;
                        }
                    }
                    for row in &result.results {
                        let values = Array::new(ctx.clone())?;
                        for (j, (_, value)) in row.iter().enumerate() {
                            values.set(j, crate::convert::from_wire(&ctx, value)?)?;
                        }
                        rows.set(i, values)?;
                        i += 1;
                    }
                    Ok(rows)
                },
            )?
            .with_name("__raw")?;
            obj.set("__raw", raw)?;
        }

        {
            let store = self.store.clone();
            let run = Function::new(ctx.clone(), move |ctx: Ctx<'js>, statement: Object<'js>| -> rquickjs::Result<Object<'js>> {
                let (sql, params) = statement_sql_and_params(&ctx, &statement)?;
                let result = store.run(db, &sql, &params).map_err(|e| throw(&ctx, e))?;
                let out = Object::new(ctx.clone())?;
                out.set("success", true)?;
                out.set("meta", meta_to_object(&ctx, &result.meta)?)?;
                Ok(out)
            })?
            .with_name("__run")?;
            obj.set("__run", run)?;
        }

        {
            let store = self.store.clone();
            let batch = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, statements: Vec<Object<'js>>| -> rquickjs::Result<Array<'js>> {
                    let mut stmts = Vec::with_capacity(statements.len());
                    for statement in &statements {
                        stmts.push(statement_sql_and_params(&ctx, statement)?);
                    }
                    let results = store.batch(db, &stmts).map_err(|e| throw(&ctx, e))?;
                    let out = Array::new(ctx.clone())?;
                    for (i, result) in results.iter().enumerate() {
                        let item = Object::new(ctx.clone())?;
                        item.set("success", true)?;
                        item.set("meta", meta_to_object(&ctx, &result.meta)?)?;
                        out.set(i, item)?;
                    }
                    Ok(out)
                },
            )?
            .with_name("batch")?;
            obj.set("batch", batch)?;
        }

        {
            let store = self.store.clone();
            let exec = Function::new(ctx.clone(), move |ctx: Ctx<'js>, sql: String| -> rquickjs::Result<Object<'js>> {
                let count = store.exec(db, &sql).map_err(|e| throw(&ctx, e))?;
                let out = Object::new(ctx.clone())?;
                out.set("count", count)?;
                Ok(out)
            })?
            .with_name("exec")?;
            obj.set("exec", exec)?;
        }

        {
            let store = self.store.clone();
            let dump = Function::new(ctx.clone(), move |ctx: Ctx<'_>| -> rquickjs::Result<Vec<u8>> {
                store.dump(db).map_err(|e| throw(&ctx, e))
            })?
            .with_name("dump")?;
            obj.set("dump", dump)?;
        }

        ctx.globals().set(self.binding_name(), obj)?;

        // `.all()/.first()/.raw()/.run()` live on the *statement* object in
        // the worker-facing API, not the database object; the database
        // exposes `__all`/`__first`/`__raw`/`__run` taking the statement as
        // an argument, and this bootstrap-style shim attaches the ergonomic
        // methods onto every statement `prepare()` returns.
        let shim = format!(
            r#"
            (() => {{
                const db = globalThis["{name}"];
                const wrap = (stmt) => {{
                    const boundBind = stmt.bind;
                    stmt.bind = (...args) => wrap(boundBind(...args));
                    stmt.all = () => db.__all(stmt);
                    stmt.first = (column) => db.__first(stmt, column);
                    stmt.raw = (options) => db.__raw(stmt, options);
                    stmt.run = () => db.__run(stmt);
                    return stmt;
                }};
                const boundPrepare = db.prepare;
                db.prepare = (sql) => wrap(boundPrepare(sql));
            }})();
            "#,
            name = self.binding_name()
        );
        ctx.eval::<(), _>(shim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prepared_statement_binds_and_queries() {
        let runtime = localflare_runtime::JsRuntime::new().expect("runtime should build");
        let dir = tempdir().unwrap();
        let store = Arc::new(RelationalStore::new(dir.path()));
        let db_id = DbId::new();
        store.create_database(db_id).unwrap();
        let binding = RelationalBinding::new("DB", store, db_id);
        runtime.install_bindings(&[Box::new(binding)]).unwrap();

        let script = localflare_runtime::Script::from_content(
            r#"
            addEventListener('fetch', (event) => {
                event.respondWith((async () => {
                    await DB.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)");
                    await DB.prepare("INSERT INTO users (name) VALUES (?)").bind("Alice").run();
                    const row = await DB.prepare("SELECT name FROM users WHERE id = ?").bind(1).first();
                    return new Response(row.name, { status: row.name === 'Alice' ? 200 : 500 });
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
