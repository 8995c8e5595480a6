//! The `Secret` binding: `env.MY_SECRET` resolves to a plain literal
//! string, the same shape `wrangler.toml`'s `[vars]`/secrets give a worker.
//! There's no storage backend here — the value lives in the worker's own
//! binding descriptor, supplied at registration time.

use localflare_runtime::BindingModule;
use rquickjs::Ctx;

pub struct SecretBinding {
    name: String,
    value: String,
}

impl SecretBinding {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl BindingModule for SecretBinding {
    fn binding_name(&self) -> &str {
        &self.name
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        ctx.globals().set(self.name.as_str(), self.value.clone())
    }
}
