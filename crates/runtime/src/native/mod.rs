//! Native (Rust-implemented) modules installed into every runtime instance.
//!
//! Grounded in `hyperlight-js-runtime::modules` — a `HashMap<&str,
//! ModuleDeclarationFn>` resolved by a `Loader`/`Resolver` pair, exactly the
//! teacher's `NativeModuleLoader` shape, just over `std::collections::HashMap`
//! instead of `hashbrown` (no `no_std` constraint here).

pub mod crypto;
pub mod encoding;

use std::collections::HashMap;
use std::sync::LazyLock;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::ModuleDef;
use rquickjs::{Ctx, Module, Result};

type ModuleDeclarationFn = for<'js> fn(Ctx<'js>, &str) -> Result<Module<'js>>;

fn declaration<M: ModuleDef>() -> ModuleDeclarationFn {
    fn declare<'js, M: ModuleDef>(ctx: Ctx<'js>, name: &str) -> Result<Module<'js>> {
        Module::declare_def::<M, _>(ctx, name)
    }
    declare::<M>
}

static NATIVE_MODULES: LazyLock<HashMap<&'static str, ModuleDeclarationFn>> =
    LazyLock::new(|| {
        HashMap::from([
            ("native:crypto", declaration::<crypto::js_native_crypto>()),
            ("native:encoding", declaration::<encoding::js_native_encoding>()),
        ])
    });

#[derive(Clone)]
pub(crate) struct NativeModuleLoader;

impl Resolver for NativeModuleLoader {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> Result<String> {
        if NATIVE_MODULES.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(rquickjs::Error::new_resolving(base, name))
        }
    }
}

impl Loader for NativeModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> Result<Module<'js>> {
        if let Some(declare) = NATIVE_MODULES.get(name) {
            declare(ctx.clone(), name)
        } else {
            Err(rquickjs::Error::new_loading(name))
        }
    }
}
