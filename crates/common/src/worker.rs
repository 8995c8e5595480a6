use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::WorkerId;

/// What kind of resource a binding name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    Kv,
    Objects,
    Relational,
    Queue,
    Do,
    Vector,
    Ai,
    Gateway,
    Secret,
}

/// A binding descriptor: `{kind, target}`, where `target` identifies which
/// concrete resource of that kind (bucket id, namespace id, ...) the binding
/// resolves to, or (for `secret`) the literal value itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingDescriptor {
    pub kind: BindingKind,
    pub target: String,
}

/// A registered worker: immutable script body within a deployment, a route
/// table, and a name → binding-descriptor mapping.
///
/// Redeploying a worker (a new script body under the same id) bumps
/// `version`; the pool watches `version` to invalidate any cached compiled
/// artifact for that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub version: u64,
    pub script: String,
    pub routes: Vec<String>,
    pub bindings: HashMap<String, BindingDescriptor>,
}

impl Worker {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(),
            name: name.into(),
            version: 1,
            script: script.into(),
            routes: Vec::new(),
            bindings: HashMap::new(),
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, descriptor: BindingDescriptor) -> Self {
        self.bindings.insert(name.into(), descriptor);
        self
    }

    pub fn with_route(mut self, pattern: impl Into<String>) -> Self {
        self.routes.push(pattern.into());
        self
    }

    /// Replace the script body with a redeploy, bumping the version.
    pub fn redeploy(&mut self, new_script: impl Into<String>) {
        self.script = new_script.into();
        self.version += 1;
    }

    /// Does one of this worker's route patterns match `path`?
    ///
    /// Patterns are matched exactly, or as a prefix when they end in `/*`.
    pub fn matches(&self, path: &str) -> bool {
        self.routes.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix("/*") {
                path == prefix || path.starts_with(&format!("{prefix}/"))
            } else {
                pattern == path
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeploy_bumps_version() {
        let mut w = Worker::new("hello", "export default {}");
        assert_eq!(w.version, 1);
        w.redeploy("export default { fetch() {} }");
        assert_eq!(w.version, 2);
    }

    #[test]
    fn route_matching_exact_and_prefix() {
        let w = Worker::new("w", "").with_route("/api/*").with_route("/health");
        assert!(w.matches("/health"));
        assert!(w.matches("/api/users"));
        assert!(w.matches("/api"));
        assert!(!w.matches("/other"));
    }
}
