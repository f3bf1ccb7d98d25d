//! Type and assembly registries
//!
//! The type registry is the bridge's only view into the runtime: an opaque
//! "resolve type by fully-qualified name" service. Assemblies are installed
//! manifests of classes; loading one publishes its classes into the type
//! registry.

use crate::object::ClassDef;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// Conventional module file extension used by the load-by-path probes.
pub const MODULE_EXT: &str = "rmod";

/// Registry of resolvable types, keyed by fully-qualified name.
#[derive(Default)]
pub struct TypeRegistry {
    types: DashMap<String, Arc<ClassDef>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a type by fully-qualified name.
    pub fn resolve(&self, name: &str) -> Option<Arc<ClassDef>> {
        self.types.get(name).map(|entry| entry.clone())
    }

    /// Publish a class definition. Re-publishing a name replaces the
    /// previous definition.
    pub fn register(&self, class: Arc<ClassDef>) {
        self.types.insert(class.name.clone(), class);
    }

    /// Number of published types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are published.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// An installable assembly: a named set of class manifests.
pub struct AssemblyManifest {
    /// Assembly name, used by the by-name load probe
    pub name: String,
    /// Classes published when the assembly is loaded
    pub classes: Vec<Arc<ClassDef>>,
}

impl AssemblyManifest {
    /// Create a manifest.
    pub fn new(name: &str, classes: Vec<Arc<ClassDef>>) -> Self {
        Self {
            name: name.into(),
            classes,
        }
    }
}

/// Registry of installed assemblies and their load state.
pub struct AssemblyRegistry {
    available: DashMap<String, Arc<AssemblyManifest>>,
    loaded: DashMap<String, ()>,
    types: Arc<TypeRegistry>,
}

impl AssemblyRegistry {
    /// Create a registry publishing into the given type registry.
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            available: DashMap::new(),
            loaded: DashMap::new(),
            types,
        }
    }

    /// Install a manifest, making it loadable by name.
    pub fn install(&self, manifest: AssemblyManifest) {
        self.available.insert(manifest.name.clone(), Arc::new(manifest));
    }

    /// Load an assembly. Probes, in order: the spec as an assembly name,
    /// the file stem of the spec interpreted as a path, and the file stem
    /// after appending the conventional module extension. Returns `false`
    /// once every probe fails; never faults. Loading is idempotent.
    pub fn load(&self, spec: &str) -> bool {
        if self.try_load(spec) {
            return true;
        }
        if let Some(stem) = file_stem(spec) {
            if stem != spec && self.try_load(&stem) {
                return true;
            }
        }
        let with_ext = format!("{spec}.{MODULE_EXT}");
        if let Some(stem) = file_stem(&with_ext) {
            if stem != spec && self.try_load(&stem) {
                return true;
            }
        }
        false
    }

    fn try_load(&self, name: &str) -> bool {
        let Some(manifest) = self.available.get(name).map(|entry| entry.clone()) else {
            return false;
        };
        if self.loaded.insert(name.to_string(), ()).is_none() {
            for class in &manifest.classes {
                self.types.register(class.clone());
            }
        }
        true
    }

    /// Whether the named assembly has been loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }
}

fn file_stem(spec: &str) -> Option<String> {
    Path::new(spec)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}
