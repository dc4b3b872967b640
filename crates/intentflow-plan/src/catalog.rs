//! Module library and intent requirement registry.
//!
//! The catalog is static configuration: a YAML document listing the available
//! modules (canonical name, description, synonyms, required predecessors,
//! manifest file) and the intents with their ordered requirement groups.
//! [`ModuleCatalog`] is the validated, indexed form the rest of the system
//! queries.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use intentflow_types::{IntentflowError, Result};
use serde::{Deserialize, Serialize};

use crate::canon::{loose_key, normalize};

const BUILTIN_CATALOG: &str = include_str!("catalog.yaml");

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub intents: Vec<IntentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Modules that must be direct predecessors of this one.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Manifest file name, relative to the manifests directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentSpec {
    pub intent: String,
    pub requirements: RequirementSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Every module must be present.
    All,
    /// At least one module must be present.
    Any,
    /// Modules are tolerated but not required.
    Opt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementGroup {
    pub kind: GroupKind,
    pub modules: BTreeSet<String>,
}

impl RequirementGroup {
    pub fn new<I, S>(kind: GroupKind, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }
}

/// Ordered requirement groups for one intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementSpec(pub Vec<RequirementGroup>);

impl RequirementSpec {
    pub fn groups(&self) -> &[RequirementGroup] {
        &self.0
    }
}

impl FromIterator<RequirementGroup> for RequirementSpec {
    fn from_iter<T: IntoIterator<Item = RequirementGroup>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Catalog {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }
}

// ---------------------------------------------------------------------------
// ModuleCatalog: validated index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ModuleCatalog {
    modules: Vec<ModuleSpec>,
    intents: Vec<IntentSpec>,
    /// loose key of name or synonym -> index into `modules`
    aliases: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl ModuleCatalog {
    pub fn new(catalog: Catalog) -> Result<Self> {
        let mut aliases: HashMap<String, usize> = HashMap::new();
        let mut by_name = HashMap::new();

        for (idx, module) in catalog.modules.iter().enumerate() {
            if module.name.trim().is_empty() {
                return Err(IntentflowError::CatalogError(format!(
                    "module #{} has an empty name",
                    idx + 1
                )));
            }
            if by_name.insert(module.name.clone(), idx).is_some() {
                return Err(IntentflowError::CatalogError(format!(
                    "duplicate module '{}'",
                    module.name
                )));
            }
            for alias in std::iter::once(&module.name).chain(module.synonyms.iter()) {
                let key = loose_key(alias);
                match aliases.get(&key) {
                    Some(&other) if other != idx => {
                        return Err(IntentflowError::CatalogError(format!(
                            "alias '{}' maps to both '{}' and '{}'",
                            alias, catalog.modules[other].name, module.name
                        )));
                    }
                    _ => {
                        aliases.insert(key, idx);
                    }
                }
            }
        }

        for module in &catalog.modules {
            for dep in &module.requires {
                if !by_name.contains_key(dep) {
                    return Err(IntentflowError::CatalogError(format!(
                        "module '{}' requires unknown module '{}'",
                        module.name, dep
                    )));
                }
            }
        }

        let mut seen_intents = HashSet::new();
        for spec in &catalog.intents {
            if !seen_intents.insert(spec.intent.as_str()) {
                return Err(IntentflowError::CatalogError(format!(
                    "duplicate intent '{}'",
                    spec.intent
                )));
            }
            for group in spec.requirements.groups() {
                if group.modules.is_empty() {
                    return Err(IntentflowError::CatalogError(format!(
                        "intent '{}' has an empty requirement group",
                        spec.intent
                    )));
                }
                if let Some(unknown) = group.modules.iter().find(|m| !by_name.contains_key(*m)) {
                    return Err(IntentflowError::CatalogError(format!(
                        "intent '{}' requires unknown module '{}'",
                        spec.intent, unknown
                    )));
                }
            }
        }

        tracing::debug!(
            modules = catalog.modules.len(),
            intents = catalog.intents.len(),
            "Module catalog loaded"
        );

        Ok(Self {
            modules: catalog.modules,
            intents: catalog.intents,
            aliases,
            by_name,
        })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(Catalog::builtin()?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::new(Catalog::load(path)?)
    }

    /// Maps any spelling of a module to its canonical name. Unknown names come
    /// back normalized (trimmed, dashes folded, lowercased).
    pub fn canonicalize(&self, name: &str) -> String {
        match self.aliases.get(&loose_key(name)) {
            Some(&idx) => self.modules[idx].name.clone(),
            None => normalize(name),
        }
    }

    pub fn is_known(&self, module: &str) -> bool {
        self.by_name.contains_key(module)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleSpec> {
        self.by_name.get(name).map(|&idx| &self.modules[idx])
    }

    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn required_predecessors(&self, module: &str) -> &[String] {
        self.module(module)
            .map(|m| m.requires.as_slice())
            .unwrap_or(&[])
    }

    pub fn manifest_file(&self, module: &str) -> Option<&str> {
        self.module(module).and_then(|m| m.manifest.as_deref())
    }

    pub fn requirements(&self, intent: &str) -> Result<&RequirementSpec> {
        self.intents
            .iter()
            .find(|spec| spec.intent == intent)
            .map(|spec| &spec.requirements)
            .ok_or_else(|| IntentflowError::UnknownIntent(intent.to_string()))
    }

    /// Configured intents in declaration order.
    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.intents.iter().map(|spec| spec.intent.as_str())
    }
}
