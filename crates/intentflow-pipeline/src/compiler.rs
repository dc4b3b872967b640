//! Workflow compiler: expands a validated module graph into an Argo
//! `Workflow` manifest.
//!
//! Each module contributes one resource-apply template per document of its
//! manifest, or a single no-op container stub when it has none. Module edges
//! fan out to every task of the downstream module.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use intentflow_plan::ModuleCatalog;
use intentflow_types::{IntentflowError, Result};
use serde::{Deserialize, Serialize};

use crate::graph::TaskGraph;

pub const ENTRYPOINT: &str = "main-dag";
const STUB_IMAGE: &str = "alpine:3.20";

// ---------------------------------------------------------------------------
// Manifest registry
// ---------------------------------------------------------------------------

/// Per-module declarative resources.
pub trait ManifestRegistry: Send + Sync {
    /// File name the module maps to, whether or not it exists.
    fn file_name(&self, module: &str) -> Option<String>;

    /// Raw manifest text, or `None` when nothing is available.
    fn read(&self, module: &str) -> Result<Option<String>>;
}

/// Manifests stored as files in one directory, named by the catalog.
pub struct DirManifestRegistry {
    dir: PathBuf,
    catalog: Arc<ModuleCatalog>,
}

impl DirManifestRegistry {
    pub fn new(dir: impl Into<PathBuf>, catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            dir: dir.into(),
            catalog,
        }
    }
}

impl ManifestRegistry for DirManifestRegistry {
    fn file_name(&self, module: &str) -> Option<String> {
        self.catalog.manifest_file(module).map(str::to_string)
    }

    fn read(&self, module: &str) -> Result<Option<String>> {
        let Some(file) = self.catalog.manifest_file(module) else {
            return Ok(None);
        };
        let path = self.dir.join(file);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(module, path = %path.display(), "Manifest file not found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory registry: module → (file name, content).
impl ManifestRegistry for HashMap<String, (String, String)> {
    fn file_name(&self, module: &str) -> Option<String> {
        self.get(module).map(|(f, _)| f.clone())
    }

    fn read(&self, module: &str) -> Result<Option<String>> {
        Ok(self.get(module).map(|(_, c)| c.clone()))
    }
}

// ---------------------------------------------------------------------------
// Workflow document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkflowMetadata,
    pub spec: WorkflowSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub generate_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub entrypoint: String,
    pub templates: Vec<Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(flatten)]
    pub body: TemplateBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateBody {
    Container(Container),
    Resource(Resource),
    Dag(Dag),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub action: String,
    pub manifest: String,
    pub set_owner_reference: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub tasks: Vec<DagTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagTask {
    pub name: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl Workflow {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// The top-level DAG template's tasks.
    pub fn tasks(&self) -> &[DagTask] {
        self.spec
            .templates
            .iter()
            .find_map(|t| match &t.body {
                TemplateBody::Dag(dag) if t.name == self.spec.entrypoint => {
                    Some(dag.tasks.as_slice())
                }
                _ => None,
            })
            .unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub namespace: String,
    pub wait_for_dependencies: bool,
    pub service_account: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            namespace: "agentic-ai".into(),
            wait_for_dependencies: true,
            service_account: Some("argo-executor".into()),
        }
    }
}

pub struct WorkflowCompiler {
    registry: Arc<dyn ManifestRegistry>,
}

impl WorkflowCompiler {
    pub fn new(registry: Arc<dyn ManifestRegistry>) -> Self {
        Self { registry }
    }

    pub fn compile(&self, name: &str, graph: &TaskGraph, options: &CompileOptions) -> Result<Workflow> {
        let mut names = UniqueNames::default();
        let mut templates = Vec::new();
        let mut node_tasks: HashMap<&str, Vec<String>> = HashMap::new();

        for node in graph.nodes() {
            let base = match self.registry.file_name(node) {
                Some(file) => sanitize_name(file_stem(&file)),
                None => sanitize_name(&format!("no-manifest-{node}")),
            };
            let mut tasks = Vec::new();

            match self.registry.read(node)? {
                None => {
                    let tname = names.unique(&base);
                    templates.push(stub(&tname, &format!("No manifest mapped for {node}. Skipping.")));
                    tasks.push(tname);
                }
                Some(content) => match split_documents(node, &content) {
                    Ok(docs) if docs.is_empty() => {
                        let tname = names.unique(&base);
                        templates.push(stub(&tname, &format!("Empty manifest for {node}. Skipping.")));
                        tasks.push(tname);
                    }
                    Ok(docs) => {
                        for (i, doc) in docs.iter().enumerate() {
                            let tname = names.unique(&doc_display_name(&base, doc, i + 1));
                            templates.push(Template {
                                name: tname.clone(),
                                body: TemplateBody::Resource(Resource {
                                    action: "apply".into(),
                                    manifest: serde_yaml::to_string(doc)?,
                                    set_owner_reference: true,
                                }),
                            });
                            tasks.push(tname);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(module = %node, error = %e, "Manifest unreadable, emitting stub");
                        let tname = names.unique(&base);
                        templates.push(stub(&tname, &format!("Invalid manifest for {node}. Skipping.")));
                        tasks.push(tname);
                    }
                },
            }
            node_tasks.insert(node.as_str(), tasks);
        }

        let mut dag_tasks = Vec::new();
        for node in graph.nodes() {
            let mut upstream: Vec<String> = Vec::new();
            let mut seen: HashSet<&str> = HashSet::new();
            for pred in graph.predecessors(node) {
                for t in node_tasks.get(pred.as_str()).into_iter().flatten() {
                    if seen.insert(t.as_str()) {
                        upstream.push(t.clone());
                    }
                }
            }
            for tname in node_tasks.get(node.as_str()).into_iter().flatten() {
                dag_tasks.push(DagTask {
                    name: tname.clone(),
                    template: tname.clone(),
                    dependencies: if options.wait_for_dependencies {
                        upstream.clone()
                    } else {
                        Vec::new()
                    },
                });
            }
        }

        let task_count = dag_tasks.len();
        templates.push(Template {
            name: ENTRYPOINT.into(),
            body: TemplateBody::Dag(Dag { tasks: dag_tasks }),
        });

        tracing::info!(workflow = name, tasks = task_count, "Workflow compiled");

        Ok(Workflow {
            api_version: "argoproj.io/v1alpha1".into(),
            kind: "Workflow".into(),
            metadata: WorkflowMetadata {
                generate_name: format!("{name}-"),
                namespace: options.namespace.clone(),
            },
            spec: WorkflowSpec {
                entrypoint: ENTRYPOINT.into(),
                templates,
                parallelism: (!options.wait_for_dependencies).then(|| task_count.max(1)),
                service_account_name: options.service_account.clone(),
            },
        })
    }
}

/// The message is passed as an argument to `echo`, never through a shell.
fn stub(name: &str, message: &str) -> Template {
    Template {
        name: name.to_string(),
        body: TemplateBody::Container(Container {
            image: STUB_IMAGE.into(),
            command: vec!["echo".into()],
            args: vec![message.to_string()],
        }),
    }
}

/// Non-empty YAML documents of a manifest.
fn split_documents(module: &str, content: &str) -> Result<Vec<serde_yaml::Value>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(de).map_err(|e| IntentflowError::ManifestError {
            module: module.to_string(),
            message: e.to_string(),
        })?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

fn doc_display_name(base: &str, doc: &serde_yaml::Value, idx: usize) -> String {
    let kind = doc
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or("obj")
        .to_lowercase();
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(serde_yaml::Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{kind}-{idx}"));
    sanitize_name(&format!("{base}-{kind}-{name}"))
}

fn file_stem(file: &str) -> &str {
    Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file)
}

/// Lowercase; anything outside `[a-z0-9-]` becomes `-`; runs of `-` collapse;
/// leading and trailing `-` are trimmed. Empty results become `unnamed`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unnamed".into()
    } else {
        trimmed.to_string()
    }
}

/// Appends `-2`, `-3`... to names already handed out.
#[derive(Default)]
struct UniqueNames {
    counts: HashMap<String, usize>,
}

impl UniqueNames {
    fn unique(&mut self, name: &str) -> String {
        let count = self.counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            name.to_string()
        } else {
            format!("{name}-{count}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intentflow_plan::Edge;

    fn registry(entries: &[(&str, &str, &str)]) -> Arc<dyn ManifestRegistry> {
        let map: HashMap<String, (String, String)> = entries
            .iter()
            .map(|(m, f, c)| (m.to_string(), (f.to_string(), c.to_string())))
            .collect();
        Arc::new(map)
    }

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> TaskGraph {
        TaskGraph::new(
            nodes.iter().map(|s| s.to_string()).collect(),
            edges.iter().map(|(a, b)| Edge::new(*a, *b)).collect(),
        )
    }

    const TWO_DOCS: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: predictor\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: predictor-svc\n";

    #[test]
    fn sanitize_name_cases() {
        assert_eq!(sanitize_name("Traffic_Steering.v2"), "traffic-steering-v2");
        assert_eq!(sanitize_name("--A  B--"), "a-b");
        assert_eq!(sanitize_name("no-manifest-UE-Monitor"), "no-manifest-ue-monitor");
        assert_eq!(sanitize_name("***"), "unnamed");
    }

    #[test]
    fn fan_out_fan_in() {
        let compiler = WorkflowCompiler::new(registry(&[
            ("A", "a.yaml", TWO_DOCS),
            ("B", "b.yaml", "kind: Job\nmetadata:\n  name: run\n"),
        ]));
        let wf = compiler
            .compile("demo", &graph(&["A", "B"], &[("A", "B")]), &CompileOptions::default())
            .unwrap();

        let tasks = wf.tasks();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].name, "a-deployment-predictor");
        assert_eq!(tasks[1].name, "a-service-predictor-svc");
        assert_eq!(tasks[2].name, "b-job-run");
        assert_eq!(
            tasks[2].dependencies,
            vec!["a-deployment-predictor", "a-service-predictor-svc"]
        );
        assert!(tasks[0].dependencies.is_empty());
        assert_eq!(wf.spec.parallelism, None);
    }

    #[test]
    fn missing_and_empty_manifests_become_stubs() {
        let compiler = WorkflowCompiler::new(registry(&[("E", "empty.yaml", "---\n")]));
        let wf = compiler
            .compile("demo", &graph(&["UE-Monitor", "E"], &[]), &CompileOptions::default())
            .unwrap();

        let names: Vec<_> = wf.spec.templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["no-manifest-ue-monitor", "empty", ENTRYPOINT]);
        match &wf.spec.templates[0].body {
            TemplateBody::Container(c) => {
                assert_eq!(c.image, "alpine:3.20");
                assert_eq!(c.command, vec!["echo"]);
                assert_eq!(c.args, vec!["No manifest mapped for UE-Monitor. Skipping."]);
            }
            other => panic!("expected stub, got {other:?}"),
        }
        match &wf.spec.templates[1].body {
            TemplateBody::Container(c) => assert!(c.args[0].contains("Empty manifest for E")),
            other => panic!("expected stub, got {other:?}"),
        }
    }

    #[test]
    fn stub_message_is_not_shell_interpreted() {
        let compiler = WorkflowCompiler::new(registry(&[]));
        let node = "it's'; rm -rf / #";
        let wf = compiler
            .compile("demo", &graph(&[node], &[]), &CompileOptions::default())
            .unwrap();
        match &wf.spec.templates[0].body {
            TemplateBody::Container(c) => {
                assert!(!c.command.iter().any(|part| part == "sh" || part == "-c"));
                assert_eq!(c.args, vec![format!("No manifest mapped for {node}. Skipping.")]);
            }
            other => panic!("expected stub, got {other:?}"),
        }
        assert!(wf.to_yaml().unwrap().contains("rm -rf"));
    }

    #[test]
    fn unparseable_manifest_becomes_stub() {
        let compiler = WorkflowCompiler::new(registry(&[("X", "x.yaml", "key: [unclosed\n")]));
        let wf = compiler
            .compile("demo", &graph(&["X"], &[]), &CompileOptions::default())
            .unwrap();
        assert!(matches!(wf.spec.templates[0].body, TemplateBody::Container(_)));
    }

    #[test]
    fn colliding_names_get_suffixes() {
        let doc = "kind: Pod\nmetadata:\n  name: same\n";
        let compiler = WorkflowCompiler::new(registry(&[
            ("A", "shared.yaml", doc),
            ("B", "shared.yaml", doc),
        ]));
        let wf = compiler
            .compile("demo", &graph(&["A", "B"], &[]), &CompileOptions::default())
            .unwrap();
        let names: Vec<_> = wf.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["shared-pod-same", "shared-pod-same-2"]);
    }

    #[test]
    fn unnamed_documents_use_kind_and_index() {
        let compiler = WorkflowCompiler::new(registry(&[(
            "A",
            "a.yaml",
            "kind: ConfigMap\n---\ndata: {}\n",
        )]));
        let wf = compiler
            .compile("demo", &graph(&["A"], &[]), &CompileOptions::default())
            .unwrap();
        let names: Vec<_> = wf.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a-configmap-configmap-1", "a-obj-obj-2"]);
    }

    #[test]
    fn no_wait_omits_dependencies_and_caps_parallelism() {
        let compiler = WorkflowCompiler::new(registry(&[]));
        let options = CompileOptions {
            wait_for_dependencies: false,
            service_account: None,
            ..CompileOptions::default()
        };
        let wf = compiler
            .compile("demo", &graph(&["A", "B"], &[("A", "B")]), &options)
            .unwrap();
        assert!(wf.tasks().iter().all(|t| t.dependencies.is_empty()));
        assert_eq!(wf.spec.parallelism, Some(2));

        let yaml = wf.to_yaml().unwrap();
        assert!(yaml.contains("parallelism: 2"));
        assert!(!yaml.contains("serviceAccountName"));
        assert!(!yaml.contains("dependencies"));
    }

    #[test]
    fn envelope_yaml_shape() {
        let compiler = WorkflowCompiler::new(registry(&[("A", "a.yaml", "kind: Pod\nmetadata:\n  name: p\n")]));
        let wf = compiler
            .compile("improve-the-qoe", &graph(&["A"], &[]), &CompileOptions::default())
            .unwrap();
        let yaml = wf.to_yaml().unwrap();
        assert!(yaml.contains("apiVersion: argoproj.io/v1alpha1"));
        assert!(yaml.contains("generateName: improve-the-qoe-"));
        assert!(yaml.contains("namespace: agentic-ai"));
        assert!(yaml.contains("serviceAccountName: argo-executor"));
        assert!(yaml.contains("entrypoint: main-dag"));
        assert!(yaml.contains("setOwnerReference: true"));
    }

    #[test]
    fn dir_registry_reads_catalog_files() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ModuleCatalog::builtin().unwrap());
        let file = catalog.manifest_file("MoLMo").unwrap().to_string();
        std::fs::write(dir.path().join(&file), "kind: Pod\n").unwrap();

        let reg = DirManifestRegistry::new(dir.path(), catalog);
        assert_eq!(reg.file_name("MoLMo"), Some(file));
        assert!(reg.read("MoLMo").unwrap().is_some());
        assert!(reg.read("UE-Monitor").unwrap().is_none());
        assert!(reg.read("LSTM-Predictor").unwrap().is_none());
    }
}
