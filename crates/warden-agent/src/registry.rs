use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
};

use warden_process::{ComponentId, ComponentSpec};

use crate::error::{OrchestratorError, Result};

/// Source of component definitions.
pub trait ComponentRegistry: Send + Sync {
    fn all(&self) -> &[ComponentSpec];

    fn get(&self, id: &str) -> Option<&ComponentSpec> {
        self.all().iter().find(|c| c.id.as_str() == id)
    }

    /// Preferred core startup order, when the registry carries one.
    fn core_hierarchy(&self) -> Option<&[String]>;
}

#[derive(Debug, Default, serde::Deserialize)]
struct SchedulerSection {
    #[serde(default)]
    core: Option<Vec<String>>,
}

#[derive(Debug, serde::Deserialize)]
struct RegistryFile {
    #[serde(default)]
    scheduler: SchedulerSection,
    #[serde(default)]
    components: Vec<ComponentSpec>,
}

#[derive(Debug, Clone)]
pub struct FileRegistry {
    specs: Vec<ComponentSpec>,
    core: Option<Vec<String>>,
    source: Option<PathBuf>,
}

impl FileRegistry {
    /// Loads `.toml`, `.yaml` or `.yml`; anything else is tried as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::config(format!("read registry {}: {e}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let mut reg = match ext.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Self::from_toml_str(&text),
        }
        .map_err(|e| match e {
            OrchestratorError::Configuration(msg) => {
                OrchestratorError::config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        reg.source = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), components = reg.specs.len(), "registry loaded");
        Ok(reg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: RegistryFile =
            toml::from_str(text).map_err(|e| OrchestratorError::config(format!("invalid registry: {e}")))?;
        Self::from_specs(file.components, file.scheduler.core)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(text)
            .map_err(|e| OrchestratorError::config(format!("invalid registry: {e}")))?;
        Self::from_specs(file.components, file.scheduler.core)
    }

    pub fn from_specs(specs: Vec<ComponentSpec>, core: Option<Vec<String>>) -> Result<Self> {
        validate(&specs)?;
        Ok(Self {
            specs,
            core,
            source: None,
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl ComponentRegistry for FileRegistry {
    fn all(&self) -> &[ComponentSpec] {
        &self.specs
    }

    fn core_hierarchy(&self) -> Option<&[String]> {
        self.core.as_deref()
    }
}

fn validate(specs: &[ComponentSpec]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut ports: HashMap<u16, &ComponentId> = HashMap::new();
    for spec in specs {
        if spec.id.as_str().trim().is_empty() {
            return Err(OrchestratorError::config("component with empty id"));
        }
        if !ids.insert(spec.id.as_str()) {
            return Err(OrchestratorError::config(format!("duplicate component id {}", spec.id)));
        }
        if spec.port == 0 {
            return Err(OrchestratorError::config(format!("{} has no port", spec.id)));
        }
        if let Some(other) = ports.insert(spec.port, &spec.id) {
            return Err(OrchestratorError::config(format!(
                "port {} is claimed by both {other} and {}",
                spec.port, spec.id
            )));
        }
        if let Some(cmd) = &spec.command
            && cmd.is_empty()
        {
            return Err(OrchestratorError::config(format!("{} has an empty command", spec.id)));
        }
    }

    for spec in specs {
        for dep in &spec.dependencies {
            if dep == &spec.id {
                return Err(OrchestratorError::config(format!("{} depends on itself", spec.id)));
            }
            if !ids.contains(dep.as_str()) {
                return Err(OrchestratorError::config(format!(
                    "{} depends on unknown component {dep}",
                    spec.id
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(specs) {
        return Err(OrchestratorError::config(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// First dependency cycle found, as a closed path of ids.
pub(crate) fn find_cycle(specs: &[ComponentSpec]) -> Option<Vec<String>> {
    let edges: BTreeMap<&str, Vec<&str>> = specs
        .iter()
        .map(|s| {
            (
                s.id.as_str(),
                s.dependencies.iter().map(|d| d.as_str()).collect(),
            )
        })
        .collect();

    fn visit<'a>(
        node: &'a str,
        edges: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for dep in edges.get(node).map(|v| v.as_slice()).unwrap_or_default() {
            if let Some(c) = visit(*dep, edges, marks, stack) {
                return Some(c);
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for node in edges.keys() {
        let mut stack = Vec::new();
        if let Some(c) = visit(*node, &edges, &mut marks, &mut stack) {
            return Some(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use warden_process::Tier;

    use super::*;

    const TOML_REGISTRY: &str = r#"
[scheduler]
core = ["message-bus", "memory-store"]

[[components]]
id = "message-bus"
display_name = "Message Bus"
port = 8100
tier = "core"

[[components]]
id = "memory-store"
port = 8101
tier = "core"
dependencies = ["message-bus"]

[[components]]
id = "vector-store"
port = 8301
category = "storage"
dependencies = ["memory-store"]
health_paths = ["/healthz"]
env = { EMBED_MODEL = "small" }
"#;

    #[test]
    fn loads_toml_with_core_order() {
        let reg = FileRegistry::from_toml_str(TOML_REGISTRY).unwrap();
        assert_eq!(reg.all().len(), 3);
        assert_eq!(
            reg.core_hierarchy().unwrap(),
            &["message-bus".to_string(), "memory-store".to_string()]
        );
        let vs = reg.get("vector-store").unwrap();
        assert_eq!(vs.tier, Tier::Leaf);
        assert_eq!(vs.env.get("EMBED_MODEL").map(|s| s.as_str()), Some("small"));
        assert_eq!(vs.label(), "vector-store");
        assert_eq!(reg.get("message-bus").unwrap().label(), "Message Bus");
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn loads_yaml_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("components.yaml");
        std::fs::write(
            &path,
            "components:\n  - id: message-bus\n    port: 8100\n    tier: core\n  - id: search\n    port: 8400\n    dependencies: [message-bus]\n",
        )
        .unwrap();
        let reg = FileRegistry::load(&path).unwrap();
        assert_eq!(reg.all().len(), 2);
        assert!(reg.core_hierarchy().is_none());
        assert_eq!(reg.source(), Some(path.as_path()));
    }

    #[test]
    fn rejects_duplicate_ports() {
        let err = FileRegistry::from_specs(
            vec![ComponentSpec::new("a", 9000), ComponentSpec::new("b", 9000)],
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("port 9000"));
    }

    #[test]
    fn rejects_unknown_dependency_and_zero_port() {
        let mut a = ComponentSpec::new("a", 9000);
        a.dependencies = vec![ComponentId::from("ghost")];
        assert!(FileRegistry::from_specs(vec![a], None).is_err());
        assert!(FileRegistry::from_specs(vec![ComponentSpec::new("z", 0)], None).is_err());
        assert!(
            FileRegistry::from_specs(
                vec![ComponentSpec::new("a", 1), ComponentSpec::new("a", 2)],
                None
            )
            .is_err()
        );
    }

    #[test]
    fn rejects_cycles() {
        let mut a = ComponentSpec::new("a", 9000);
        a.dependencies = vec![ComponentId::from("c")];
        let mut b = ComponentSpec::new("b", 9001);
        b.dependencies = vec![ComponentId::from("a")];
        let mut c = ComponentSpec::new("c", 9002);
        c.dependencies = vec![ComponentId::from("b")];
        let err = FileRegistry::from_specs(vec![a, b, c], None).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unreadable_file_is_a_configuration_error() {
        let err = FileRegistry::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }
}
