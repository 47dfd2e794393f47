//! Addon discovery and bundling.
//!
//! Addons are independently authored template fragments placed next to the
//! project configuration. [`bundle`] merges them into a single nested-stack
//! template and classifies its outputs for the composer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use hoist_core::template::section;
use hoist_core::{Node, NodeMap, StackTemplate};
use serde::Deserialize;

/// Parameters every fragment must declare, bound by the parent stack.
pub const RESERVED_PARAMETERS: [&str; 3] = ["App", "Env", "Name"];

const PARAMETERS_FILES: &[&str] = &["addons.parameters.yml", "addons.parameters.yaml"];

/// Sections whose logical IDs must be unique across fragments.
const MERGED_SECTIONS: &[&str] = &[
    section::RESOURCES,
    section::OUTPUTS,
    section::CONDITIONS,
    section::MAPPINGS,
];

const MANAGED_POLICY_TYPE: &str = "AWS::IAM::ManagedPolicy";
const SECRET_TYPE: &str = "AWS::SecretsManager::Secret";
const POLICY_OUTPUT_SUFFIX: &str = "PolicyArn";

/// Where a set of fragments lives.
#[derive(Debug, Clone, Copy)]
pub enum AddonScope<'a> {
    /// `.hoist/addons/<workload>/`
    Workload(&'a str),
    /// `.hoist/environments/addons/`
    Environment,
}

impl AddonScope<'_> {
    pub fn dir(&self, root: &Path) -> PathBuf {
        match self {
            AddonScope::Workload(name) => root.join(".hoist").join("addons").join(name),
            AddonScope::Environment => root.join(".hoist").join("environments").join("addons"),
        }
    }
}

/// One user-authored template fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct AddonFragment {
    /// Identifies the fragment in error messages, usually its relative path.
    pub name: String,
    pub template: StackTemplate,
}

impl AddonFragment {
    pub fn new(name: impl Into<String>, template: StackTemplate) -> Self {
        Self {
            name: name.into(),
            template,
        }
    }

    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self, AddonError> {
        let name = name.into();
        let template = StackTemplate::parse(source).map_err(|e| AddonError::Parse {
            path: PathBuf::from(&name),
            source: e,
        })?;
        Ok(Self { name, template })
    }
}

/// Fragments plus values for their extra parameters, as found on disk.
#[derive(Debug, Clone, Default)]
pub struct AddonSource {
    pub fragments: Vec<AddonFragment>,
    pub parameter_values: NodeMap,
}

impl AddonSource {
    /// Append another source. Parameter values already present are kept.
    pub fn extend(&mut self, other: AddonSource) {
        self.fragments.extend(other.fragments);
        for (name, value) in other.parameter_values {
            self.parameter_values.entry(name).or_insert(value);
        }
    }

    pub fn bundle(&self) -> Result<AddonBundle, AddonError> {
        bundle_with_values(&self.fragments, &self.parameter_values)
    }
}

/// The merged nested-stack template and its output contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddonBundle {
    pub template: StackTemplate,
    /// Outputs holding managed policy ARNs for the execution role.
    pub policy_outputs: Vec<String>,
    /// Outputs injected as secrets.
    pub secret_outputs: Vec<String>,
    /// Outputs injected as plain environment variables.
    pub variable_outputs: Vec<String>,
    /// Values passed to the nested stack for non-reserved parameters.
    pub parameter_values: NodeMap,
    /// Names of the fragments that make up the bundle.
    pub sources: Vec<String>,
}

impl AddonBundle {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Read the fragments of a scope. A missing directory yields no fragments.
pub fn discover(root: &Path, scope: AddonScope<'_>) -> Result<AddonSource, AddonError> {
    let dir = scope.dir(root);
    if !dir.is_dir() {
        tracing::debug!(dir = %dir.display(), "no addons directory");
        return Ok(AddonSource::default());
    }

    let entries = std::fs::read_dir(&dir).map_err(|e| AddonError::ReadDir {
        path: dir.clone(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AddonError::ReadDir {
            path: dir.clone(),
            source: e,
        })?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yml" || e == "yaml");
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();

    let mut source = AddonSource::default();
    for path in files {
        let content = std::fs::read_to_string(&path).map_err(|e| AddonError::Read {
            path: path.clone(),
            source: e,
        })?;
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        if PARAMETERS_FILES.contains(&file_name) {
            source.parameter_values = parse_parameter_values(&path, &content)?;
            continue;
        }

        let name = match path.strip_prefix(root) {
            Ok(relative) => relative.display().to_string(),
            Err(e) => {
                tracing::debug!(error = %e, path = %path.display(), "addon outside project root");
                path.display().to_string()
            }
        };
        let template = StackTemplate::parse(&content).map_err(|e| AddonError::Parse {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(fragment = %name, "discovered addon");
        source.fragments.push(AddonFragment::new(name, template));
    }

    Ok(source)
}

#[derive(Deserialize)]
struct ParametersFile {
    #[serde(rename = "Parameters", default)]
    parameters: BTreeMap<String, serde_yaml::Value>,
}

fn parse_parameter_values(path: &Path, content: &str) -> Result<NodeMap, AddonError> {
    let file: ParametersFile =
        serde_yaml::from_str(content).map_err(|e| AddonError::ParametersFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut values = NodeMap::new();
    for (name, value) in file.parameters {
        let node = Node::from_yaml(value).map_err(|e| AddonError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        values.insert(name, node);
    }
    Ok(values)
}

/// Merge fragments into one nested-stack template.
pub fn bundle(fragments: &[AddonFragment]) -> Result<AddonBundle, AddonError> {
    bundle_with_values(fragments, &NodeMap::new())
}

/// Merge fragments, binding extra parameters to the given values.
///
/// The result does not depend on the order of `fragments`.
pub fn bundle_with_values(
    fragments: &[AddonFragment],
    values: &NodeMap,
) -> Result<AddonBundle, AddonError> {
    if fragments.is_empty() {
        if let Some(name) = values.keys().next() {
            return Err(AddonError::UnknownParameterValue { name: name.clone() });
        }
        return Ok(AddonBundle::default());
    }

    let mut ordered: Vec<&AddonFragment> = fragments.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut parameters = NodeMap::new();
    for name in RESERVED_PARAMETERS {
        parameters.insert(name.to_owned(), Node::map([("Type", Node::string("String"))]));
    }
    let mut parameter_owner: BTreeMap<String, &str> = BTreeMap::new();
    let mut sections: BTreeMap<&str, NodeMap> = BTreeMap::new();
    let mut owner: BTreeMap<(&str, String), &str> = BTreeMap::new();
    let mut transforms: BTreeSet<String> = BTreeSet::new();

    for fragment in &ordered {
        validate_reserved(fragment)?;

        for (name, definition) in fragment.template.parameters().into_iter().flatten() {
            if RESERVED_PARAMETERS.contains(&name.as_str()) {
                continue;
            }
            match parameter_owner.get(name) {
                None => {
                    parameter_owner.insert(name.clone(), &fragment.name);
                    parameters.insert(name.clone(), definition.clone());
                }
                Some(first) => {
                    let first_type = parameter_type(&parameters[name]);
                    let second_type = parameter_type(definition);
                    if first_type != second_type {
                        return Err(AddonError::ParameterConflict {
                            name: name.clone(),
                            first: (*first).to_owned(),
                            first_type: first_type.to_owned(),
                            second: fragment.name.clone(),
                            second_type: second_type.to_owned(),
                        });
                    }
                }
            }
        }

        for &section_name in MERGED_SECTIONS {
            for (id, node) in fragment.template.section(section_name).into_iter().flatten() {
                if let Some(first) = owner.get(&(section_name, id.clone())) {
                    return Err(AddonError::Collision {
                        section: section_name,
                        id: id.clone(),
                        first: (*first).to_owned(),
                        second: fragment.name.clone(),
                    });
                }
                owner.insert((section_name, id.clone()), &fragment.name);
                sections
                    .entry(section_name)
                    .or_default()
                    .insert(id.clone(), node.clone());
            }
        }

        match fragment.template.get(section::TRANSFORM) {
            Some(Node::List(items)) => {
                transforms.extend(items.iter().filter_map(Node::as_str).map(str::to_owned));
            }
            Some(node) => transforms.extend(node.as_str().map(str::to_owned)),
            None => {}
        }
    }

    let parameter_values = resolve_parameter_values(&parameters, values)?;

    let mut template = StackTemplate::new();
    template.set(section::FORMAT_VERSION, "2010-09-09");
    template.set(section::DESCRIPTION, "Addon resources bundled by hoist");
    template.set(section::PARAMETERS, parameters);
    match transforms.len() {
        0 => {}
        1 => template.set(
            section::TRANSFORM,
            transforms.into_iter().next().unwrap_or_default(),
        ),
        _ => template.set(
            section::TRANSFORM,
            Node::list(transforms.into_iter().map(Node::string)),
        ),
    }
    for (name, entries) in sections {
        template.set(name, entries);
    }

    let (policy_outputs, secret_outputs, variable_outputs) = classify_outputs(&template);

    Ok(AddonBundle {
        template,
        policy_outputs,
        secret_outputs,
        variable_outputs,
        parameter_values,
        sources: ordered.iter().map(|f| f.name.clone()).collect(),
    })
}

fn validate_reserved(fragment: &AddonFragment) -> Result<(), AddonError> {
    let parameters = fragment.template.parameters();
    for name in RESERVED_PARAMETERS {
        let Some(definition) = parameters.and_then(|p| p.get(name)) else {
            return Err(AddonError::Schema {
                fragment: fragment.name.clone(),
                reason: format!("missing reserved parameter {name}"),
            });
        };
        if parameter_type(definition) != "String" {
            return Err(AddonError::Schema {
                fragment: fragment.name.clone(),
                reason: format!("reserved parameter {name} must have Type String"),
            });
        }
    }
    Ok(())
}

fn parameter_type(definition: &Node) -> &str {
    definition
        .get("Type")
        .and_then(Node::as_str)
        .unwrap_or_default()
}

fn resolve_parameter_values(
    parameters: &NodeMap,
    values: &NodeMap,
) -> Result<NodeMap, AddonError> {
    for name in values.keys() {
        if RESERVED_PARAMETERS.contains(&name.as_str()) {
            return Err(AddonError::ReservedParameterValue { name: name.clone() });
        }
        if !parameters.contains_key(name) {
            return Err(AddonError::UnknownParameterValue { name: name.clone() });
        }
    }

    for (name, definition) in parameters {
        if RESERVED_PARAMETERS.contains(&name.as_str()) {
            continue;
        }
        if definition.get("Default").is_none() && !values.contains_key(name) {
            return Err(AddonError::MissingParameterValue { name: name.clone() });
        }
    }

    Ok(values.clone())
}

/// Split outputs into (managed policies, secrets, plain values).
fn classify_outputs(template: &StackTemplate) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut policies = Vec::new();
    let mut secrets = Vec::new();
    let mut variables = Vec::new();

    for (name, output) in template.outputs().into_iter().flatten() {
        let target_type = output
            .get("Value")
            .and_then(Node::ref_target)
            .and_then(|id| template.resource_type(id));

        if name.ends_with(POLICY_OUTPUT_SUFFIX) || target_type == Some(MANAGED_POLICY_TYPE) {
            policies.push(name.clone());
        } else if target_type == Some(SECRET_TYPE) {
            secrets.push(name.clone());
        } else {
            variables.push(name.clone());
        }
    }

    (policies, secrets, variables)
}

#[derive(Debug, thiserror::Error)]
pub enum AddonError {
    #[error("failed to read addons directory {path}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read addon file {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse addon template {path}")]
    Parse {
        path: PathBuf,
        source: hoist_core::Error,
    },

    #[error("invalid addon parameters file {path}: {reason}")]
    ParametersFile { path: PathBuf, reason: String },

    #[error("addon {fragment} is invalid: {reason}")]
    Schema { fragment: String, reason: String },

    #[error("{section} logical ID {id} is defined by both {first} and {second}")]
    Collision {
        section: &'static str,
        id: String,
        first: String,
        second: String,
    },

    #[error(
        "addon parameter {name} is declared as {first_type} in {first} but as {second_type} in {second}"
    )]
    ParameterConflict {
        name: String,
        first: String,
        first_type: String,
        second: String,
        second_type: String,
    },

    #[error("addon parameter {name} has no Default and no value in addons.parameters.yml")]
    MissingParameterValue { name: String },

    #[error("addons.parameters.yml cannot set reserved parameter {name}")]
    ReservedParameterValue { name: String },

    #[error("addons.parameters.yml sets {name}, which no addon declares")]
    UnknownParameterValue { name: String },
}
