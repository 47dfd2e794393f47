//! Path-addressed patch rules applied to the composed template.
//!
//! Rules live in `.hoist/overrides/patches.yml` as a YAML list:
//!
//! ```yaml
//! - op: add
//!   path: /Resources/TaskDefinition/Properties/ContainerDefinitions/0/Ulimits/-
//!   value: { Name: nofile, SoftLimit: 4096, HardLimit: 8192 }
//! - op: remove
//!   path: /Resources/Service/Properties/PlatformVersion
//! ```
//!
//! Paths use `/` separators with `~0`/`~1` escapes. Rules apply in order and
//! each one sees the result of the previous rules. The task family and the
//! container names the composer produced identify the deployed workload, so
//! rules touching them are rejected.

use std::path::{Path, PathBuf};

use hoist_core::pointer::{APPEND_MARKER, parse_index};
use hoist_core::template::section;
use hoist_core::{Node, Pointer, StackTemplate};
use serde::Deserialize;

/// Project-relative location of the patch rules.
pub const PATCHES_PATH: &str = ".hoist/overrides/patches.yml";

const TASK_DEFINITION_TYPE: &str = "AWS::ECS::TaskDefinition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchRule {
    pub op: PatchOp,
    pub path: String,
    pub value: Option<Node>,
}

impl PatchRule {
    pub fn add(path: &str, value: impl Into<Node>) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.to_owned(),
            value: Some(value.into()),
        }
    }

    pub fn remove(path: &str) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.to_owned(),
            value: None,
        }
    }

    pub fn replace(path: &str, value: impl Into<Node>) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.to_owned(),
            value: Some(value.into()),
        }
    }
}

#[derive(Deserialize)]
struct RawRule {
    op: PatchOp,
    path: String,
    #[serde(default)]
    value: Option<serde_yaml::Value>,
}

/// Load the project's patch rules. No file means no rules.
pub fn load_rules(project_dir: &Path) -> Result<Vec<PatchRule>, OverrideError> {
    let path = project_dir.join(PATCHES_PATH);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|e| OverrideError::Read {
        path: path.clone(),
        source: e,
    })?;
    parse_rules(&content).map_err(|reason| OverrideError::Document { path, reason })
}

/// Parse a rules document. An empty document holds no rules.
pub fn parse_rules(source: &str) -> Result<Vec<PatchRule>, String> {
    let raw: Option<Vec<RawRule>> = serde_yaml::from_str(source).map_err(|e| e.to_string())?;
    raw.into_iter()
        .flatten()
        .map(|rule| -> Result<PatchRule, String> {
            let value = rule
                .value
                .map(Node::from_yaml)
                .transpose()
                .map_err(|e| format!("rule for {}: {e}", rule.path))?;
            Ok(PatchRule {
                op: rule.op,
                path: rule.path,
                value,
            })
        })
        .collect()
}

/// Apply `rules` in order to a copy of `template`.
///
/// On failure the returned [`PatchFailure`] carries the template as modified
/// by the rules before the failing one. It must not be deployed.
pub fn apply(template: &StackTemplate, rules: &[PatchRule]) -> Result<StackTemplate, PatchFailure> {
    let protected = protected_paths(template);
    let mut root = Node::Map(template.root().clone());

    for (index, rule) in rules.iter().enumerate() {
        if let Err(error) = apply_rule(&mut root, index, rule, &protected) {
            return Err(PatchFailure {
                error,
                partial: into_template(root),
            });
        }
        tracing::debug!(index, op = ?rule.op, path = %rule.path, "applied patch rule");
    }

    Ok(into_template(root))
}

fn into_template(root: Node) -> StackTemplate {
    match root {
        Node::Map(map) => StackTemplate::from_root(map),
        // Rules cannot address the root, so it stays a map.
        _ => StackTemplate::new(),
    }
}

/// Fields identifying the workload: each task family and every container
/// name present in the input.
fn protected_paths(template: &StackTemplate) -> Vec<Pointer> {
    let mut paths = Vec::new();
    for id in template.resources_of_type(TASK_DEFINITION_TYPE) {
        let properties = Pointer::from_segments([section::RESOURCES, id, "Properties"]);
        paths.push(properties.child("Family"));

        let definitions = properties.child("ContainerDefinitions");
        let count = template
            .pointer(&definitions)
            .and_then(Node::as_list)
            .map_or(0, <[Node]>::len);
        for i in 0..count {
            paths.push(definitions.child(i.to_string()).child("Name"));
        }
    }
    paths
}

fn apply_rule(
    root: &mut Node,
    index: usize,
    rule: &PatchRule,
    protected: &[Pointer],
) -> Result<(), OverrideError> {
    let invalid = |reason: &str| OverrideError::InvalidRule {
        index,
        path: rule.path.clone(),
        reason: reason.to_owned(),
    };
    let not_found = || OverrideError::PathNotFound {
        index,
        path: rule.path.clone(),
    };

    let pointer = Pointer::parse(&rule.path).map_err(|e| OverrideError::InvalidRule {
        index,
        path: rule.path.clone(),
        reason: e.to_string(),
    })?;
    if pointer.is_root() {
        return Err(invalid("path must address a field below the template root"));
    }
    if protected
        .iter()
        .any(|p| pointer.is_prefix_of(p) || p.is_prefix_of(&pointer))
    {
        return Err(OverrideError::ProtectedField {
            index,
            path: rule.path.clone(),
        });
    }

    let segments = pointer.segments();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(invalid("path is empty")),
    };
    if parents.iter().any(|s| s == APPEND_MARKER) {
        return Err(invalid("'-' may only appear as the last segment"));
    }
    let appends = last == APPEND_MARKER;
    if appends && rule.op != PatchOp::Add {
        return Err(invalid("'-' is only valid for add"));
    }

    match rule.op {
        PatchOp::Add => {
            let value = rule.value.clone().ok_or_else(|| invalid("add requires a value"))?;
            let parent = descend_creating(root, parents, appends).map_err(|e| match e {
                Descend::Missing => not_found(),
                Descend::Invalid(reason) => invalid(reason),
            })?;
            match parent {
                Node::List(items) if appends => items.push(value),
                Node::List(items) => {
                    let at = parse_index(last).ok_or_else(|| invalid("expected an array index"))?;
                    if at > items.len() {
                        return Err(not_found());
                    }
                    items.insert(at, value);
                }
                Node::Map(map) if !appends => {
                    map.insert(last.clone(), value);
                }
                Node::Map(_) => return Err(invalid("'-' requires an array")),
                Node::Scalar(_) => return Err(invalid("cannot add below a scalar")),
            }
        }
        PatchOp::Replace => {
            let value = rule
                .value
                .clone()
                .ok_or_else(|| invalid("replace requires a value"))?;
            let target = root.pointer_mut(&pointer).ok_or_else(not_found)?;
            *target = value;
        }
        PatchOp::Remove => {
            if rule.value.is_some() {
                return Err(invalid("remove does not take a value"));
            }
            let parent = root
                .pointer_mut(&Pointer::from_segments(parents.iter().cloned()))
                .ok_or_else(not_found)?;
            match parent {
                Node::Map(map) => {
                    map.remove(last.as_str()).ok_or_else(not_found)?;
                }
                Node::List(items) => {
                    let at = parse_index(last).ok_or_else(|| invalid("expected an array index"))?;
                    if at >= items.len() {
                        return Err(not_found());
                    }
                    items.remove(at);
                }
                Node::Scalar(_) => return Err(not_found()),
            }
        }
    }

    Ok(())
}

enum Descend {
    Missing,
    Invalid(&'static str),
}

/// Walk to the container addressed by `segments`, creating missing map
/// entries. When `list_leaf` is set a missing final container is created as
/// an empty array.
fn descend_creating<'n>(
    root: &'n mut Node,
    segments: &[String],
    list_leaf: bool,
) -> Result<&'n mut Node, Descend> {
    let mut current = root;
    for (i, segment) in segments.iter().enumerate() {
        let is_leaf = i + 1 == segments.len();
        current = match current {
            Node::Map(map) => map.entry(segment.clone()).or_insert_with(|| {
                if is_leaf && list_leaf {
                    Node::List(Vec::new())
                } else {
                    Node::empty_map()
                }
            }),
            Node::List(items) => {
                let at = parse_index(segment).ok_or(Descend::Invalid("expected an array index"))?;
                items.get_mut(at).ok_or(Descend::Missing)?
            }
            Node::Scalar(_) => return Err(Descend::Invalid("cannot descend into a scalar")),
        };
    }
    Ok(current)
}

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("failed to read patch rules at {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid patch rules in {path}: {reason}")]
    Document { path: PathBuf, reason: String },

    #[error("patch rule #{index} targets protected field {path}")]
    ProtectedField { index: usize, path: String },

    #[error("patch rule #{index}: {path} does not exist")]
    PathNotFound { index: usize, path: String },

    #[error("patch rule #{index} ({path}) is invalid: {reason}")]
    InvalidRule {
        index: usize,
        path: String,
        reason: String,
    },
}

/// A failed [`apply`], with the partially patched template for inspection.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PatchFailure {
    pub error: OverrideError,
    pub partial: StackTemplate,
}

impl PatchFailure {
    pub fn into_error(self) -> OverrideError {
        self.error
    }
}
