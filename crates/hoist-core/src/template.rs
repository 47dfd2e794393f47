//! Schema-agnostic stack template tree.
//!
//! A [`StackTemplate`] is a map of top-level sections to [`Node`]s. Every node
//! is exactly one of a map, a list or a scalar, so walks over the tree are
//! exhaustive matches rather than dynamic lookups. Maps are ordered by key,
//! which makes rendering deterministic.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use serde_yaml::Value;

use crate::pointer::{Pointer, parse_index};

/// Well-known top-level section names.
pub mod section {
    pub const FORMAT_VERSION: &str = "AWSTemplateFormatVersion";
    pub const DESCRIPTION: &str = "Description";
    pub const METADATA: &str = "Metadata";
    pub const PARAMETERS: &str = "Parameters";
    pub const MAPPINGS: &str = "Mappings";
    pub const CONDITIONS: &str = "Conditions";
    pub const TRANSFORM: &str = "Transform";
    pub const RESOURCES: &str = "Resources";
    pub const OUTPUTS: &str = "Outputs";

    /// Rendering order of the known sections. Unknown keys follow, sorted.
    pub const ORDER: &[&str] = &[
        FORMAT_VERSION,
        DESCRIPTION,
        METADATA,
        PARAMETERS,
        MAPPINGS,
        CONDITIONS,
        TRANSFORM,
        RESOURCES,
        OUTPUTS,
    ];

    /// Sections whose entries are keyed by logical ID.
    pub const KEYED: &[&str] = &[PARAMETERS, MAPPINGS, CONDITIONS, RESOURCES, OUTPUTS];
}

pub type NodeMap = BTreeMap<String, Node>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Node {
    Map(NodeMap),
    List(Vec<Node>),
    Scalar(Scalar),
}

impl Node {
    pub fn null() -> Self {
        Node::Scalar(Scalar::Null)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Node::Scalar(Scalar::String(value.into()))
    }

    pub fn empty_map() -> Self {
        Node::Map(NodeMap::new())
    }

    /// Build a map node from literal entries.
    pub fn map<const N: usize>(entries: [(&str, Node); N]) -> Self {
        Node::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        )
    }

    pub fn list(items: impl IntoIterator<Item = Node>) -> Self {
        Node::List(items.into_iter().collect())
    }

    // ── Intrinsic functions ──

    pub fn reference(logical_id: &str) -> Self {
        Node::map([("Ref", Node::string(logical_id))])
    }

    pub fn get_att(logical_id: &str, attribute: &str) -> Self {
        Node::map([(
            "Fn::GetAtt",
            Node::list([Node::string(logical_id), Node::string(attribute)]),
        )])
    }

    pub fn sub(expression: &str) -> Self {
        Node::map([("Fn::Sub", Node::string(expression))])
    }

    pub fn import_value(export: Node) -> Self {
        Node::map([("Fn::ImportValue", export)])
    }

    pub fn split(delimiter: &str, source: Node) -> Self {
        Node::map([(
            "Fn::Split",
            Node::list([Node::string(delimiter), source]),
        )])
    }

    // ── Accessors ──

    pub fn as_map(&self) -> Option<&NodeMap> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut NodeMap> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Look up a key when this node is a map.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Resolve a path below this node. Array segments must be indexes.
    pub fn pointer(&self, pointer: &Pointer) -> Option<&Node> {
        let mut current = self;
        for segment in pointer.segments() {
            current = match current {
                Node::Map(m) => m.get(segment)?,
                Node::List(l) => l.get(parse_index(segment)?)?,
                Node::Scalar(_) => return None,
            };
        }
        Some(current)
    }

    pub fn pointer_mut(&mut self, pointer: &Pointer) -> Option<&mut Node> {
        let mut current = self;
        for segment in pointer.segments() {
            current = match current {
                Node::Map(m) => m.get_mut(segment)?,
                Node::List(l) => l.get_mut(parse_index(segment)?)?,
                Node::Scalar(_) => return None,
            };
        }
        Some(current)
    }

    /// Returns the logical ID when this node is `{Ref: <id>}`.
    pub fn ref_target(&self) -> Option<&str> {
        let map = self.as_map()?;
        if map.len() != 1 {
            return None;
        }
        map.get("Ref")?.as_str()
    }

    /// Convert a parsed YAML value, normalizing CloudFormation short-form tags.
    pub fn from_yaml(value: Value) -> crate::Result<Self> {
        Ok(match value {
            Value::Null => Node::null(),
            Value::Bool(b) => Node::Scalar(Scalar::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Scalar(Scalar::Int(i)),
                None => Node::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Node::string(s),
            Value::Sequence(items) => Node::List(
                items
                    .into_iter()
                    .map(Node::from_yaml)
                    .collect::<crate::Result<_>>()?,
            ),
            Value::Mapping(mapping) => {
                let mut map = NodeMap::new();
                for (key, value) in mapping {
                    map.insert(mapping_key(key)?, Node::from_yaml(value)?);
                }
                Node::Map(map)
            }
            Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                intrinsic(tag.trim_start_matches('!'), tagged.value)?
            }
        })
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::string(value)
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::string(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Scalar(Scalar::Int(value))
    }
}

impl From<u32> for Node {
    fn from(value: u32) -> Self {
        Node::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Scalar(Scalar::Bool(value))
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::List(value)
    }
}

impl From<NodeMap> for Node {
    fn from(value: NodeMap) -> Self {
        Node::Map(value)
    }
}

fn mapping_key(key: Value) -> crate::Result<String> {
    match key {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(crate::Error::TemplateKey {
            key: format!("{other:?}"),
        }),
    }
}

fn intrinsic(tag: &str, value: Value) -> crate::Result<Node> {
    let inner = Node::from_yaml(value)?;
    let node = match tag {
        "Ref" => Node::map([("Ref", inner)]),
        "Condition" => Node::map([("Condition", inner)]),
        "GetAtt" => {
            let args = match inner {
                Node::Scalar(Scalar::String(s)) => match s.split_once('.') {
                    Some((id, attr)) => Node::list([Node::string(id), Node::string(attr)]),
                    None => Node::string(s),
                },
                other => other,
            };
            Node::map([("Fn::GetAtt", args)])
        }
        other => Node::Map(NodeMap::from([(format!("Fn::{other}"), inner)])),
    };
    Ok(node)
}

/// A complete stack template.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StackTemplate {
    root: NodeMap,
}

impl StackTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_root(root: NodeMap) -> Self {
        Self { root }
    }

    /// Parse a YAML or JSON document. An empty document is an empty template.
    pub fn parse(source: &str) -> crate::Result<Self> {
        let value: Value = serde_yaml::from_str(source)
            .map_err(|e| crate::Error::TemplateSyntax { source: e })?;
        match Node::from_yaml(value)? {
            Node::Map(root) => Ok(Self { root }),
            Node::Scalar(Scalar::Null) => Ok(Self::default()),
            _ => Err(crate::Error::TemplateRoot),
        }
    }

    pub fn root(&self) -> &NodeMap {
        &self.root
    }

    pub fn into_root(self) -> NodeMap {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.root.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Node>) {
        self.root.insert(key.to_owned(), value.into());
    }

    /// Entries of a keyed section, if present and a map.
    pub fn section(&self, name: &str) -> Option<&NodeMap> {
        self.root.get(name).and_then(Node::as_map)
    }

    pub fn resources(&self) -> Option<&NodeMap> {
        self.section(section::RESOURCES)
    }

    pub fn parameters(&self) -> Option<&NodeMap> {
        self.section(section::PARAMETERS)
    }

    pub fn outputs(&self) -> Option<&NodeMap> {
        self.section(section::OUTPUTS)
    }

    /// The `Type` of a resource.
    pub fn resource_type(&self, logical_id: &str) -> Option<&str> {
        self.resources()?.get(logical_id)?.get("Type")?.as_str()
    }

    /// Logical IDs of all resources of the given type, in key order.
    pub fn resources_of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a str> {
        self.resources()
            .into_iter()
            .flat_map(|r| r.iter())
            .filter(move |(_, res)| res.get("Type").and_then(Node::as_str) == Some(type_name))
            .map(|(id, _)| id.as_str())
    }

    /// Resolve a path from the template root.
    pub fn pointer(&self, pointer: &Pointer) -> Option<&Node> {
        let (first, rest) = pointer.segments().split_first()?;
        self.root
            .get(first)?
            .pointer(&Pointer::from_segments(rest.iter().cloned()))
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(|e| crate::Error::RenderYaml { source: e })
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::Error::RenderJson { source: e })
    }
}

impl Serialize for StackTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.root.len()))?;
        for key in section::ORDER {
            if let Some(value) = self.root.get(*key) {
                map.serialize_entry(key, value)?;
            }
        }
        for (key, value) in &self.root {
            if !section::ORDER.contains(&key.as_str()) {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_form_intrinsics() {
        let template = StackTemplate::parse(
            r#"
Resources:
  Table:
    Type: AWS::DynamoDB::Table
Outputs:
  TableName:
    Value: !Ref Table
  TableArn:
    Value: !GetAtt Table.Arn
  Joined:
    Value: !Sub "${Table}-x"
"#,
        )
        .unwrap();

        let outputs = template.outputs().unwrap();
        assert_eq!(
            outputs["TableName"].get("Value").unwrap(),
            &Node::reference("Table")
        );
        assert_eq!(
            outputs["TableArn"].get("Value").unwrap(),
            &Node::get_att("Table", "Arn")
        );
        assert_eq!(
            outputs["Joined"].get("Value").unwrap(),
            &Node::sub("${Table}-x")
        );
    }

    #[test]
    fn parses_json() {
        let template =
            StackTemplate::parse(r#"{"Resources": {"Q": {"Type": "AWS::SQS::Queue"}}}"#).unwrap();
        assert_eq!(template.resource_type("Q"), Some("AWS::SQS::Queue"));
    }

    #[test]
    fn empty_document_is_empty_template() {
        assert!(StackTemplate::parse("").unwrap().is_empty());
    }

    #[test]
    fn non_mapping_root_is_rejected() {
        assert!(matches!(
            StackTemplate::parse("- a\n- b\n"),
            Err(crate::Error::TemplateRoot)
        ));
    }

    #[test]
    fn renders_sections_in_canonical_order() {
        let mut template = StackTemplate::new();
        template.set("Outputs", Node::empty_map());
        template.set("Resources", Node::empty_map());
        template.set("Parameters", Node::empty_map());
        template.set("AWSTemplateFormatVersion", "2010-09-09");

        let yaml = template.to_yaml().unwrap();
        let pos = |s: &str| yaml.find(s).unwrap();
        assert!(pos("AWSTemplateFormatVersion") < pos("Parameters"));
        assert!(pos("Parameters") < pos("Resources"));
        assert!(pos("Resources") < pos("Outputs"));
    }

    #[test]
    fn yaml_render_parses_back_to_same_tree() {
        let source = r#"
Parameters:
  App:
    Type: String
Resources:
  Bucket:
    Type: AWS::S3::Bucket
    Properties:
      Tags:
        - Key: copilot
          Value: !Ref App
      VersioningConfiguration:
        Status: Enabled
"#;
        let template = StackTemplate::parse(source).unwrap();
        let reparsed = StackTemplate::parse(&template.to_yaml().unwrap()).unwrap();
        assert_eq!(template, reparsed);
    }

    #[test]
    fn pointer_lookup_through_lists() {
        let template = StackTemplate::parse(
            "Resources:\n  T:\n    Properties:\n      Items:\n        - Name: a\n        - Name: b\n",
        )
        .unwrap();
        let p = Pointer::parse("/Resources/T/Properties/Items/1/Name").unwrap();
        assert_eq!(template.pointer(&p).and_then(Node::as_str), Some("b"));
        let missing = Pointer::parse("/Resources/T/Properties/Items/2").unwrap();
        assert!(template.pointer(&missing).is_none());
    }

    #[test]
    fn resources_of_type_filters() {
        let template = StackTemplate::parse(
            "Resources:\n  A:\n    Type: AWS::IAM::ManagedPolicy\n  B:\n    Type: AWS::S3::Bucket\n",
        )
        .unwrap();
        let ids: Vec<_> = template.resources_of_type("AWS::IAM::ManagedPolicy").collect();
        assert_eq!(ids, vec!["A"]);
    }
}
