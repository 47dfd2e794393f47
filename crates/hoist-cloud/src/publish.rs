//! Content-addressed upload of local files referenced by the template.
//!
//! A nested stack's `TemplateURL` is published as a template of its own:
//! its assets are uploaded and rewritten first, and the rewritten body is
//! what gets hashed and uploaded.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use futures::{StreamExt, TryStreamExt, stream};
use hoist_core::template::section;
use hoist_core::{AssetRule, AssetsConfig, Node, Pointer, RewriteStyle, StackTemplate};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::remote::{ObjectLocation, ObjectStore, RemoteError};

/// Resource type whose `TemplateURL` points at another template.
pub const NESTED_STACK_TYPE: &str = "AWS::CloudFormation::Stack";

const MAX_NESTING_DEPTH: usize = 8;

/// A resource property holding a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    pub logical_id: String,
    pub resource_type: String,
    /// Absolute location of the property in the template.
    pub pointer: Pointer,
    pub local_path: PathBuf,
    pub rewrite: RewriteStyle,
}

/// Uploads local assets and rewrites their references.
pub struct AssetPublisher<'s, S: ObjectStore> {
    store: &'s S,
    root: PathBuf,
    rules: Vec<AssetRule>,
    prefix: String,
    concurrency: usize,
    /// Nested templates held in memory, keyed by the local path the parent
    /// references them by.
    nested: BTreeMap<PathBuf, StackTemplate>,
}

struct PreparedAsset {
    key: String,
    body: Vec<u8>,
}

impl<'s, S: ObjectStore> AssetPublisher<'s, S> {
    pub fn new(store: &'s S, project_dir: &Path, config: &AssetsConfig) -> Self {
        Self {
            store,
            root: project_dir.to_path_buf(),
            rules: config.allow_list(),
            prefix: config.prefix.trim_end_matches('/').to_owned(),
            concurrency: config.upload_concurrency(),
            nested: BTreeMap::new(),
        }
    }

    /// Replace the allow-list of uploadable properties.
    pub fn with_rules(mut self, rules: Vec<AssetRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Use `template` for nested stacks referencing `path` instead of
    /// reading it from disk.
    pub fn with_nested_template(
        mut self,
        path: impl Into<PathBuf>,
        template: StackTemplate,
    ) -> Self {
        self.nested.insert(path.into(), template);
        self
    }

    /// Properties on the allow-list whose value is a local path.
    pub fn find_references(
        &self,
        template: &StackTemplate,
    ) -> Result<Vec<AssetReference>, PublishError> {
        let mut found = Vec::new();
        for (id, resource) in template.resources().into_iter().flatten() {
            let Some(type_name) = resource.get("Type").and_then(Node::as_str) else {
                continue;
            };
            for rule in self.rules.iter().filter(|r| r.resource_type == type_name) {
                let property =
                    Pointer::parse(&rule.property).map_err(|e| PublishError::InvalidRule {
                        resource_type: rule.resource_type.clone(),
                        property: rule.property.clone(),
                        source: e,
                    })?;
                let pointer =
                    Pointer::from_segments([section::RESOURCES, id.as_str(), "Properties"])
                        .join(&property);
                let Some(value) = template.pointer(&pointer).and_then(Node::as_str) else {
                    continue;
                };
                if !is_local(value) {
                    continue;
                }
                found.push(AssetReference {
                    logical_id: id.clone(),
                    resource_type: type_name.to_owned(),
                    pointer,
                    local_path: PathBuf::from(value),
                    rewrite: rule.rewrite.clone(),
                });
            }
        }
        Ok(found)
    }

    /// Upload every referenced asset and return the rewritten template.
    pub async fn publish(&self, template: &StackTemplate) -> Result<StackTemplate, PublishError> {
        self.run(template, true, 0).await
    }

    /// Rewrite references to where the assets would be uploaded, without
    /// uploading anything.
    pub async fn plan(&self, template: &StackTemplate) -> Result<StackTemplate, PublishError> {
        self.run(template, false, 0).await
    }

    async fn run(
        &self,
        template: &StackTemplate,
        upload: bool,
        depth: usize,
    ) -> Result<StackTemplate, PublishError> {
        let references = self.find_references(template)?;
        if references.is_empty() {
            return Ok(template.clone());
        }

        let mut keys = Vec::with_capacity(references.len());
        let mut unique: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for reference in &references {
            let prepared = if reference.resource_type == NESTED_STACK_TYPE {
                self.prepare_nested(reference, upload, depth).await?
            } else {
                self.prepare(reference)?
            };
            keys.push(prepared.key.clone());
            unique.entry(prepared.key).or_insert(prepared.body);
        }
        tracing::debug!(
            references = references.len(),
            unique = unique.len(),
            "prepared assets"
        );

        let locations: BTreeMap<String, ObjectLocation> = if upload {
            stream::iter(unique)
                .map(|(key, body)| async move {
                    self.store
                        .put_object_if_absent(&key, &body)
                        .await
                        .map(|location| (key.clone(), location))
                        .map_err(|e| PublishError::Upload { key, source: e })
                })
                .buffer_unordered(self.concurrency)
                .try_collect()
                .await?
        } else {
            unique
                .into_keys()
                .map(|key| {
                    self.store
                        .location(&key)
                        .map(|location| (key.clone(), location))
                        .map_err(|e| PublishError::Upload { key, source: e })
                })
                .collect::<Result<_, _>>()?
        };

        let mut root = Node::Map(template.root().clone());
        for (reference, key) in references.iter().zip(&keys) {
            let location = locations
                .get(key)
                .ok_or_else(|| PublishError::MissingLocation { key: key.clone() })?;
            let target = root.pointer_mut(&reference.pointer).ok_or_else(|| {
                PublishError::MissingLocation {
                    key: reference.pointer.to_string(),
                }
            })?;
            *target = rewrite(&reference.rewrite, location);
            tracing::debug!(
                resource = %reference.logical_id,
                path = %reference.local_path.display(),
                %key,
                "rewrote asset reference"
            );
        }

        match root {
            Node::Map(map) => Ok(StackTemplate::from_root(map)),
            _ => Ok(template.clone()),
        }
    }

    /// Publish the nested template's own assets, then key it by the
    /// rewritten body.
    async fn prepare_nested(
        &self,
        reference: &AssetReference,
        upload: bool,
        depth: usize,
    ) -> Result<PreparedAsset, PublishError> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(PublishError::NestingTooDeep {
                logical_id: reference.logical_id.clone(),
            });
        }
        let path = self.root.join(&reference.local_path);
        let nested = match self.nested.get(&reference.local_path) {
            Some(template) => template.clone(),
            None if path.is_file() => {
                let body = std::fs::read_to_string(&path).map_err(|e| PublishError::Read {
                    path: path.clone(),
                    source: e,
                })?;
                StackTemplate::parse(&body).map_err(|e| PublishError::NestedTemplate {
                    path: path.clone(),
                    source: e,
                })?
            }
            None => {
                return Err(PublishError::AssetNotFound {
                    logical_id: reference.logical_id.clone(),
                    path,
                });
            }
        };

        let published = Box::pin(self.run(&nested, upload, depth + 1)).await?;
        let body = published
            .to_yaml()
            .map_err(|e| PublishError::NestedTemplate { path, source: e })?
            .into_bytes();
        let key = format!("{}/{}.yml", self.prefix, sha256_hex(&body));
        Ok(PreparedAsset { key, body })
    }

    fn prepare(&self, reference: &AssetReference) -> Result<PreparedAsset, PublishError> {
        let path = self.root.join(&reference.local_path);
        if path.is_dir() {
            let body = zip_directory(&path)?;
            let key = format!("{}/{}.zip", self.prefix, sha256_hex(&body));
            Ok(PreparedAsset { key, body })
        } else if path.is_file() {
            let body = std::fs::read(&path).map_err(|e| PublishError::Read {
                path: path.clone(),
                source: e,
            })?;
            let key = format!("{}/{}", self.prefix, sha256_hex(&body));
            Ok(PreparedAsset { key, body })
        } else {
            Err(PublishError::AssetNotFound {
                logical_id: reference.logical_id.clone(),
                path,
            })
        }
    }
}

/// Remote URLs are already published.
fn is_local(value: &str) -> bool {
    !value.is_empty()
        && !["s3://", "http://", "https://"]
            .iter()
            .any(|scheme| value.starts_with(scheme))
}

fn rewrite(style: &RewriteStyle, location: &ObjectLocation) -> Node {
    match style {
        RewriteStyle::Object {
            bucket_field,
            key_field,
        } => Node::Map(
            [
                (bucket_field.clone(), Node::string(location.bucket.as_str())),
                (key_field.clone(), Node::string(location.key.as_str())),
            ]
            .into_iter()
            .collect(),
        ),
        RewriteStyle::S3Uri => Node::string(location.s3_uri()),
        RewriteStyle::HttpsUrl => Node::string(location.https_url()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Zip a directory with sorted entries and fixed metadata, so identical
/// content always yields identical bytes.
pub fn zip_directory(dir: &Path) -> Result<Vec<u8>, PublishError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    let archive_error = |e: zip::result::ZipError| PublishError::Archive {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| PublishError::Walk {
            path: dir.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Entry paths are `dir` followed by `depth` components.
        let components: Vec<_> = entry.path().components().collect();
        let name = components[components.len().saturating_sub(entry.depth())..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let content = std::fs::read(entry.path()).map_err(|e| PublishError::Read {
            path: entry.path().to_path_buf(),
            source: e,
        })?;

        writer.start_file(name, options).map_err(archive_error)?;
        writer
            .write_all(&content)
            .map_err(|e| archive_error(e.into()))?;
    }

    let cursor = writer.finish().map_err(archive_error)?;
    Ok(cursor.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{logical_id} references {path}, which does not exist")]
    AssetNotFound { logical_id: String, path: PathBuf },

    #[error("failed to upload asset {key}")]
    Upload { key: String, source: RemoteError },

    #[error("invalid asset rule {resource_type} {property}")]
    InvalidRule {
        resource_type: String,
        property: String,
        source: hoist_core::Error,
    },

    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to walk {path}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("failed to archive {path}")]
    Archive {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    #[error("no uploaded location for {key}")]
    MissingLocation { key: String },

    #[error("nested template {path} could not be processed")]
    NestedTemplate {
        path: PathBuf,
        source: hoist_core::Error,
    },

    #[error("{logical_id} nests templates too deeply")]
    NestingTooDeep { logical_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_urls_are_not_local() {
        assert!(is_local("lambda/handler"));
        assert!(is_local("./build/fn.zip"));
        assert!(!is_local("s3://bucket/key"));
        assert!(!is_local("https://example.com/x"));
        assert!(!is_local(""));
    }

    #[test]
    fn zip_is_deterministic_across_mtime_changes() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/nested")).unwrap();
        std::fs::write(tmp.path().join("src/index.js"), "exports.handler = 1").unwrap();
        std::fs::write(tmp.path().join("src/nested/util.js"), "module.exports = 2").unwrap();

        let first = zip_directory(&tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/index.js"), "exports.handler = 1").unwrap();
        let second = zip_directory(&tmp.path().join("src")).unwrap();
        assert_eq!(sha256_hex(&first), sha256_hex(&second));

        std::fs::write(tmp.path().join("src/index.js"), "exports.handler = 3").unwrap();
        let third = zip_directory(&tmp.path().join("src")).unwrap();
        assert_ne!(sha256_hex(&first), sha256_hex(&third));
    }

    #[test]
    fn object_rewrite_uses_configured_fields() {
        let location = ObjectLocation {
            bucket: "b".to_owned(),
            key: "assets/abc".to_owned(),
            region: "eu-west-1".to_owned(),
        };
        let node = rewrite(
            &RewriteStyle::Object {
                bucket_field: "S3Bucket".to_owned(),
                key_field: "S3Key".to_owned(),
            },
            &location,
        );
        assert_eq!(node.get("S3Bucket").and_then(Node::as_str), Some("b"));
        assert_eq!(node.get("S3Key").and_then(Node::as_str), Some("assets/abc"));
        assert_eq!(
            rewrite(&RewriteStyle::HttpsUrl, &location),
            Node::string("https://b.s3.eu-west-1.amazonaws.com/assets/abc")
        );
    }
}
