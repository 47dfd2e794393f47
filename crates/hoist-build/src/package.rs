use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hoist_core::StackTemplate;

use crate::addons::AddonBundle;
use crate::compose::ADDONS_TEMPLATE_PATH;

/// Files written by [`write_artifacts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub template: PathBuf,
    pub parameters: PathBuf,
}

/// Write the bundled addons template where the composed template's
/// `TemplateURL` expects it. Stale output is removed when there are no addons.
pub fn write_addons_template(
    project_dir: &Path,
    bundle: &AddonBundle,
) -> Result<Option<PathBuf>, PackageError> {
    let path = project_dir.join(ADDONS_TEMPLATE_PATH);

    if bundle.is_empty() {
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| PackageError::Cleanup {
                path: path.clone(),
                source: e,
            })?;
        }
        return Ok(None);
    }

    let content = bundle
        .template
        .to_yaml()
        .map_err(|e| PackageError::Render { source: e })?;
    write_file(&path, &content)?;
    tracing::debug!(path = %path.display(), sources = bundle.sources.len(), "wrote addons template");
    Ok(Some(path))
}

/// Write `<stack>.stack.yml` and `<stack>.params.json` into `output_dir`.
///
/// The parameters file has the shape
/// `{"Parameters": {...}, "Tags": {...}}`.
pub fn write_artifacts(
    output_dir: &Path,
    stack_name: &str,
    template: &StackTemplate,
    parameters: &BTreeMap<String, String>,
    tags: &BTreeMap<String, String>,
) -> Result<Artifacts, PackageError> {
    let template_path = output_dir.join(format!("{stack_name}.stack.yml"));
    let params_path = output_dir.join(format!("{stack_name}.params.json"));

    let rendered = template
        .to_yaml()
        .map_err(|e| PackageError::Render { source: e })?;
    write_file(&template_path, &rendered)?;

    let params = serde_json::json!({
        "Parameters": parameters,
        "Tags": tags,
    });
    let params = serde_json::to_string_pretty(&params)
        .map_err(|e| PackageError::Serialize { source: e })?;
    write_file(&params_path, &params)?;

    Ok(Artifacts {
        template: template_path,
        parameters: params_path,
    })
}

fn write_file(path: &Path, content: &str) -> Result<(), PackageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PackageError::Create {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, content).map_err(|e| PackageError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("failed to create directory {path}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove stale {path}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to render template")]
    Render { source: hoist_core::Error },
    #[error("failed to serialize stack parameters")]
    Serialize { source: serde_json::Error },
}
