use std::collections::BTreeMap;
use std::path::Path;

use hoist_core::{HoistConfig, StackIdentity, StackTemplate};

use crate::addons::{self, AddonBundle, AddonError, AddonScope};
use crate::compose::StackComposer;
use crate::overrides::{self, OverrideError, PatchFailure};

/// Output of the local stages: bundle, compose and patch.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub identity: StackIdentity,
    pub bundle: AddonBundle,
    /// The composed template before patch rules.
    pub composed: StackTemplate,
    /// The template after patch rules, ready for asset publishing.
    pub template: StackTemplate,
    pub parameters: BTreeMap<String, String>,
}

/// Run addon bundling, composition and patch rules for the project.
///
/// Workload and environment addons are bundled together. Nothing is
/// written; see [`crate::package::write_addons_template`] for the bundled
/// template on disk.
pub fn synthesize(project_dir: &Path, config: &HoistConfig) -> Result<Synthesis, SynthesisError> {
    let identity = config.identity()?;
    let image = config.image()?;

    let mut source = addons::discover(project_dir, AddonScope::Workload(&identity.workload))?;
    source.extend(addons::discover(project_dir, AddonScope::Environment)?);
    let bundle = source.bundle()?;
    tracing::debug!(fragments = bundle.sources.len(), "bundled addons");

    let composer = StackComposer::new(&identity, &config.workload);
    let composed = composer.compose(&bundle);
    let parameters = composer.parameters(image);

    let rules = overrides::load_rules(project_dir)?;
    let template = overrides::apply(&composed, &rules).map_err(PatchFailure::into_error)?;

    Ok(Synthesis {
        identity,
        bundle,
        composed,
        template,
        parameters,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error(transparent)]
    Config(#[from] hoist_core::Error),
    #[error(transparent)]
    Addon(#[from] AddonError),
    #[error(transparent)]
    Override(#[from] OverrideError),
}
