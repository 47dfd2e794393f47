//! Local template synthesis for hoist.
//!
//! # Pipeline
//!
//! ```text
//! hoist deploy
//!   1. Addons    ── discover .hoist/addons/<workload>/ → bundle()
//!   2. Compose   ── StackComposer::compose() with AddonsStack nested
//!   3. Overrides ── .hoist/overrides/patches.yml → apply()
//!   4. Assets    ── hoist-cloud AssetPublisher
//!   5. Release   ── hoist-cloud ReleaseDriver
//! ```
//!
//! Stages 1–3 live here and never touch the network or the filesystem
//! beyond reading project files. Each returns a new value, so a failure
//! leaves earlier results untouched. [`package`] writes the results out.

pub mod addons;
pub mod compose;
pub mod overrides;
pub mod package;
pub mod synth;

pub use addons::{AddonBundle, AddonError, AddonFragment, AddonScope, bundle};
pub use compose::StackComposer;
pub use overrides::{OverrideError, PatchFailure, PatchOp, PatchRule};
pub use synth::{Synthesis, SynthesisError, synthesize};
