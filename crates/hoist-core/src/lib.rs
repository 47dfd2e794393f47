//! Core types and configuration for hoist.
//!
//! This crate defines the `hoist.toml` schema ([`HoistConfig`]), the
//! schema-agnostic [`StackTemplate`] tree every pipeline stage operates on,
//! `/`-delimited [`Pointer`]s into that tree, and shared error types.

pub mod config;
pub mod error;
pub mod pointer;
pub mod template;

pub use config::{
    AssetRule, AssetsConfig, DeployConfig, HealthCheckConfig, HoistConfig, Placement,
    ProjectConfig, RewriteStyle, RollbackPolicy, ScalingConfig, StackIdentity, WorkloadConfig,
    default_asset_rules,
};
pub use error::{Error, Result};
pub use pointer::Pointer;
pub use template::{Node, NodeMap, Scalar, StackTemplate};
