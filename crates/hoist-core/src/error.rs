use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{field} not set in hoist.toml")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    // ── Templates ──
    #[error("template is not valid YAML or JSON")]
    TemplateSyntax { source: serde_yaml::Error },

    #[error("template root must be a mapping")]
    TemplateRoot,

    #[error("unsupported mapping key in template: {key}")]
    TemplateKey { key: String },

    #[error("failed to render template as YAML")]
    RenderYaml { source: serde_yaml::Error },

    #[error("failed to render template as JSON")]
    RenderJson { source: serde_json::Error },

    #[error("invalid path {pointer:?}: {reason}")]
    InvalidPointer {
        pointer: String,
        reason: &'static str,
    },
}
