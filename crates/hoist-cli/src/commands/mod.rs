mod deploy;
mod deploy_pipeline;
mod diff;
mod package;
mod status;

pub use deploy::{DeployOptions, deploy};
pub use diff::diff;
pub use package::package;
pub use status::status;
