#[derive(Debug, thiserror::Error)]
pub enum AwsCliError {
    #[error(
        "aws CLI not found; install it from https://docs.aws.amazon.com/cli/latest/userguide/getting-started-install.html"
    )]
    NotFound { source: std::io::Error },

    #[error("aws command failed: {args:?}\n{stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },

    #[error("aws output was not valid UTF-8")]
    InvalidUtf8 { source: std::string::FromUtf8Error },

    #[error("failed to write to aws stdin")]
    StdinWrite { source: std::io::Error },
}

impl AwsCliError {
    /// Standard error of a failed command, if the command ran.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            AwsCliError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}
