use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Connection(#[from] mongodb_client::Error),

    #[error("{0}")]
    Engine(#[from] advisor_core::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Connection(_) => 2,
            CliError::Engine(_) => 1,
        }
    }
}
