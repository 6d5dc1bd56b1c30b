use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("the profiling stream ended; is profiling still enabled on the database?")]
    ProfilingStreamEnded,

    #[error("failed to persist engine state: {0}")]
    StatePersistence(String),

    #[error("failed to load engine state: {0}")]
    StateCorrupt(String),

    #[error("could not configure profiling level {level}: {message}")]
    ProfileConfiguration { level: i32, message: String },
}
