//! Configuration and job graph errors. Both are fatal at job submission.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid scheduler configuration or vertex bounds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("`{key}` must be at least 1; zero parallelism is not allowed")]
    ZeroParallelism { key: &'static str },

    #[error("min parallelism {min} exceeds max parallelism {max} for {scope}")]
    InvertedBounds { scope: String, min: u32, max: u32 },

    #[error("vertex {vertex} has fixed parallelism {parallelism} outside [{min}, {max}]")]
    FixedParallelismOutOfBounds {
        vertex: String,
        parallelism: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid job graph: {0}")]
    Graph(#[from] GraphError),
}

/// Structural problems in a submitted job graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("job graph has no vertices")]
    Empty,

    #[error("duplicate vertex id: {0}")]
    DuplicateVertex(String),

    #[error("edge {from} -> {to} references unknown vertex {missing}")]
    UnknownVertex {
        from: String,
        to: String,
        missing: String,
    },

    #[error("vertex {0} consumes its own output")]
    SelfLoop(String),

    #[error("job graph contains a cycle through {0:?}")]
    Cycle(Vec<String>),
}
