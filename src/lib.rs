pub mod analyze;
pub mod cli;
pub mod config;
pub mod contract;
pub mod describe;
pub mod error;
pub mod github;
pub mod ingest;
pub mod load_config;
pub mod session;
pub mod synchronise;
pub mod tree;

pub use cli::{run, Cli, Commands};
pub use contract::{HostError, RepositoryHost, Visibility};
pub use error::PipelineError;
pub use session::{ArchivePayload, Coordinator, OperatorId, PipelineOptions, Response};
