pub mod assembler;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fragment;
pub mod governor;
pub mod models;
pub mod paginator;
pub mod session;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{EngineConfig, JobConfig, JobInput, PaginationConfig};
pub use dispatcher::{Engine, OutcomeStream};
pub use error::{AppError, ErrorKind, FetchError};
pub use governor::{GovernorConfig, RateGovernor};
pub use models::{Identifier, Record, RunSummary, RunTermination, WorkOutcome, compute_hash};
pub use session::{Credential, SessionContext};
pub use traits::{FetchRequest, ProfileFetcher, RawResponse};
pub use worker::{EngineEvent, TracingReporter, WorkerReporter};
