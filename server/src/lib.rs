//! # Protean Server
//!
//! The runtime half of the framework: one [`Engine`] per worker process
//! hosts every subscription, outbox processor, and the trace emitter under
//! a single cooperative scheduler; the [`Supervisor`] spawns and monitors
//! N worker processes and owns signal handling.
//!
//! Applications assemble a [`Domain`] — a name plus an explicitly
//! registered set of handlers — and hand the CLI a factory for it:
//!
//! ```rust,no_run
//! use protean_server::{cli, Domain, ProteanConfig};
//!
//! fn build_domain(config: ProteanConfig) -> Domain {
//!     Domain::new("ordering", config)
//!     // .register_event_handler(...) etc.
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     cli::run(build_domain)
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod engine;
mod observatory_api;
#[cfg(unix)]
pub mod supervisor;

pub use commands::{
    CachedOutcome, CommandBus, CommandError, CommandReceipt, DuplicatePolicy, IdempotencyCache,
    InMemoryIdempotencyCache, SubmitOutcome,
};
pub use config::{ConfigError, ProteanConfig};
pub use domain::{Domain, HandlerRegistry, Ports};
pub use engine::{Engine, EngineError, EngineHandle, EngineOptions};
#[cfg(unix)]
pub use supervisor::{Supervisor, WorkerCommand};
