//! Remote Admin - Remote host administration over HTTP
//!
//! This library provides:
//! - Allowlisted ad-hoc command execution with shell-metacharacter rejection
//! - Deadline-bounded subprocesses with process-group kill and 1 MiB output cap
//! - Service restart and log retrieval through the platform service manager
//! - Host status snapshots assembled from concurrent probes
//! - An axum HTTP surface with HS256 bearer authentication

pub mod auth;
pub mod config;
pub mod gateway;
pub mod limits;
pub mod platform;
pub mod policy;
pub mod runner;
pub mod server;
pub mod service;
pub mod status;

pub use auth::{AuthError, Claims, JwtVerifier};
pub use config::{ConfigError, ServerConfig};
pub use gateway::{CommandGateway, CommandRequest, GatewayError};
pub use limits::ResourceLimits;
pub use platform::{Invocation, LaunchStrategy, Platform, UnixLauncher, WindowsLauncher};
pub use policy::{
    validate_command, validate_line_count, validate_name, Allowlist, AllowlistEntry,
    AllowlistError, RejectionReason, ValidatedCommand,
};
pub use runner::{
    CommandRunner, CompletedRun, ExecutionContext, ExecutionResult, ProcessRunner, RunOptions,
    RunOutcome,
};
pub use server::{build_router, run_server, AppState};
pub use service::{RestartReport, ServiceError, ServiceLogs, ServiceOps};
pub use status::{HostProbe, StatusAggregator, StatusSnapshot, SysinfoProbe};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remote_admin=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
