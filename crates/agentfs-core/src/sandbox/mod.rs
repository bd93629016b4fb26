//! Clients for remote execution environments.
//!
//! The sandbox backend only needs three primitives: run a shell command,
//! upload a file, download a file. Provisioning and lifecycle of the
//! environment belong to whoever hands us the client.

pub mod http;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::types::ExecuteResponse;

pub use http::HttpSandboxClient;
pub use process::LocalProcessClient;

/// Default bound on a single sandbox command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Short identifier used in logs.
    fn id(&self) -> &str;

    /// Run `command` through a POSIX shell, combining stdout and stderr.
    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecuteResponse, SandboxError>;

    /// Create or replace a file.
    async fn upload_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError>;

    /// Fetch a file. Missing files are [`SandboxError::NotFound`].
    async fn download_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;
}
