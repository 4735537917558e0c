//! Uniform transport abstraction over local process exec and SSH.
//!
//! A `#[async_trait]` trait object with default-method fallbacks, created
//! through a small factory that dispatches on a spec string rather than
//! requiring callers to know the concrete backend.

pub mod local;
#[cfg(feature = "ssh")]
pub mod ssh;

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Uniform interface an agent (local machine or SSH host) exposes to the
/// orchestrator: run commands, stream a long-running command's output,
/// and move files in and out.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn exec(&self, command: &str, args: &[String]) -> Result<ExecOutput>;

    /// Starts `command` and returns a handle that can be polled for exit
    /// and cancelled. Used for long-running server/client roles where the
    /// orchestrator needs to signal cancellation mid-flight.
    async fn exec_stream(&self, command: &str, args: &[String]) -> Result<Box<dyn ExecHandle>>;

    async fn put(&self, local: &Path, remote: &str) -> Result<()>;
    async fn get(&self, remote: &str, local: &Path) -> Result<()>;
    async fn mkdir(&self, remote: &str) -> Result<()>;
    async fn stat(&self, remote: &str) -> Result<Option<u64>>;
    async fn remove(&self, remote: &str) -> Result<()>;

    /// Default no-op; only meaningful for backends holding a persistent
    /// connection (SSH). Local exec has nothing to tear down.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A running remote process. Cancellation maps to SIGTERM, then SIGKILL
/// after `grace_period` if the process hasn't exited.
#[async_trait]
pub trait ExecHandle: Send + Sync {
    async fn wait(&mut self) -> Result<i32>;
    async fn try_wait(&mut self) -> Result<Option<i32>>;
    async fn cancel(&mut self, grace_period: std::time::Duration) -> Result<()>;
}

/// Parses a transport spec string (`local`, `ssh://user@host:port`, or the
/// shorthand `user@host[:port]` / `host`) and builds the matching backend.
pub fn from_spec(spec: &str) -> Result<Box<dyn Transport>> {
    if spec == "local" || spec.is_empty() {
        return Ok(Box::new(local::LocalTransport::new()));
    }
    #[cfg(feature = "ssh")]
    {
        if let Some(opts) = ssh::SshOptions::parse(spec)? {
            return Ok(Box::new(ssh::SshTransport::connect(opts)?));
        }
    }
    #[cfg(not(feature = "ssh"))]
    {
        if spec.starts_with("ssh://") || spec.contains('@') {
            return Err(crate::error::CipdipError::Config(format!(
                "transport `{spec}` requires the `ssh` feature"
            )));
        }
    }
    Err(crate::error::CipdipError::Config(format!(
        "unrecognized transport spec `{spec}`"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_spec_resolves() {
        let t = from_spec("local").unwrap();
        assert_eq!(t.name(), "local");
    }

    #[test]
    fn unknown_spec_errors() {
        assert!(from_spec("carrier-pigeon://nowhere").is_err());
    }
}
