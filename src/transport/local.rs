//! Local-machine transport: spawns subprocesses directly.
//!
//! Spawns role processes with `tokio::process::Command` and polls for
//! readiness, the async counterpart of a plain `std::process::Command`
//! spawn-and-poll loop.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::error::{CipdipError, Result};
use crate::transport::{ExecHandle, ExecOutput, Transport};

pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        LocalTransport
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn exec(&self, command: &str, args: &[String]) -> Result<ExecOutput> {
        let output = Command::new(command)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(CipdipError::Io)?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn exec_stream(&self, command: &str, args: &[String]) -> Result<Box<dyn ExecHandle>> {
        let child = Command::new(command)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CipdipError::Io)?;
        Ok(Box::new(LocalExecHandle { child: Some(child) }))
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        tokio::fs::copy(local, remote).await.map_err(CipdipError::Io)?;
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        tokio::fs::copy(remote, local).await.map_err(CipdipError::Io)?;
        Ok(())
    }

    async fn mkdir(&self, remote: &str) -> Result<()> {
        tokio::fs::create_dir_all(remote).await.map_err(CipdipError::Io)?;
        Ok(())
    }

    async fn stat(&self, remote: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(remote).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CipdipError::Io(e)),
        }
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        match tokio::fs::remove_file(remote).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CipdipError::Io(e)),
        }
    }
}

struct LocalExecHandle {
    child: Option<Child>,
}

#[async_trait]
impl ExecHandle for LocalExecHandle {
    async fn wait(&mut self) -> Result<i32> {
        let child = self.child.as_mut().ok_or_else(|| {
            CipdipError::Invariant("exec handle already consumed".into())
        })?;
        let status = child.wait().await.map_err(CipdipError::Io)?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn try_wait(&mut self) -> Result<Option<i32>> {
        let child = self.child.as_mut().ok_or_else(|| {
            CipdipError::Invariant("exec handle already consumed".into())
        })?;
        Ok(child.try_wait().map_err(CipdipError::Io)?.and_then(|s| s.code()))
    }

    async fn cancel(&mut self, grace_period: Duration) -> Result<()> {
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        let timed_out = tokio::time::timeout(grace_period, child.wait()).await.is_err();
        if timed_out {
            child.kill().await.map_err(CipdipError::Io)?;
        }
        Ok(())
    }
}

/// Drains a child's stdout/stderr to completion; used by callers that want
/// the full output of an already-spawned long-running process.
#[allow(dead_code)]
async fn drain_pipe(mut pipe: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_runs_true_successfully() {
        let transport = LocalTransport::new();
        let output = transport.exec("true", &[]).await.unwrap();
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn mkdir_and_stat_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new();
        let nested = dir.path().join("a/b/c");
        transport.mkdir(nested.to_str().unwrap()).await.unwrap();
        assert!(nested.exists());
    }
}
