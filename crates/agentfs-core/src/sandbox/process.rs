use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::SandboxClient;
use crate::error::SandboxError;
use crate::types::ExecuteResponse;

/// Runs sandbox commands as local `sh -c` processes.
///
/// For development and for hosts that are themselves the sandbox (a container
/// the agent was started in). Paths are host paths.
pub struct LocalProcessClient {
    working_dir: PathBuf,
}

impl LocalProcessClient {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl SandboxClient for LocalProcessClient {
    fn id(&self) -> &str {
        "local"
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecuteResponse, SandboxError> {
        let result = tokio::time::timeout(
            timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.working_dir)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                Ok(ExecuteResponse {
                    output: text,
                    exit_code: output.status.code(),
                    truncated: false,
                })
            }
            Ok(Err(e)) => Err(SandboxError::Unreachable(format!("failed to spawn shell: {e}"))),
            Err(_) => Err(SandboxError::Timeout(timeout.as_secs())),
        }
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let target = self.working_dir.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::Remote { code: -1, message: e.to_string() })?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| SandboxError::Remote { code: -1, message: e.to_string() })
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        match tokio::fs::read(self.working_dir.join(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(path.to_string()))
            }
            Err(e) => Err(SandboxError::Remote { code: -1, message: e.to_string() }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_collects_output_and_status() {
        let tmp = tempfile::tempdir().unwrap();
        let client = LocalProcessClient::new(tmp.path());

        let ok = client.execute("echo hello", Duration::from_secs(5)).await.unwrap();
        assert_eq!(ok.output, "hello\n");
        assert_eq!(ok.exit_code, Some(0));

        let failed = client
            .execute("echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(failed.exit_code, Some(3));
        assert!(failed.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let client = LocalProcessClient::new(tmp.path());
        let err = client
            .execute("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_upload_download() {
        let tmp = tempfile::tempdir().unwrap();
        let client = LocalProcessClient::new(tmp.path());
        let path = tmp.path().join("sub").join("f.txt");
        let path = path.to_str().unwrap();

        client.upload_file(path, b"data").await.unwrap();
        assert_eq!(client.download_file(path).await.unwrap(), b"data");

        let missing = tmp.path().join("missing.txt");
        let err = client.download_file(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }
}
