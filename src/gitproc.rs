//! Invocation of the shipped `git` binary.
//!
//! Anything beyond index projection and object I/O is delegated to `git` as a
//! sub-process: pack indexing, multi-pack-index maintenance, commit-graph
//! writes, config, and the credential helper. Inherited `GIT_*` environment
//! variables are scrubbed so a hook-spawned mount can't be poisoned by its
//! parent's index state.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::GvfsError;

/// `GIT_*` variables that are safe to keep when spawning git.
const GIT_ENV_KEEP: &[&str] = &[
    "GIT_EXEC_PATH",
    "GIT_SSH",
    "GIT_SSH_COMMAND",
    "GIT_SSL_CAINFO",
    "GIT_SSL_NO_VERIFY",
    "GIT_CONFIG_COUNT",
    "GIT_ALLOW_PROTOCOL",
    "GIT_ASKPASS",
];

/// Captured output of a finished git invocation.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl GitOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Builder for one git sub-process run against a specific git dir.
pub struct GitCommand {
    binary: PathBuf,
    git_dir: Option<PathBuf>,
    work_tree: Option<PathBuf>,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    summary: String,
}

impl GitCommand {
    /// A command named for tracing; `summary` describes the intent.
    pub fn new(binary: impl Into<PathBuf>, summary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            git_dir: None,
            work_tree: None,
            args: Vec::new(),
            stdin: None,
            summary: summary.into(),
        }
    }

    pub fn git_dir(mut self, dir: &Path) -> Self {
        self.git_dir = Some(dir.to_path_buf());
        self
    }

    pub fn work_tree(mut self, dir: &Path) -> Self {
        self.work_tree = Some(dir.to_path_buf());
        self
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string_lossy().into_owned());
        }
        self
    }

    /// Bytes piped to the child's stdin (pack streams, credential requests).
    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    fn build(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        if let Some(dir) = &self.git_dir {
            cmd.arg("--git-dir").arg(dir);
        }
        if let Some(dir) = &self.work_tree {
            cmd.arg("--work-tree").arg(dir);
        }
        cmd.args(&self.args);
        for (key, _) in std::env::vars() {
            if key.starts_with("GIT_")
                && !key.starts_with("GIT_CONFIG_KEY_")
                && !key.starts_with("GIT_CONFIG_VALUE_")
                && !GIT_ENV_KEEP.contains(&key.as_str())
            {
                cmd.env_remove(&key);
            }
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run to completion; non-zero exit becomes a typed `GitCommand` error
    /// carrying both output streams.
    pub async fn output(self) -> Result<GitOutput, GvfsError> {
        debug!(summary = %self.summary, args = ?self.args, "running git");
        let mut child = self.build().spawn()?;
        if let Some(bytes) = &self.stdin {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                GvfsError::CustomError("child stdin unavailable".into())
            })?;
            stdin.write_all(bytes).await?;
            drop(stdin);
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(GvfsError::GitCommand {
                command: self.args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(GitOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Split NUL-delimited git output into path strings, dropping empties.
pub fn zsplit(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == b'\0')
        .filter(|slice| !slice.is_empty())
        .map(|slice| String::from_utf8_lossy(slice).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// zsplit drops empty segments and tolerates a trailing NUL.
    #[test]
    fn test_zsplit() {
        assert_eq!(
            zsplit(b"a/b.txt\0c d.txt\0\0"),
            vec!["a/b.txt".to_string(), "c d.txt".to_string()]
        );
        assert!(zsplit(b"").is_empty());
    }

    /// A successful invocation returns captured stdout.
    #[tokio::test]
    async fn test_output_success() {
        // `true`/`echo` stand in for git: the runner is binary-agnostic.
        let out = GitCommand::new("/bin/echo", "echo test")
            .arg("hello")
            .output()
            .await
            .unwrap();
        assert_eq!(out.stdout_str().trim(), "hello");
    }

    /// Non-zero exit surfaces as a typed External error.
    #[tokio::test]
    async fn test_output_failure() {
        let err = GitCommand::new("/bin/false", "always fails")
            .output()
            .await
            .unwrap_err();
        match err {
            GvfsError::GitCommand { code, .. } => assert_eq!(code, 1),
            other => panic!("expected GitCommand error, got {other:?}"),
        }
    }
}
