//! Policy oracle deciding whether a certificate chain may sign or revoke.
//!
//! The decision logic is external. [`CommandPolicyEvaluator`] invokes a
//! policy program with the chain written to a scratch file:
//!
//! ```text
//! <program> -chain <file> -pb <policy book>     exit status 0 allows
//! <program> -printAttr -pb <policy book>        prints a JSON list of attributes
//! ```
use crate::async_trait;
use openssl::x509::X509;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy evaluator I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not encode the chain: {0}")]
    Encoding(#[from] openssl::error::ErrorStack),
    #[error("Malformed evaluator output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("Policy evaluator failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Decide on a chain, leaf first.
    async fn evaluate(&self, chain: &[X509]) -> Result<PolicyDecision, PolicyError>;

    /// Attribute names the policy book can refer to.
    async fn list_attributes(&self) -> Result<Vec<String>, PolicyError>;
}

/// Runs an external policy program once per evaluation.
pub struct CommandPolicyEvaluator {
    program:     PathBuf,
    policy_book: PathBuf,
    scratch_dir: PathBuf,
}

impl CommandPolicyEvaluator {
    pub fn new(program: impl Into<PathBuf>, policy_book: impl Into<PathBuf>) -> Self {
        Self {
            program:     program.into(),
            policy_book: policy_book.into(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Directory receiving the temporary chain files. Defaults to the system
    /// temporary directory.
    pub fn set_scratch_dir(self, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            ..self
        }
    }

    /// A fresh chain file, removed again when dropped.
    fn scratch_file(&self) -> std::io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("gpchain-")
            .suffix(".pcn")
            .tempfile_in(&self.scratch_dir)
    }
}

#[async_trait]
impl PolicyEvaluator for CommandPolicyEvaluator {
    async fn evaluate(&self, chain: &[X509]) -> Result<PolicyDecision, PolicyError> {
        let mut pem = Vec::new();
        for cert in chain {
            pem.extend_from_slice(&cert.to_pem()?);
        }
        let file = self.scratch_file()?;
        tokio::fs::write(file.path(), &pem).await?;
        let output = tokio::process::Command::new(&self.program)
            .arg("-chain")
            .arg(file.path())
            .arg("-pb")
            .arg(&self.policy_book)
            .output()
            .await;
        if let Err(e) = file.close() {
            tracing::warn!(target: "gpchain_policy", "Could not remove the chain file: {e}");
        }
        let output = output?;
        if output.status.success() {
            return Ok(PolicyDecision::Allow);
        }
        let mut reason = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !reason.is_empty() {
                reason.push('\n');
            }
            reason.push_str(stderr.trim());
        }
        if reason.is_empty() {
            reason = format!("policy evaluator exited with {}", output.status);
        }
        Ok(PolicyDecision::Deny { reason })
    }

    async fn list_attributes(&self) -> Result<Vec<String>, PolicyError> {
        let output = tokio::process::Command::new(&self.program)
            .arg("-printAttr")
            .arg("-pb")
            .arg(&self.policy_book)
            .output()
            .await?;
        if !output.status.success() {
            return Err(PolicyError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_util;
    use std::os::unix::fs::PermissionsExt;

    /// A policy program allowing chains of at most two certificates.
    fn script(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("policy.sh");
        let body = r#"#!/bin/sh
if [ "$1" = "-printAttr" ]; then
  echo '["role","unit"]'
  exit 0
fi
count=$(grep -c "BEGIN CERTIFICATE" "$2")
if [ "$count" -le 2 ]; then
  exit 0
fi
echo "chain of $count certificates is too long"
exit 1
"#;
        std::fs::write(&path, body).expect("Script written.");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Executable.");
        path
    }

    fn chain_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .expect("Listable.")
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.path().extension().map_or(false, |x| x == "pcn"))
                    .unwrap_or(false)
            })
            .count()
    }

    #[tokio::test]
    async fn command_evaluator() {
        let tmp = tempfile::tempdir().expect("Temporary directory.");
        let dir = tmp.path();
        let evaluator =
            CommandPolicyEvaluator::new(script(dir), dir.join("book.json")).set_scratch_dir(dir);

        let root = test_util::self_signed("Root");
        let ca = test_util::identity("CA1", &root);
        let leaf = test_util::identity("Alice", &ca);

        let short = [ca.cert.clone(), root.cert.clone()];
        assert_eq!(evaluator.evaluate(&short).await.expect("Ran."), PolicyDecision::Allow);

        let long = [leaf.cert, ca.cert, root.cert];
        match evaluator.evaluate(&long).await.expect("Ran.") {
            PolicyDecision::Deny { reason } => assert!(reason.contains("too long")),
            PolicyDecision::Allow => panic!("Long chain must be denied."),
        }
        assert_eq!(
            evaluator.list_attributes().await.expect("Ran."),
            vec!["role".to_string(), "unit".to_string()]
        );
        // Scratch files are cleaned up.
        assert_eq!(chain_files(dir), 0);
    }

    #[tokio::test]
    async fn chain_file_removed_when_program_is_missing() {
        let tmp = tempfile::tempdir().expect("Temporary directory.");
        let dir = tmp.path();
        let evaluator = CommandPolicyEvaluator::new(dir.join("no-such-program"), dir.join("book.json"))
            .set_scratch_dir(dir);
        let root = test_util::self_signed("Root");
        let res = evaluator.evaluate(&[root.cert]).await;
        assert!(matches!(res, Err(PolicyError::Io(_))));
        assert_eq!(chain_files(dir), 0);
    }

    #[tokio::test]
    async fn missing_scratch_dir_is_an_error() {
        let tmp = tempfile::tempdir().expect("Temporary directory.");
        let evaluator = CommandPolicyEvaluator::new(script(tmp.path()), tmp.path().join("book.json"))
            .set_scratch_dir(tmp.path().join("absent"));
        let root = test_util::self_signed("Root");
        assert!(matches!(evaluator.evaluate(&[root.cert]).await, Err(PolicyError::Io(_))));
    }
}
