//! Static validation of a materialized workspace.
//!
//! The pipeline is deliberately shallow: install dependencies when a
//! manifest is present, then syntax-check the first ten script files.
//! Semantic correctness of generated code is out of scope; this gate
//! exists to catch code that cannot even parse.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::Result;
use crate::sandbox::manager::SandboxManager;

/// `npm install` gets a bounded window; failures are recorded, not fatal.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Only this many script files are syntax-checked per run.
const MAX_CHECKED_FILES: usize = 10;
/// Recorded error output is capped to keep iteration errors readable.
const OUTPUT_TAIL: usize = 500;

/// Outcome of one validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub success: bool,
    pub errors: Vec<String>,
}

fn tail(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.char_indices().nth_back(OUTPUT_TAIL - 1) {
        Some((idx, _)) if trimmed.len() > OUTPUT_TAIL => &trimmed[idx..],
        _ => trimmed,
    }
}

impl SandboxManager {
    /// Whether the workspace root carries a package manifest.
    pub async fn has_package_manifest(&self, session_id: &str) -> Result<bool> {
        let result = self
            .exec_in_container(session_id, "test -f package.json", None)
            .await?;
        Ok(result.success)
    }

    /// Run the validation protocol against the session's workspace.
    ///
    /// When `install` is set, `npm install --production` runs first; a
    /// non-zero exit is recorded as an error and validation continues.
    /// Script files are then enumerated in lexicographic order and the
    /// first ten are checked with `node --check`.
    pub async fn run_validation(
        &self,
        session_id: &str,
        install: bool,
    ) -> Result<ValidationReport> {
        let mut errors = Vec::new();

        if install {
            debug!(session = session_id, "installing dependencies");
            let result = self
                .exec_in_container(
                    session_id,
                    "npm install --production",
                    Some(INSTALL_TIMEOUT),
                )
                .await?;
            if !result.success {
                errors.push(format!("npm install failed: {}", tail(&result.output)));
            }
        }

        let listing = self
            .exec_in_container(
                session_id,
                r"find . -type f \( -name '*.js' -o -name '*.ts' \) | sort",
                None,
            )
            .await?;

        let files: Vec<String> = listing
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(MAX_CHECKED_FILES)
            .map(String::from)
            .collect();

        for file in &files {
            let check = self
                .exec_in_container(session_id, &format!("node --check '{file}'"), None)
                .await?;
            if !check.success {
                errors.push(format!("Syntax error in {file}: {}", tail(&check.output)));
            }
        }

        info!(
            session = session_id,
            checked = files.len(),
            errors = errors.len(),
            "validation complete"
        );
        Ok(ValidationReport {
            success: errors.is_empty(),
            errors,
        })
    }
}
