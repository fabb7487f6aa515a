//! Workspace configuration and the per-job context threaded through every
//! pipeline stage.
//!
//! A workspace YAML file bundles the entity registry, the tenant rules and
//! import settings:
//!
//! ```yaml
//! settings:
//!   dedup_history: 5
//! schema:
//!   priority: [account, transaction, entry]
//!   entities: [...]
//! rules:
//!   transformations: [...]
//!   substitutions: [...]
//!   integrations: [...]
//! ```

use std::{fs::File, io::Read, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{rules::RuleBook, schema::SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Full execution, always rolled back.
    Preview,
    /// All-or-nothing execution.
    Commit,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Preview => "preview",
            ImportMode::Commit => "commit",
        }
    }
}

/// Who is importing, for which tenant, under which job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportContext {
    pub company: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub mode: ImportMode,
}

impl ImportContext {
    pub fn new(company: &str, user: &str, mode: ImportMode) -> Self {
        Self {
            company: company.to_string(),
            user: user.to_string(),
            job_id: None,
            mode,
        }
    }

    pub fn with_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }
}

const fn default_dedup_history() -> usize {
    5
}

const fn default_sample_hash_limit() -> usize {
    1_000
}

const fn default_known_token_preview() -> usize {
    10
}

const fn default_progress_every() -> usize {
    100
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Prior snapshots compared for near-duplicate detection.
    #[serde(default = "default_dedup_history")]
    pub dedup_history: usize,
    /// Row hashes kept on a snapshot.
    #[serde(default = "default_sample_hash_limit")]
    pub sample_hash_limit: usize,
    /// Known tokens listed in a resolution error.
    #[serde(default = "default_known_token_preview")]
    pub known_token_preview: usize,
    /// Rows between job progress updates.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_true")]
    pub substitution_cache: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            dedup_history: default_dedup_history(),
            sample_hash_limit: default_sample_hash_limit(),
            known_token_preview: default_known_token_preview(),
            progress_every: default_progress_every(),
            substitution_cache: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub settings: ImportSettings,
    #[serde(default)]
    pub schema: SchemaRegistry,
    #[serde(default)]
    pub rules: RuleBook,
}

impl Workspace {
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_context(|| format!("Opening workspace file {path:?}"))?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .with_context(|| format!("Reading workspace file {path:?}"))?;
        Self::from_yaml_str(&raw).with_context(|| format!("Loading workspace {path:?}"))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let workspace: Workspace = serde_yaml::from_str(raw).context("Parsing workspace YAML")?;
        workspace.schema.validate().context("Validating entity schema")?;
        workspace.rules.validate().context("Validating rules")?;
        Ok(workspace)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Serializing workspace to YAML")
    }
}
