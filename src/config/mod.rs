//! Project-level configuration and on-disk layout.
//!
//! Everything takt persists lives under `<project>/.takt/`:
//!
//! ```text
//! <project>/.takt/
//!   config.yaml        piece/provider defaults
//!   tasks.yaml         durable task records
//!   pieces/*.yaml      piece catalog, loaded by name
//!   runs/<run-id>/     per-run reports, logs, and context snapshots
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{Result, TaktError};

/// Directory name for all takt state inside a project
pub const TAKT_DIR: &str = ".takt";

/// Project defaults loaded from `.takt/config.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaktConfig {
    /// Piece to run when none is given on the command line
    #[serde(default = "default_piece")]
    pub default_piece: String,

    /// Agent provider identifier (e.g. "claude-code")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model override passed to the provider
    #[serde(default)]
    pub model: Option<String>,

    /// Number of concurrent task executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Poll interval for picking up newly added tasks, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Language hint injected into agent instructions
    #[serde(default)]
    pub language: Option<String>,

    /// Permission mode forwarded to the provider
    #[serde(default)]
    pub permission_mode: Option<String>,
}

fn default_piece() -> String {
    "default".to_string()
}

fn default_provider() -> String {
    "claude-code".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for TaktConfig {
    fn default() -> Self {
        Self {
            default_piece: default_piece(),
            provider: default_provider(),
            model: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            language: None,
            permission_mode: None,
        }
    }
}

impl TaktConfig {
    /// Load the project config, falling back to defaults when the file is absent
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = ProjectLayout::new(project_root).config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| TaktError::Config {
            message: format!("failed to parse {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        Ok(config)
    }
}

/// Resolved paths for the `.takt` tree of one project
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.to_path_buf(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    pub fn takt_dir(&self) -> PathBuf {
        self.root.join(TAKT_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.takt_dir().join("config.yaml")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.takt_dir().join("tasks.yaml")
    }

    pub fn pieces_dir(&self) -> PathBuf {
        self.takt_dir().join("pieces")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.takt_dir().join("runs")
    }

    /// Resolve a piece reference: an existing YAML path is used directly,
    /// anything else is looked up as `<pieces>/<name>.yaml`.
    pub fn resolve_piece_path(&self, name_or_path: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(name_or_path);
        if direct.is_file() {
            return Ok(direct);
        }

        for ext in ["yaml", "yml"] {
            let candidate = self.pieces_dir().join(format!("{}.{}", name_or_path, ext));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        Err(TaktError::config(format!(
            "piece '{}' not found (no such file, and no {}/{}.yaml)",
            name_or_path,
            self.pieces_dir().display(),
            name_or_path
        )))
    }

    /// List piece names available in the catalog directory
    pub fn list_piece_names(&self) -> Vec<String> {
        let dir = self.pieces_dir();
        if !dir.is_dir() {
            return Vec::new();
        }

        let mut names: Vec<String> = WalkDir::new(&dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                matches!(
                    e.path().extension().and_then(|x| x.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(String::from)
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Paths for a single piece run under `.takt/runs/<run-id>/`
#[derive(Debug, Clone)]
pub struct RunPaths {
    run_dir: PathBuf,
}

impl RunPaths {
    /// Lay out paths for a run; directories are created on first write.
    pub fn new(layout: &ProjectLayout, run_id: &str) -> Self {
        Self {
            run_dir: layout.runs_dir().join(run_id),
        }
    }

    /// Build run paths rooted at an explicit directory (test support)
    pub fn from_run_dir(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Where Phase 2 report files are written
    pub fn reports_dir(&self) -> PathBuf {
        self.run_dir.join("reports")
    }

    /// Where rotated prior report versions are archived
    pub fn reports_history_dir(&self) -> PathBuf {
        self.run_dir.join("logs").join("reports-history")
    }

    /// Where per-movement output snapshots are written
    pub fn previous_responses_dir(&self) -> PathBuf {
        self.run_dir.join("context").join("previous_responses")
    }
}
