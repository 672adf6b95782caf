//! Configuration for stow, unstow and restow runs.
//!
//! A [`Config`] is built once by the caller (the CLI, or a library user),
//! is immutable for the duration of a run, and carries the pre-compiled
//! ignore/defer/override pattern lists. Pattern compilation happens here so
//! that a bad pattern surfaces before planning starts.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Error, Result};

/// Immutable settings for one planning/execution run.
#[derive(Debug, Clone)]
pub struct Config {
    /// The stow directory: holds one subdirectory per package.
    pub dir: PathBuf,
    /// The target directory links are created in. Defaults to the parent
    /// of the stow directory when unset.
    pub target: Option<PathBuf>,
    /// Translate `dot-` prefixed package entries to dotted target names.
    pub dotfiles: bool,
    /// Move pre-existing plain files into the package instead of
    /// reporting a conflict.
    pub adopt: bool,
    /// Never represent a directory with a single folded link; always
    /// create real directories and per-entry links.
    pub no_folding: bool,
    /// Plan everything but execute nothing.
    pub simulate: bool,
    /// Verbosity level requested by the caller. The engine itself emits
    /// `tracing` events; this only drives the caller's subscriber setup.
    pub verbose: u8,
    /// Use the legacy unstow algorithm that scans the target tree instead
    /// of the package tree. Less strict about ownership in corner cases;
    /// preserved as an alternate algorithm, not corrected.
    pub compat: bool,
    /// Extra ignore patterns, matched anywhere up to the end of a
    /// target-relative path (compile with [`Config::compile_ignore`]).
    pub ignore: Vec<Regex>,
    /// Paths matching these yield to an already-installed package.
    pub defer: Vec<Regex>,
    /// Paths matching these may replace another package's link.
    pub overrides: Vec<Regex>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            target: None,
            dotfiles: false,
            adopt: false,
            no_folding: false,
            simulate: false,
            verbose: 0,
            compat: false,
            ignore: Vec::new(),
            defer: Vec::new(),
            overrides: Vec::new(),
        }
    }
}

impl Config {
    /// A default configuration rooted at the given stow directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// The effective target directory: explicit target, or the parent of
    /// the stow directory.
    pub fn resolved_target(&self) -> PathBuf {
        match &self.target {
            Some(target) => target.clone(),
            None => match self.dir.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        }
    }

    /// Compile a user-supplied ignore pattern. Anchored at the end of the
    /// path so `\.txt` ignores every path ending in `.txt`.
    pub fn compile_ignore(pattern: &str) -> Result<Regex> {
        compile(pattern, |p| format!(r"({p})\z"))
    }

    /// Compile a defer pattern, anchored at the start of the path.
    pub fn compile_defer(pattern: &str) -> Result<Regex> {
        compile(pattern, |p| format!(r"\A({p})"))
    }

    /// Compile an override pattern, anchored at the start of the path.
    pub fn compile_override(pattern: &str) -> Result<Regex> {
        compile(pattern, |p| format!(r"\A({p})"))
    }
}

fn compile(pattern: &str, anchor: impl Fn(&str) -> String) -> Result<Regex> {
    Regex::new(&anchor(pattern)).map_err(|source| Error::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// True if the path matches any pattern in the list.
pub(crate) fn matches_any(patterns: &[Regex], path: &Path) -> bool {
    let text = path.to_string_lossy();
    patterns.iter().any(|re| re.is_match(&text))
}
