//! Ignore-pattern matching for package traversal.
//!
//! Three pattern sources feed each decision: patterns given directly in the
//! configuration (always consulted), and exactly one file-sourced list: the
//! package-local ignore file if present, else the global ignore file at the
//! stow directory root, else a built-in default list. A present file fully
//! replaces the lower-precedence sources.
//!
//! File patterns come in two flavours. A pattern containing `/` is matched
//! against the full target-relative path (prefixed with `/`, so `^/README`
//! anchors at the package root); a pattern without `/` is matched against
//! individual path segments. Ignoring a directory excludes its entire
//! subtree, because the planner never descends into an ignored entry.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::config;
use crate::error::{Error, Result};
use crate::paths;

/// Per-package ignore file name. Always self-ignored.
pub const LOCAL_IGNORE_FILE: &str = ".stow-local-ignore";

/// Ignore file at the stow directory root, shared by all packages.
pub const GLOBAL_IGNORE_FILE: &str = ".stow-global-ignore";

const DEFAULT_IGNORE_LIST: &str = r"
# Comments and blank lines are allowed.

RCS
.+,v

CVS
\.\#.+       # CVS conflict files / emacs lock files
\.cvsignore

\.svn
_darcs
\.hg

\.git
\.gitignore
\.gitmodules

.+~          # emacs backup files
\#.*\#       # emacs autosave files

^/README.*
^/LICENSE.*
^/COPYING
";

lazy_static! {
    static ref TRAILING_COMMENT: Regex =
        Regex::new(r"\s+#.+").expect("trailing-comment pattern compiles");
    static ref DEFAULT_PATTERNS: IgnorePatterns = {
        let lines = parse_ignore_lines(DEFAULT_IGNORE_LIST);
        compile_ignore_patterns(&lines).expect("built-in ignore list compiles")
    };
}

/// Compiled form of one ignore list.
#[derive(Debug, Clone, Default)]
pub struct IgnorePatterns {
    /// Matches full relative paths; compiled from patterns containing `/`.
    path: Option<Regex>,
    /// Matches single path segments; compiled from the rest.
    segment: Option<Regex>,
}

/// Evaluates ignore decisions for target-relative paths, caching the
/// compiled per-package file lists for the duration of a run.
#[derive(Debug)]
pub struct IgnoreMatcher {
    target_root: PathBuf,
    cli_patterns: Vec<Regex>,
    cache: RefCell<HashMap<PathBuf, IgnorePatterns>>,
}

impl IgnoreMatcher {
    /// `target_root` is the absolute target directory; `cli_patterns` are
    /// the already-compiled patterns from the configuration.
    pub fn new(target_root: PathBuf, cli_patterns: Vec<Regex>) -> Self {
        Self {
            target_root,
            cli_patterns,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Should the given target-relative path be excluded from traversal?
    ///
    /// `package_dir` is the package root relative to the target directory
    /// (e.g. `../stow/vim`); it locates the package-local ignore file.
    pub fn should_ignore(&self, package_dir: &Path, target: &Path) -> Result<bool> {
        if target.as_os_str().is_empty() {
            return Err(Error::Internal(
                "should_ignore() called with empty target".to_string(),
            ));
        }

        if config::matches_any(&self.cli_patterns, target) {
            tracing::debug!(path = %target.display(), "ignoring path due to --ignore pattern");
            return Ok(true);
        }

        let patterns = self.patterns_for(package_dir)?;

        let text = target.to_string_lossy();
        if let Some(re) = &patterns.path
            && re.is_match(&format!("/{text}"))
        {
            tracing::debug!(path = %target.display(), "ignoring path");
            return Ok(true);
        }

        let basename = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(re) = &patterns.segment
            && re.is_match(&basename)
        {
            tracing::debug!(segment = %basename, "ignoring path segment");
            return Ok(true);
        }

        Ok(false)
    }

    /// The compiled file-sourced list for a package: local file, else
    /// global file, else the built-in defaults.
    fn patterns_for(&self, package_dir: &Path) -> Result<IgnorePatterns> {
        if let Some(cached) = self.cache.borrow().get(package_dir) {
            return Ok(cached.clone());
        }

        let local = self.target_root.join(package_dir).join(LOCAL_IGNORE_FILE);
        let global = self
            .target_root
            .join(paths::parent_rel(package_dir))
            .join(GLOBAL_IGNORE_FILE);

        let mut patterns = None;
        for file in [&local, &global] {
            if file.exists() {
                tracing::trace!(file = %file.display(), "using ignore file");
                patterns = Some(read_ignore_file(file)?);
                break;
            }
        }
        let patterns = match patterns {
            Some(patterns) => patterns,
            None => {
                tracing::trace!("using built-in ignore list");
                DEFAULT_PATTERNS.clone()
            }
        };

        self.cache
            .borrow_mut()
            .insert(package_dir.to_path_buf(), patterns.clone());
        Ok(patterns)
    }
}

/// Parse and compile an ignore file. An unreadable file yields an empty
/// list rather than an error, matching the behaviour of a missing file.
fn read_ignore_file(path: &Path) -> Result<IgnorePatterns> {
    match fs::read_to_string(path) {
        Ok(content) => compile_ignore_patterns(&parse_ignore_lines(&content)),
        Err(_) => Ok(IgnorePatterns::default()),
    }
}

fn parse_ignore_lines(content: &str) -> BTreeSet<String> {
    let mut patterns = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = TRAILING_COMMENT.replace(line, "");
        patterns.insert(line.replace(r"\#", "#"));
    }
    // The local ignore file never stows itself.
    patterns.insert(format!("^/{}$", regex::escape(LOCAL_IGNORE_FILE)));
    patterns
}

fn compile_ignore_patterns(patterns: &BTreeSet<String>) -> Result<IgnorePatterns> {
    let (path_patterns, segment_patterns): (Vec<&String>, Vec<&String>) =
        patterns.iter().partition(|p| p.contains('/'));

    let segment = combine(&segment_patterns, "^({})$")?;
    let path = combine(&path_patterns, "(^|/)({})(/|$)")?;

    Ok(IgnorePatterns { path, segment })
}

fn combine(patterns: &[&String], template: &str) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternation = patterns
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join("|");
    let combined = template.replacen("{}", &alternation, 1);
    Regex::new(&combined)
        .map(Some)
        .map_err(|source| Error::Pattern {
            pattern: alternation,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn matcher(target: &Path) -> IgnoreMatcher {
        IgnoreMatcher::new(target.to_path_buf(), Vec::new())
    }

    #[test]
    fn test_default_list_ignores_vcs_metadata() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("stow/pkg")).unwrap();
        let m = matcher(temp.path());

        let pkg = Path::new("stow/pkg");
        assert!(m.should_ignore(pkg, Path::new(".git")).unwrap());
        assert!(m.should_ignore(pkg, Path::new("src/.svn")).unwrap());
        assert!(m.should_ignore(pkg, Path::new("notes.txt~")).unwrap());
        assert!(!m.should_ignore(pkg, Path::new("bin/vim")).unwrap());
    }

    #[test]
    fn test_default_list_anchors_readme_at_package_root() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("stow/pkg")).unwrap();
        let m = matcher(temp.path());

        let pkg = Path::new("stow/pkg");
        assert!(m.should_ignore(pkg, Path::new("README.md")).unwrap());
        assert!(!m.should_ignore(pkg, Path::new("docs/README.md")).unwrap());
    }

    #[test]
    fn test_local_ignore_file_replaces_defaults() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("stow/pkg");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(
            pkg_dir.join(LOCAL_IGNORE_FILE),
            "secret   # keep out of the target\n^/build/.+\n",
        )
        .unwrap();
        let m = matcher(temp.path());

        let pkg = Path::new("stow/pkg");
        assert!(m.should_ignore(pkg, Path::new("etc/secret")).unwrap());
        assert!(m.should_ignore(pkg, Path::new("build/out")).unwrap());
        // Defaults no longer apply once a local file exists.
        assert!(!m.should_ignore(pkg, Path::new(".git")).unwrap());
        // The ignore file itself is always ignored.
        assert!(m.should_ignore(pkg, Path::new(LOCAL_IGNORE_FILE)).unwrap());
    }

    #[test]
    fn test_multiple_patterns_combine_into_one_alternation() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("stow/pkg");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(
            pkg_dir.join(LOCAL_IGNORE_FILE),
            "secret\ndraft\n^/build/.+\n^/dist/.+\n",
        )
        .unwrap();
        let m = matcher(temp.path());

        let pkg = Path::new("stow/pkg");
        assert!(m.should_ignore(pkg, Path::new("etc/secret")).unwrap());
        assert!(m.should_ignore(pkg, Path::new("doc/draft")).unwrap());
        assert!(m.should_ignore(pkg, Path::new("build/out")).unwrap());
        assert!(m.should_ignore(pkg, Path::new("dist/pkg.tar")).unwrap());
        assert!(!m.should_ignore(pkg, Path::new("bin/vim")).unwrap());
    }

    #[test]
    fn test_global_ignore_file_at_stow_root() {
        let temp = TempDir::new().unwrap();
        let stow = temp.path().join("stow");
        fs::create_dir_all(stow.join("pkg")).unwrap();
        fs::write(stow.join(GLOBAL_IGNORE_FILE), "scratch\n").unwrap();
        let m = matcher(temp.path());

        let pkg = Path::new("stow/pkg");
        assert!(m.should_ignore(pkg, Path::new("lib/scratch")).unwrap());
        assert!(!m.should_ignore(pkg, Path::new(".git")).unwrap());
    }

    #[test]
    fn test_cli_patterns_apply_alongside_files() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("stow/pkg")).unwrap();
        let m = IgnoreMatcher::new(
            temp.path().to_path_buf(),
            vec![crate::Config::compile_ignore(r"\.log").unwrap()],
        );

        let pkg = Path::new("stow/pkg");
        assert!(m.should_ignore(pkg, Path::new("var/run.log")).unwrap());
        assert!(m.should_ignore(pkg, Path::new(".git")).unwrap());
    }

    #[test]
    fn test_empty_target_is_an_internal_error() {
        let temp = TempDir::new().unwrap();
        let m = matcher(temp.path());
        let err = m.should_ignore(Path::new("stow/pkg"), Path::new("")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
