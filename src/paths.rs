//! Lexical path manipulation for link planning.
//!
//! Planned link values are relative paths that usually do not exist yet, so
//! everything here works on the path text alone and never touches the
//! filesystem. Paths handled by the planner are kept relative to the target
//! directory root throughout.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.` segments, collapse `a/b/../c` to
/// `a/c`, and keep leading `..` segments intact. An empty relative result
/// becomes `.` so it survives later joins.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            Component::RootDir | Component::Prefix(_) => {
                out.clear();
                out.push(comp);
            }
            Component::Normal(_) => out.push(comp),
        }
    }

    let joined: PathBuf = out.iter().collect();
    if joined.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        joined
    }
}

/// Join two relative paths with normalization. A base of `.` or the empty
/// path contributes nothing; an absolute `rest` replaces the base entirely.
pub fn join_rel(base: &Path, rest: &Path) -> PathBuf {
    if rest.is_absolute() {
        return normalize(rest);
    }
    if base.as_os_str().is_empty() || base == Path::new(".") {
        return normalize(rest);
    }
    normalize(&base.join(rest))
}

/// Join three relative path fragments.
pub fn join_rel3(a: &Path, b: impl AsRef<Path>, c: &Path) -> PathBuf {
    join_rel(&join_rel(a, b.as_ref()), c)
}

/// The parent of a relative path, or the empty path at the top level.
pub fn parent_rel(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    normalized
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// A relative path made of `level` `..` segments.
pub fn updirs(level: usize) -> PathBuf {
    let mut out = PathBuf::new();
    for _ in 0..level {
        out.push("..");
    }
    out
}

/// How many directories deep a package subpath is: `bin` is level 0,
/// `bin/vim` is level 1. Link values gain one `..` per level.
pub fn level_of(pkg_subpath: &Path) -> usize {
    pkg_subpath.components().count().saturating_sub(1)
}

/// Strip a single leading `..` segment, mirroring how a child link value
/// (relative to the directory containing it) becomes a value relative to
/// that directory's own parent.
pub fn strip_one_updir(path: &Path) -> PathBuf {
    let mut comps = path.components();
    match comps.next() {
        Some(Component::ParentDir) => comps.as_path().to_path_buf(),
        _ => path.to_path_buf(),
    }
}

/// Translate a `dot-` prefixed package entry name to its dotted target
/// name: `dot-bashrc` becomes `.bashrc`. Names like `dot-` or `dot-.foo`
/// are left alone.
pub fn adjust_dotfile(name: &str) -> String {
    match name.strip_prefix("dot-") {
        Some(rest) if !rest.is_empty() && !rest.starts_with('.') => format!(".{rest}"),
        _ => name.to_string(),
    }
}

/// The reverse translation, used by the legacy target-tree unstow scan:
/// `.bashrc` becomes `dot-bashrc`.
pub fn unadjust_dotfile(name: &str) -> String {
    if name == "." || name == ".." {
        return name.to_string();
    }
    match name.strip_prefix('.') {
        Some(rest) => format!("dot-{rest}"),
        None => name.to_string(),
    }
}
