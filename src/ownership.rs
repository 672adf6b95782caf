//! Ownership inference over existing symlinks.
//!
//! Given a link found in the target tree, decides whether it points into a
//! stow directory and, if so, which package owns it. The invocation's own
//! stow directory is recognized by relative-path prefix; any other stow
//! directory is recognized by a `.stow` marker file at its root, found by
//! walking the link destination's path upward one segment at a time.
//! Ownership is always derived from on-disk truth at query time, never
//! cached across queries.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;

/// Marker file identifying a directory as a stow directory.
pub const STOW_DIR_MARKER: &str = ".stow";

/// Sentinel protecting a target subdirectory from modification.
pub const UNSTOWABLE_MARKER: &str = ".nonstow";

/// A symlink destination resolved to its owning stow directory and package.
/// All paths are relative to the target directory root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StowedPath {
    /// Where the link points, relative to the target root.
    pub path: PathBuf,
    /// The stow directory the destination lives under.
    pub stow_dir: PathBuf,
    /// The package subdirectory immediately below the stow directory.
    pub package: String,
}

/// Resolves link destinations to owning packages.
#[derive(Debug)]
pub struct OwnershipTracker {
    target_root: PathBuf,
    stow_path: PathBuf,
}

impl OwnershipTracker {
    /// `target_root` is the absolute target directory; `stow_path` is the
    /// invocation's stow directory relative to it.
    pub fn new(target_root: PathBuf, stow_path: PathBuf) -> Self {
        Self {
            target_root,
            stow_path,
        }
    }

    /// Resolve a symlink at `target_subpath` with value `link_dest` to a
    /// [`StowedPath`], or `None` if the destination is not under any known
    /// stow directory. Absolute destinations are never stow-owned.
    pub fn find_stowed_path(
        &self,
        target_subpath: &Path,
        link_dest: &Path,
    ) -> Result<Option<StowedPath>> {
        if link_dest.is_absolute() {
            return Ok(None);
        }

        let dest_from_target = paths::join_rel(&paths::parent_rel(target_subpath), link_dest);
        tracing::trace!(
            target = %target_subpath.display(),
            dest = %dest_from_target.display(),
            "checking symlink ownership"
        );

        if let Some(package) = self.package_under_own_stow_dir(&dest_from_target) {
            return Ok(Some(StowedPath {
                path: dest_from_target,
                stow_dir: self.stow_path.clone(),
                package,
            }));
        }

        self.find_in_marked_stow_dir(&dest_from_target)
    }

    /// The package owning the link, if any.
    pub fn owning_package(
        &self,
        target_subpath: &Path,
        link_dest: &Path,
    ) -> Result<Option<String>> {
        Ok(self
            .find_stowed_path(target_subpath, link_dest)?
            .map(|stowed| stowed.package))
    }

    /// True if the directory (relative to the target root) carries the
    /// stow-directory marker file.
    pub fn is_marked_stow_dir(&self, dir: &Path) -> bool {
        self.target_root.join(dir).join(STOW_DIR_MARKER).exists()
    }

    /// If the destination lies under this invocation's stow directory, the
    /// first path segment below it names the package.
    fn package_under_own_stow_dir(&self, dest: &Path) -> Option<String> {
        let remaining = dest.strip_prefix(&self.stow_path).ok()?;
        let package = match remaining.components().next()? {
            Component::Normal(name) => name.to_string_lossy().into_owned(),
            _ => return None,
        };
        Some(package)
    }

    /// Walk the destination's ancestors top-down, one segment at a time,
    /// looking for a marked stow directory. Bounded by the segment count;
    /// no recursion.
    fn find_in_marked_stow_dir(&self, dest: &Path) -> Result<Option<StowedPath>> {
        let segments: Vec<Component> = dest.components().collect();
        let mut path_so_far = PathBuf::new();

        for (index, segment) in segments.iter().enumerate() {
            path_so_far.push(segment);
            if !self.is_marked_stow_dir(&path_so_far) {
                continue;
            }

            let Some(Component::Normal(package)) = segments.get(index + 1) else {
                return Err(Error::Internal(format!(
                    "find_stowed_path() called directly on stow dir: {}",
                    dest.display()
                )));
            };

            return Ok(Some(StowedPath {
                path: dest.to_path_buf(),
                stow_dir: path_so_far,
                package: package.to_string_lossy().into_owned(),
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tracker(temp: &TempDir) -> OwnershipTracker {
        OwnershipTracker::new(temp.path().join("target"), PathBuf::from("../stow"))
    }

    #[test]
    fn test_link_into_own_stow_dir() {
        let temp = TempDir::new().unwrap();
        let t = tracker(&temp);

        let stowed = t
            .find_stowed_path(Path::new("bin/vim"), Path::new("../../stow/vim/bin/vim"))
            .unwrap()
            .unwrap();
        assert_eq!(stowed.package, "vim");
        assert_eq!(stowed.stow_dir, PathBuf::from("../stow"));
        assert_eq!(stowed.path, PathBuf::from("../stow/vim/bin/vim"));
    }

    #[test]
    fn test_absolute_destination_is_unowned() {
        let temp = TempDir::new().unwrap();
        let t = tracker(&temp);

        let stowed = t
            .find_stowed_path(Path::new("bin/vim"), Path::new("/usr/bin/vim"))
            .unwrap();
        assert!(stowed.is_none());
    }

    #[test]
    fn test_link_elsewhere_is_unowned() {
        let temp = TempDir::new().unwrap();
        let t = tracker(&temp);

        let stowed = t
            .find_stowed_path(Path::new("bin/vim"), Path::new("../../elsewhere/vim"))
            .unwrap();
        assert!(stowed.is_none());
    }

    #[test]
    fn test_marked_stow_dir_is_recognized() {
        let temp = TempDir::new().unwrap();
        let other = temp.path().join("target/opt/other-stow");
        fs::create_dir_all(other.join("pkg/bin")).unwrap();
        fs::write(other.join(STOW_DIR_MARKER), "").unwrap();
        let t = tracker(&temp);

        let stowed = t
            .find_stowed_path(Path::new("bin/tool"), Path::new("../opt/other-stow/pkg/bin/tool"))
            .unwrap()
            .unwrap();
        assert_eq!(stowed.package, "pkg");
        assert_eq!(stowed.stow_dir, PathBuf::from("opt/other-stow"));
    }

    #[test]
    fn test_destination_at_marked_dir_itself_is_an_internal_error() {
        let temp = TempDir::new().unwrap();
        let other = temp.path().join("target/opt/other-stow");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join(STOW_DIR_MARKER), "").unwrap();
        let t = tracker(&temp);

        let err = t
            .find_stowed_path(Path::new("bin/tool"), Path::new("../opt/other-stow"))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
