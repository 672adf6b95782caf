//! Package tree walking and operation planning.
//!
//! The [`Planner`] walks each requested package, compares the package tree
//! with the current and planned state of the target tree, and emits
//! operations into a [`TaskLedger`] or conflict messages into a per-package
//! registry. Nothing touches the filesystem until [`Planner::execute`]
//! runs, and execution is withheld for the whole batch if any package has
//! a conflict.
//!
//! All planning paths are relative to the target directory root; the
//! absolute target root is joined back in only at filesystem boundaries.
//! Link values are relative so a stowed tree survives being mounted at a
//! different absolute location.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor;
use crate::ignore::IgnoreMatcher;
use crate::ownership::OwnershipTracker;
use crate::paths;
use crate::task::{StowResult, TaskAction, TaskLedger};

/// Plans stow and unstow operations for a batch of packages and executes
/// them once the whole batch is known to be conflict-free.
///
/// One planner owns one [`TaskLedger`] and one conflict registry, scoped
/// to a single run. Restow shares a single planner across the unstow and
/// stow phases so that reverting operation pairs cancel instead of
/// churning the filesystem.
pub struct Planner {
    config: Config,
    /// Absolute, canonicalized target directory.
    target_root: PathBuf,
    /// The stow directory relative to the target root.
    stow_path: PathBuf,
    ledger: TaskLedger,
    ignore: IgnoreMatcher,
    ownership: OwnershipTracker,
    conflicts: BTreeMap<String, Vec<String>>,
}

impl Planner {
    pub fn new(config: &Config) -> Result<Self> {
        let stow_abs = fs::canonicalize(&config.dir).map_err(|e| {
            Error::Input(format!(
                "cannot use stow directory {}: {e}",
                config.dir.display()
            ))
        })?;
        let target = config.resolved_target();
        let target_abs = fs::canonicalize(&target).map_err(|e| {
            Error::Input(format!("cannot use target directory {}: {e}", target.display()))
        })?;
        if !stow_abs.is_dir() {
            return Err(Error::Input(format!(
                "stow directory {} is not a directory",
                stow_abs.display()
            )));
        }
        if !target_abs.is_dir() {
            return Err(Error::Input(format!(
                "target directory {} is not a directory",
                target_abs.display()
            )));
        }

        let stow_path = pathdiff::diff_paths(&stow_abs, &target_abs).ok_or_else(|| {
            Error::Input(format!(
                "cannot compute path from target {} to stow directory {}",
                target_abs.display(),
                stow_abs.display()
            ))
        })?;
        tracing::debug!(stow = %stow_abs.display(), "stow dir");
        tracing::debug!(
            target = %target_abs.display(),
            relative = %stow_path.display(),
            "stow dir path relative to target"
        );

        Ok(Self {
            config: config.clone(),
            ledger: TaskLedger::new(target_abs.clone()),
            ignore: IgnoreMatcher::new(target_abs.clone(), config.ignore.clone()),
            ownership: OwnershipTracker::new(target_abs.clone(), stow_path.clone()),
            target_root: target_abs,
            stow_path,
            conflicts: BTreeMap::new(),
        })
    }

    /// Plan installing the given packages into the target tree.
    pub fn plan_stow(&mut self, packages: &[&str]) -> Result<()> {
        for &package in packages {
            self.require_package(package)?;
            tracing::info!(package, "planning stow");
            let stow_path = self.stow_path.clone();
            self.stow_contents(&stow_path, package, Path::new("."), Path::new("."))?;
        }
        Ok(())
    }

    /// Plan removing the given packages' links from the target tree.
    pub fn plan_unstow(&mut self, packages: &[&str]) -> Result<()> {
        for &package in packages {
            self.require_package(package)?;
            tracing::info!(package, "planning unstow");
            self.unstow_contents(package, Path::new("."), Path::new("."))?;
        }
        Ok(())
    }

    /// Execute the plan, or report conflicts without touching anything.
    ///
    /// In simulate mode the returned task list is what *would* have been
    /// performed.
    pub fn execute(self) -> Result<StowResult> {
        if !self.conflicts.is_empty() {
            return Ok(StowResult {
                success: false,
                conflicts: self.conflicts,
                tasks: Vec::new(),
            });
        }

        let tasks = self.ledger.into_tasks();
        if self.config.simulate {
            tracing::info!("simulation mode, not executing {} task(s)", tasks.len());
        } else {
            executor::process_tasks(&self.target_root, &tasks)?;
        }

        Ok(StowResult {
            success: true,
            conflicts: BTreeMap::new(),
            tasks,
        })
    }

    fn require_package(&self, package: &str) -> Result<()> {
        let pkg_path = paths::join_rel(&self.stow_path, Path::new(package));
        if !self.target_root.join(&pkg_path).is_dir() {
            return Err(Error::Input(format!(
                "the stow directory {} does not contain package {package}",
                self.stow_path.display()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stow planning
    // ------------------------------------------------------------------

    /// Plan stowing every entry of a package subdirectory into the
    /// corresponding target subdirectory. Mutually recursive with
    /// [`Self::stow_node`].
    ///
    /// `stow_path` is passed explicitly because unfolding re-plans the
    /// previous owner's contents, which may live under a different
    /// (marked) stow directory.
    fn stow_contents(
        &mut self,
        stow_path: &Path,
        package: &str,
        pkg_subdir: &Path,
        target_subdir: &Path,
    ) -> Result<()> {
        if self.should_skip_target(pkg_subdir) {
            return Ok(());
        }

        tracing::debug!(
            stow = %stow_path.display(),
            package,
            subdir = %pkg_subdir.display(),
            target = %target_subdir.display(),
            "stowing contents"
        );

        let pkg_path = paths::join_rel3(stow_path, package, pkg_subdir);
        if !self.ledger.is_a_node(target_subdir)? {
            return Err(Error::Internal(format!(
                "stowing into a target that is not a current or planned node: {}",
                target_subdir.display()
            )));
        }

        let package_dir = paths::join_rel(stow_path, Path::new(package));
        for node in list_dir(&self.target_root.join(&pkg_path))? {
            let package_node_path = paths::join_rel(pkg_subdir, Path::new(&node));
            let mut target_node = node.clone();
            let mut target_node_path = paths::join_rel(target_subdir, Path::new(&target_node));

            if self.ignore.should_ignore(&package_dir, &target_node_path)? {
                continue;
            }

            if self.config.dotfiles {
                let adjusted = paths::adjust_dotfile(&node);
                if adjusted != node {
                    tracing::debug!("adjusting {node} => {adjusted}");
                    target_node = adjusted;
                    target_node_path = paths::join_rel(target_subdir, Path::new(&target_node));
                }
            }

            self.stow_node(stow_path, package, &package_node_path, &target_node_path)?;
        }
        Ok(())
    }

    /// Plan stowing a single package entry at the given target path.
    fn stow_node(
        &mut self,
        stow_path: &Path,
        package: &str,
        pkg_subpath: &Path,
        target_subpath: &Path,
    ) -> Result<()> {
        tracing::debug!(
            stow = %stow_path.display(),
            package,
            entry = %pkg_subpath.display(),
            "stowing entry"
        );

        let pkg_path = paths::join_rel3(stow_path, package, pkg_subpath);
        let pkg_abs = self.target_root.join(&pkg_path);

        // Absolute symlinks inside a package cannot be unstowed later, so
        // they are refused up front.
        if pkg_abs.is_symlink() {
            let dest = fs::read_link(&pkg_abs).map_err(|e| {
                Error::io(format!("could not read link: {} ({e})", pkg_path.display()), e)
            })?;
            if dest.is_absolute() {
                self.record_conflict(
                    package,
                    format!(
                        "source is an absolute symlink {} => {}",
                        pkg_path.display(),
                        dest.display()
                    ),
                );
                return Ok(());
            }
        }

        // The link value gains one `..` for every directory level below
        // the target root.
        let level = paths::level_of(pkg_subpath);
        let link_dest = paths::join_rel(&paths::updirs(level), &pkg_path);
        tracing::trace!(dest = %link_dest.display(), "link destination");

        if self.ledger.is_a_link(target_subpath)? {
            self.stow_node_for_existing_link(package, pkg_subpath, target_subpath, &link_dest)
        } else if self.ledger.is_a_node(target_subpath)? {
            self.stow_node_for_existing_node(
                package,
                pkg_subpath,
                target_subpath,
                &pkg_path,
                &link_dest,
            )
        } else if self.config.no_folding && pkg_abs.is_dir() && !pkg_abs.is_symlink() {
            self.ledger.mkdir(target_subpath)?;
            let own_stow_path = self.stow_path.clone();
            self.stow_contents(&own_stow_path, package, pkg_subpath, target_subpath)
        } else {
            self.ledger.link(&link_dest, target_subpath)
        }
    }

    /// The target is already a (current or planned) symlink.
    fn stow_node_for_existing_link(
        &mut self,
        package: &str,
        pkg_subpath: &Path,
        target_subpath: &Path,
        link_dest: &Path,
    ) -> Result<()> {
        let existing_dest = self.ledger.read_a_link(target_subpath)?;
        tracing::trace!(
            target = %target_subpath.display(),
            dest = %existing_dest.display(),
            "evaluating existing link"
        );

        let Some(stowed) = self
            .ownership
            .find_stowed_path(target_subpath, &existing_dest)?
        else {
            self.record_conflict(
                package,
                format!(
                    "existing target is not owned by stow: {}",
                    target_subpath.display()
                ),
            );
            return Ok(());
        };

        if !self.ledger.is_a_node(&stowed.path)? {
            // The existing link is dangling; replace it.
            tracing::debug!(target = %target_subpath.display(), "replacing invalid link");
            self.ledger.unlink(target_subpath)?;
            return self.ledger.link(link_dest, target_subpath);
        }

        if existing_dest == *link_dest {
            tracing::debug!(
                target = %target_subpath.display(),
                "skipping, already points at the right place"
            );
            return Ok(());
        }

        if self.should_defer(target_subpath) {
            tracing::debug!(target = %target_subpath.display(), "deferring installation");
            return Ok(());
        }

        if self.should_override(target_subpath) {
            tracing::debug!(target = %target_subpath.display(), "overriding installation");
            self.ledger.unlink(target_subpath)?;
            return self.ledger.link(link_dest, target_subpath);
        }

        let target_parent = paths::parent_rel(target_subpath);
        let existing_points_at_dir = self
            .ledger
            .is_a_dir(&paths::join_rel(&target_parent, &existing_dest))?;
        let new_points_at_dir = self
            .ledger
            .is_a_dir(&paths::join_rel(&target_parent, link_dest))?;

        if existing_points_at_dir && new_points_at_dir {
            // Both packages provide a directory here: unfold the existing
            // folded link into a real directory and re-plan both packages'
            // contributions into it.
            tracing::debug!(
                target = %target_subpath.display(),
                owner = %stowed.package,
                "unfolding"
            );
            self.ledger.unlink(target_subpath)?;
            self.ledger.mkdir(target_subpath)?;
            let owner_stow_dir = stowed.stow_dir.clone();
            let owner_package = stowed.package.clone();
            self.stow_contents(&owner_stow_dir, &owner_package, pkg_subpath, target_subpath)?;
            let own_stow_path = self.stow_path.clone();
            return self.stow_contents(&own_stow_path, package, pkg_subpath, target_subpath);
        }

        self.record_conflict(
            package,
            format!(
                "existing target is stowed to a different package: {} => {}",
                target_subpath.display(),
                existing_dest.display()
            ),
        );
        Ok(())
    }

    /// The target exists but is not a symlink.
    fn stow_node_for_existing_node(
        &mut self,
        package: &str,
        pkg_subpath: &Path,
        target_subpath: &Path,
        pkg_path: &Path,
        link_dest: &Path,
    ) -> Result<()> {
        tracing::trace!(target = %target_subpath.display(), "evaluating existing node");
        let pkg_is_dir = self.target_root.join(pkg_path).is_dir();

        if self.ledger.is_a_dir(target_subpath)? {
            if !pkg_is_dir {
                self.record_conflict(
                    package,
                    format!(
                        "cannot stow non-directory {} over existing directory target {}",
                        pkg_path.display(),
                        target_subpath.display()
                    ),
                );
                return Ok(());
            }
            let own_stow_path = self.stow_path.clone();
            return self.stow_contents(&own_stow_path, package, pkg_subpath, target_subpath);
        }

        if self.config.adopt {
            if pkg_is_dir {
                self.record_conflict(
                    package,
                    format!(
                        "cannot stow directory {} over existing non-directory target {}",
                        pkg_path.display(),
                        target_subpath.display()
                    ),
                );
                return Ok(());
            }
            self.ledger.mv(target_subpath, pkg_path)?;
            return self.ledger.link(link_dest, target_subpath);
        }

        self.record_conflict(
            package,
            format!(
                "cannot stow {} over existing target {} since neither a link nor a directory and --adopt not specified",
                pkg_path.display(),
                target_subpath.display()
            ),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unstow planning
    // ------------------------------------------------------------------

    /// Plan unstowing every entry of a package subdirectory. The standard
    /// algorithm traverses the package tree; compat mode traverses the
    /// target tree instead, the way historical versions did, which also
    /// catches links whose package entry no longer exists.
    fn unstow_contents(
        &mut self,
        package: &str,
        pkg_subdir: &Path,
        target_subdir: &Path,
    ) -> Result<()> {
        if self.should_skip_target(target_subdir) {
            return Ok(());
        }

        tracing::debug!(
            package,
            subdir = %pkg_subdir.display(),
            target = %target_subdir.display(),
            compat = self.config.compat,
            "unstowing contents"
        );

        let pkg_path = paths::join_rel3(&self.stow_path, package, pkg_subdir);

        if self.config.compat {
            // Traversing the target tree: the corresponding package
            // subdirectory need not exist.
            if !self.target_root.join(target_subdir).is_dir() {
                return Err(Error::Internal(format!(
                    "unstowing contents of a non-directory target: {}",
                    target_subdir.display()
                )));
            }
        } else {
            if !self.target_root.join(&pkg_path).is_dir() {
                return Err(Error::Internal(format!(
                    "unstowing contents of a non-directory package path: {}",
                    pkg_path.display()
                )));
            }
            if !self.ledger.is_a_node(target_subdir)? {
                return Err(Error::Internal(format!(
                    "unstowing contents of an invalid target: {}",
                    target_subdir.display()
                )));
            }
        }

        let dir_to_read = if self.config.compat {
            self.target_root.join(target_subdir)
        } else {
            self.target_root.join(&pkg_path)
        };
        let package_dir = paths::join_rel(&self.stow_path, Path::new(package));

        for node in list_dir(&dir_to_read)? {
            let mut package_node = node.clone();
            let mut target_node = node.clone();
            let mut target_node_path = paths::join_rel(target_subdir, Path::new(&target_node));

            if self.ignore.should_ignore(&package_dir, &target_node_path)? {
                continue;
            }

            if self.config.dotfiles {
                if self.config.compat {
                    // Target names are dotted; map back to the package's
                    // `dot-` form.
                    let adjusted = paths::unadjust_dotfile(&node);
                    if adjusted != node {
                        tracing::debug!("reverse adjusting {node} => {adjusted}");
                        package_node = adjusted;
                    }
                } else {
                    let adjusted = paths::adjust_dotfile(&node);
                    if adjusted != node {
                        tracing::debug!("adjusting {node} => {adjusted}");
                        target_node = adjusted;
                        target_node_path =
                            paths::join_rel(target_subdir, Path::new(&target_node));
                    }
                }
            }

            let package_node_path = paths::join_rel(pkg_subdir, Path::new(&package_node));
            self.unstow_node(package, &package_node_path, &target_node_path)?;
        }

        if !self.config.compat && self.target_root.join(target_subdir).is_dir() {
            self.cleanup_invalid_links(target_subdir)?;
        }
        Ok(())
    }

    fn unstow_node(
        &mut self,
        package: &str,
        pkg_subpath: &Path,
        target_subpath: &Path,
    ) -> Result<()> {
        tracing::debug!(target = %target_subpath.display(), "unstowing entry");

        if self.ledger.is_a_link(target_subpath)? {
            return self.unstow_link_node(package, pkg_subpath, target_subpath);
        }

        if self.target_root.join(target_subpath).is_dir() {
            self.unstow_contents(package, pkg_subpath, target_subpath)?;
            // Removing this package's links may have left the directory
            // holding only one other package's links, so try to fold it.
            if let Some(parent_in_pkg) = self.foldable(target_subpath)? {
                self.fold_tree(target_subpath, &parent_in_pkg)?;
            }
            return Ok(());
        }

        if self.target_root.join(target_subpath).exists() {
            tracing::debug!(
                target = %target_subpath.display(),
                "doesn't need to be unstowed"
            );
        } else {
            tracing::debug!(
                target = %target_subpath.display(),
                "did not exist to be unstowed"
            );
        }
        Ok(())
    }

    fn unstow_link_node(
        &mut self,
        package: &str,
        pkg_subpath: &Path,
        target_subpath: &Path,
    ) -> Result<()> {
        let link_dest = self.ledger.read_a_link(target_subpath)?;

        if link_dest.is_absolute() {
            tracing::warn!(
                "ignoring an absolute symlink: {} => {}",
                target_subpath.display(),
                link_dest.display()
            );
            return Ok(());
        }

        let Some(stowed) = self.ownership.find_stowed_path(target_subpath, &link_dest)? else {
            // The user is unstowing, so a foreign link that would conflict
            // with stowing is simply left alone here.
            tracing::trace!(
                target = %target_subpath.display(),
                dest = %link_dest.display(),
                "ignoring unowned link"
            );
            return Ok(());
        };

        let pkg_path = paths::join_rel3(&self.stow_path, package, pkg_subpath);

        if self.target_root.join(&stowed.path).exists() {
            if stowed.path == pkg_path {
                self.ledger.unlink(target_subpath)?;
            } else {
                tracing::trace!(
                    target = %target_subpath.display(),
                    dest = %link_dest.display(),
                    "ignoring link owned by another package"
                );
            }
        } else {
            tracing::debug!(
                dest = %stowed.path.display(),
                "removing invalid link into a stow directory"
            );
            self.ledger.unlink(target_subpath)?;
        }
        Ok(())
    }

    /// Remove owned links whose destinations no longer exist. Dangling
    /// leftovers would otherwise block folding.
    fn cleanup_invalid_links(&mut self, dir: &Path) -> Result<()> {
        tracing::debug!(dir = %dir.display(), "cleaning up invalid links");
        let dir_abs = self.target_root.join(dir);
        if !dir_abs.is_dir() {
            return Err(Error::Internal(format!(
                "cleaning up links in a non-directory: {}",
                dir.display()
            )));
        }

        for node in list_dir(&dir_abs)? {
            let node_path = paths::join_rel(dir, Path::new(&node));
            let node_abs = self.target_root.join(&node_path);
            if !node_abs.is_symlink() {
                continue;
            }

            if let Some(task) = self.ledger.link_task(&node_path) {
                if task.action != TaskAction::Remove {
                    tracing::warn!(
                        "unexpected action {:?} scheduled for {}; skipping clean-up",
                        task.action,
                        node_path.display()
                    );
                }
                continue;
            }

            let link_dest = fs::read_link(&node_abs).map_err(|e| {
                Error::io(format!("could not read link: {} ({e})", node_path.display()), e)
            })?;
            let dest_path = paths::join_rel(dir, &link_dest);
            if self.target_root.join(&dest_path).exists() {
                continue;
            }

            if let Some(owner) = self.ownership.owning_package(&node_path, &link_dest)? {
                tracing::debug!(
                    owner,
                    "removing dangling link {} => {}",
                    node_path.display(),
                    dest_path.display()
                );
                self.ledger.unlink(&node_path)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Folding
    // ------------------------------------------------------------------

    /// A directory can be folded back into a single link when every node
    /// it will contain after the plan runs is a link into one directory of
    /// one stow-owned package. Returns that directory's path (as a link
    /// value for the folded link) when folding is possible.
    fn foldable(&self, target_subdir: &Path) -> Result<Option<PathBuf>> {
        tracing::trace!(dir = %target_subdir.display(), "checking foldability");
        if self.config.no_folding {
            return Ok(None);
        }

        let mut parent_in_pkg: Option<PathBuf> = None;
        for node in list_dir(&self.target_root.join(target_subdir))? {
            let node_path = paths::join_rel(target_subdir, Path::new(&node));

            if !self.ledger.is_a_node(&node_path)? {
                continue;
            }
            if !self.ledger.is_a_link(&node_path)? {
                tracing::trace!(node = %node_path.display(), "not foldable: not a link");
                return Ok(None);
            }

            let link_dest = self.ledger.read_a_link(&node_path)?;
            let new_parent = paths::parent_rel(&link_dest);
            match &parent_in_pkg {
                None => parent_in_pkg = Some(new_parent),
                Some(existing) if *existing != new_parent => {
                    tracing::trace!(
                        dir = %target_subdir.display(),
                        "not foldable: links into more than one directory"
                    );
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        let Some(parent_in_pkg) = parent_in_pkg else {
            tracing::trace!(dir = %target_subdir.display(), "not foldable: contains no links");
            return Ok(None);
        };
        if parent_in_pkg.as_os_str().is_empty() {
            return Ok(None);
        }

        // A child's link value is relative to the directory holding it;
        // the folded link will live one level up.
        let parent_in_pkg = paths::strip_one_updir(&parent_in_pkg);

        if self
            .ownership
            .owning_package(target_subdir, &parent_in_pkg)?
            .is_some()
        {
            tracing::trace!(dir = %target_subdir.display(), "foldable");
            Ok(Some(parent_in_pkg))
        } else {
            Ok(None)
        }
    }

    /// Replace a directory of links with a single link to the package
    /// directory providing all of them.
    fn fold_tree(&mut self, target_subdir: &Path, pkg_subpath: &Path) -> Result<()> {
        tracing::debug!(
            "folding tree: {} => {}",
            target_subdir.display(),
            pkg_subpath.display()
        );

        for node in list_dir(&self.target_root.join(target_subdir))? {
            let node_path = paths::join_rel(target_subdir, Path::new(&node));
            if self.ledger.is_a_node(&node_path)? {
                self.ledger.unlink(&node_path)?;
            }
        }

        self.ledger.rmdir(target_subdir)?;
        self.ledger.link(pkg_subpath, target_subdir)
    }

    // ------------------------------------------------------------------
    // Shared predicates
    // ------------------------------------------------------------------

    /// Stow directories and `.nonstow`-protected directories are never
    /// modified, whichever package claims to provide them.
    fn should_skip_target(&self, target: &Path) -> bool {
        if target == self.stow_path {
            tracing::warn!(
                "skipping target which is the current stow directory: {}",
                target.display()
            );
            return true;
        }
        if self.ownership.is_marked_stow_dir(target) {
            tracing::warn!("skipping marked stow directory: {}", target.display());
            return true;
        }
        if self
            .target_root
            .join(target)
            .join(crate::ownership::UNSTOWABLE_MARKER)
            .exists()
        {
            tracing::warn!("skipping protected directory: {}", target.display());
            return true;
        }
        false
    }

    fn should_defer(&self, path: &Path) -> bool {
        crate::config::matches_any(&self.config.defer, path)
    }

    fn should_override(&self, path: &Path) -> bool {
        crate::config::matches_any(&self.config.overrides, path)
    }

    fn record_conflict(&mut self, package: &str, message: String) {
        tracing::debug!(package, message, "conflict");
        self.conflicts
            .entry(package.to_string())
            .or_default()
            .push(message);
    }
}

/// Immediate child names of a directory, sorted for deterministic plans.
fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => Error::read_dir(dir, io),
            None => Error::Input(format!("cannot read directory: {}", dir.display())),
        })?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}
