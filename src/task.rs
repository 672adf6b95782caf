//! Deferred filesystem operations and the staging ledger.
//!
//! Tasks are queued during planning and executed only after every package
//! has been planned and no conflicts were found. The [`TaskLedger`] is the
//! single piece of state shared across packages within one run: it maps
//! each target path to its pending link and directory tasks, rejects
//! incompatible double-registrations, cancels reverting pairs, and answers
//! "what will this path be once the plan runs?" by overlaying pending
//! tasks on on-disk truth.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// What a task does to its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Create,
    Remove,
    /// A previously queued task cancelled by a later reverting one.
    /// Stripped before execution.
    Skip,
    Move,
}

/// The kind of filesystem node a task operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Link,
    Dir,
    File,
}

/// One deferred filesystem operation. Never mutated after creation except
/// to be superseded to [`TaskAction::Skip`] by a reverting registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub action: TaskAction,
    pub kind: TaskKind,
    /// Target-relative path the task acts on.
    pub path: PathBuf,
    /// For links: the link value. Recorded on removals too, so a later
    /// re-creation of the same link can cancel the pair.
    pub source: Option<PathBuf>,
    /// For moves: where the adopted file goes.
    pub dest: Option<PathBuf>,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.action, self.kind) {
            (TaskAction::Create, TaskKind::Link) => write!(
                f,
                "LINK: {} => {}",
                self.path.display(),
                self.source.as_deref().unwrap_or(Path::new("?")).display()
            ),
            (TaskAction::Remove, TaskKind::Link) => write!(f, "UNLINK: {}", self.path.display()),
            (TaskAction::Create, TaskKind::Dir) => write!(f, "MKDIR: {}", self.path.display()),
            (TaskAction::Remove, TaskKind::Dir) => write!(f, "RMDIR: {}", self.path.display()),
            (TaskAction::Move, _) => write!(
                f,
                "MV: {} -> {}",
                self.path.display(),
                self.dest.as_deref().unwrap_or(Path::new("?")).display()
            ),
            (TaskAction::Skip, _) => write!(f, "SKIP: {}", self.path.display()),
            (action, kind) => write!(f, "{action:?} {kind:?}: {}", self.path.display()),
        }
    }
}

/// Outcome of a stow, unstow or restow call.
#[derive(Debug, Clone)]
pub struct StowResult {
    /// True iff no conflicts were found.
    pub success: bool,
    /// Conflict messages per package, in discovery order. Empty on success.
    pub conflicts: BTreeMap<String, Vec<String>>,
    /// The operations performed, or in simulate mode the operations that
    /// would have been.
    pub tasks: Vec<Task>,
}

/// Staging map from target path to pending operation.
///
/// Invariant: at most one active (non-skip) link task and one directory
/// task per path. A second, incompatible registration for the same path is
/// an internal error; planners must detect conflicting situations before
/// registering.
#[derive(Debug)]
pub struct TaskLedger {
    target_root: PathBuf,
    tasks: Vec<Task>,
    link_task_for: HashMap<PathBuf, usize>,
    dir_task_for: HashMap<PathBuf, usize>,
}

impl TaskLedger {
    /// `target_root` is the absolute target directory; queries resolve
    /// relative paths against it.
    pub fn new(target_root: PathBuf) -> Self {
        Self {
            target_root,
            tasks: Vec::new(),
            link_task_for: HashMap::new(),
            dir_task_for: HashMap::new(),
        }
    }

    /// All queued tasks with cancelled pairs stripped, in plan order.
    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
            .into_iter()
            .filter(|task| task.action != TaskAction::Skip)
            .collect()
    }

    /// The pending link task for a path, if any.
    pub fn link_task(&self, path: &Path) -> Option<&Task> {
        self.link_task_for.get(path).map(|&i| &self.tasks[i])
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Queue creation of a symlink at `path` with value `source`.
    pub fn link(&mut self, source: &Path, path: &Path) -> Result<()> {
        if let Some(task) = self.dir_task_for.get(path).map(|&i| &self.tasks[i]) {
            match task.action {
                TaskAction::Create => {
                    return Err(Error::Internal(format!(
                        "new link {} => {} clashes with planned new directory",
                        path.display(),
                        source.display(),
                    )));
                }
                // Folding removes a directory before linking over it.
                TaskAction::Remove => {}
                action => return Err(bad_action(action)),
            }
        }

        if let Some(&index) = self.link_task_for.get(path) {
            let task = &self.tasks[index];
            match task.action {
                TaskAction::Create => {
                    if task.source.as_deref() != Some(source) {
                        return Err(Error::Internal(format!(
                            "new link clashes with planned new link: {} => {}",
                            task.path.display(),
                            task.source.as_deref().unwrap_or(Path::new("?")).display(),
                        )));
                    }
                    tracing::debug!(
                        "LINK: {} => {} (duplicates previous action)",
                        path.display(),
                        source.display()
                    );
                    return Ok(());
                }
                TaskAction::Remove if task.source.as_deref() == Some(source) => {
                    tracing::debug!(
                        "LINK: {} => {} (reverts previous action)",
                        path.display(),
                        source.display()
                    );
                    self.cancel_link_task(index, path);
                    return Ok(());
                }
                TaskAction::Remove => {} // remove one value, create another
                action => return Err(bad_action(action)),
            }
        }

        tracing::debug!("LINK: {} => {}", path.display(), source.display());
        self.push_link_task(Task {
            action: TaskAction::Create,
            kind: TaskKind::Link,
            path: path.to_path_buf(),
            source: Some(source.to_path_buf()),
            dest: None,
        });
        Ok(())
    }

    /// Queue removal of the symlink at `path`. The path must be a real
    /// link or a planned one.
    pub fn unlink(&mut self, path: &Path) -> Result<()> {
        if let Some(&index) = self.link_task_for.get(path) {
            let task = &self.tasks[index];
            match task.action {
                TaskAction::Remove => {
                    tracing::debug!("UNLINK: {} (duplicates previous action)", path.display());
                    return Ok(());
                }
                TaskAction::Create => {
                    tracing::debug!("UNLINK: {} (reverts previous action)", path.display());
                    self.cancel_link_task(index, path);
                    return Ok(());
                }
                action => return Err(bad_action(action)),
            }
        }

        if let Some(task) = self.dir_task_for.get(path).map(|&i| &self.tasks[i])
            && task.action == TaskAction::Create
        {
            return Err(Error::Internal(format!(
                "new unlink operation clashes with planned directory creation: {}",
                path.display()
            )));
        }

        tracing::debug!("UNLINK: {}", path.display());
        let source = fs::read_link(self.target_root.join(path)).map_err(|e| {
            Error::io(format!("could not readlink {} ({e})", path.display()), e)
        })?;
        self.push_link_task(Task {
            action: TaskAction::Remove,
            kind: TaskKind::Link,
            path: path.to_path_buf(),
            source: Some(source),
            dest: None,
        });
        Ok(())
    }

    /// Queue creation of a directory at `path`.
    pub fn mkdir(&mut self, path: &Path) -> Result<()> {
        if let Some(task) = self.link_task_for.get(path).map(|&i| &self.tasks[i]) {
            match task.action {
                TaskAction::Create => {
                    return Err(Error::Internal(format!(
                        "new dir clashes with planned new link ({} => {})",
                        task.path.display(),
                        task.source.as_deref().unwrap_or(Path::new("?")).display(),
                    )));
                }
                // Unfolding removes a link before creating the directory.
                TaskAction::Remove => {}
                action => return Err(bad_action(action)),
            }
        }

        if let Some(&index) = self.dir_task_for.get(path) {
            let task = &self.tasks[index];
            match task.action {
                TaskAction::Create => {
                    tracing::debug!("MKDIR: {} (duplicates previous action)", path.display());
                    return Ok(());
                }
                TaskAction::Remove => {
                    tracing::debug!("MKDIR: {} (reverts previous action)", path.display());
                    self.cancel_dir_task(index, path);
                    return Ok(());
                }
                action => return Err(bad_action(action)),
            }
        }

        tracing::debug!("MKDIR: {}", path.display());
        self.push_dir_task(Task {
            action: TaskAction::Create,
            kind: TaskKind::Dir,
            path: path.to_path_buf(),
            source: None,
            dest: None,
        });
        Ok(())
    }

    /// Queue removal of the directory at `path`.
    pub fn rmdir(&mut self, path: &Path) -> Result<()> {
        if let Some(task) = self.link_task_for.get(path).map(|&i| &self.tasks[i]) {
            return Err(Error::Internal(format!(
                "rmdir clashes with planned link operation: {} => {}",
                task.path.display(),
                task.source.as_deref().unwrap_or(Path::new("?")).display(),
            )));
        }

        if let Some(&index) = self.dir_task_for.get(path) {
            let task = &self.tasks[index];
            match task.action {
                TaskAction::Remove => {
                    tracing::debug!("RMDIR: {} (duplicates previous action)", path.display());
                    return Ok(());
                }
                TaskAction::Create => {
                    tracing::debug!("RMDIR: {} (reverts previous action)", path.display());
                    self.cancel_dir_task(index, path);
                    return Ok(());
                }
                action => return Err(bad_action(action)),
            }
        }

        tracing::debug!("RMDIR: {}", path.display());
        self.push_dir_task(Task {
            action: TaskAction::Remove,
            kind: TaskKind::Dir,
            path: path.to_path_buf(),
            source: None,
            dest: None,
        });
        Ok(())
    }

    /// Queue moving the file at `src` to `dst` (adopt mode). Always
    /// followed by a link registration for `src`.
    pub fn mv(&mut self, src: &Path, dst: &Path) -> Result<()> {
        if self.link_task_for.contains_key(src) || self.dir_task_for.contains_key(src) {
            return Err(Error::Internal(format!(
                "move clashes with a pre-existing task for {}",
                src.display()
            )));
        }

        tracing::debug!("MV: {} -> {}", src.display(), dst.display());
        self.tasks.push(Task {
            action: TaskAction::Move,
            kind: TaskKind::File,
            path: src.to_path_buf(),
            source: None,
            dest: Some(dst.to_path_buf()),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Planned-state queries: pending tasks overlaid on on-disk truth
    // ------------------------------------------------------------------

    /// Is `path` a current or planned symlink?
    pub fn is_a_link(&self, path: &Path) -> Result<bool> {
        match self.link_action(path)? {
            Some(TaskAction::Remove) => return Ok(false),
            Some(TaskAction::Create) => return Ok(true),
            _ => {}
        }

        if self.target_root.join(path).is_symlink() {
            return Ok(!self.parent_link_scheduled_for_removal(path));
        }
        Ok(false)
    }

    /// Is `path` a current or planned directory?
    pub fn is_a_dir(&self, path: &Path) -> Result<bool> {
        match self.dir_action(path)? {
            Some(TaskAction::Remove) => return Ok(false),
            Some(TaskAction::Create) => return Ok(true),
            _ => {}
        }

        if self.parent_link_scheduled_for_removal(path) {
            return Ok(false);
        }
        Ok(self.target_root.join(path).is_dir())
    }

    /// Will anything exist at `path` once the plan runs?
    pub fn is_a_node(&self, path: &Path) -> Result<bool> {
        let link = self.link_action(path)?;
        let dir = self.dir_action(path)?;

        match (link, dir) {
            (Some(TaskAction::Remove), Some(TaskAction::Remove)) => {
                return Err(Error::Internal(format!(
                    "removing link and dir: {}",
                    path.display()
                )));
            }
            // Unfolding: link removal happens before dir creation.
            (Some(TaskAction::Remove), Some(TaskAction::Create)) => return Ok(true),
            (Some(TaskAction::Remove), None) => return Ok(false),
            // Folding: dir removal happens before link creation.
            (Some(TaskAction::Create), Some(TaskAction::Remove)) => return Ok(true),
            (Some(TaskAction::Create), Some(TaskAction::Create)) => {
                return Err(Error::Internal(format!(
                    "creating link and dir: {}",
                    path.display()
                )));
            }
            (Some(TaskAction::Create), None) => return Ok(true),
            (None, Some(TaskAction::Remove)) => return Ok(false),
            (None, Some(TaskAction::Create)) => return Ok(true),
            (None, None) => {}
            (link, dir) => {
                return Err(Error::Internal(format!(
                    "bad task actions {link:?}/{dir:?} for {}",
                    path.display()
                )));
            }
        }

        if self.parent_link_scheduled_for_removal(path) {
            return Ok(false);
        }
        Ok(self.target_root.join(path).exists())
    }

    /// The value of a current or planned link at `path`.
    pub fn read_a_link(&self, path: &Path) -> Result<PathBuf> {
        match self.link_action(path)? {
            Some(TaskAction::Create) => {
                let task = self.link_task(path).and_then(|t| t.source.clone());
                return task.ok_or_else(|| {
                    Error::Internal(format!("planned link without a value: {}", path.display()))
                });
            }
            Some(TaskAction::Remove) => {
                return Err(Error::Internal(format!(
                    "read_a_link() passed a path scheduled for removal: {}",
                    path.display()
                )));
            }
            _ => {}
        }

        let full = self.target_root.join(path);
        if full.is_symlink() {
            return fs::read_link(&full).map_err(|e| {
                Error::io(format!("could not read link: {} ({e})", path.display()), e)
            });
        }

        Err(Error::Internal(format!(
            "read_a_link() passed a non-link path: {}",
            path.display()
        )))
    }

    /// True if `path` or any of its ancestors is a link scheduled for
    /// removal; anything beneath such a link no longer counts as present.
    fn parent_link_scheduled_for_removal(&self, path: &Path) -> bool {
        let mut prefix = PathBuf::new();
        for component in path.components() {
            prefix.push(component);
            if let Some(&index) = self.link_task_for.get(&prefix)
                && self.tasks[index].action == TaskAction::Remove
            {
                return true;
            }
        }
        false
    }

    fn link_action(&self, path: &Path) -> Result<Option<TaskAction>> {
        self.action_in(&self.link_task_for, path)
    }

    fn dir_action(&self, path: &Path) -> Result<Option<TaskAction>> {
        self.action_in(&self.dir_task_for, path)
    }

    fn action_in(
        &self,
        task_for: &HashMap<PathBuf, usize>,
        path: &Path,
    ) -> Result<Option<TaskAction>> {
        let Some(&index) = task_for.get(path) else {
            return Ok(None);
        };
        let action = self.tasks[index].action;
        match action {
            TaskAction::Create | TaskAction::Remove => Ok(Some(action)),
            action => Err(bad_action(action)),
        }
    }

    fn push_link_task(&mut self, task: Task) {
        self.link_task_for.insert(task.path.clone(), self.tasks.len());
        self.tasks.push(task);
    }

    fn push_dir_task(&mut self, task: Task) {
        self.dir_task_for.insert(task.path.clone(), self.tasks.len());
        self.tasks.push(task);
    }

    fn cancel_link_task(&mut self, index: usize, path: &Path) {
        self.tasks[index].action = TaskAction::Skip;
        self.link_task_for.remove(path);
    }

    fn cancel_dir_task(&mut self, index: usize, path: &Path) {
        self.tasks[index].action = TaskAction::Skip;
        self.dir_task_for.remove(path);
    }
}

fn bad_action(action: TaskAction) -> Error {
    Error::Internal(format!("bad task action: {action:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger(temp: &TempDir) -> TaskLedger {
        TaskLedger::new(temp.path().to_path_buf())
    }

    #[test]
    fn test_duplicate_link_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let mut ledger = ledger(&temp);

        ledger.link(Path::new("stow/pkg/bin"), Path::new("bin")).unwrap();
        ledger.link(Path::new("stow/pkg/bin"), Path::new("bin")).unwrap();

        assert_eq!(ledger.into_tasks().len(), 1);
    }

    #[test]
    fn test_conflicting_link_values_are_an_internal_error() {
        let temp = TempDir::new().unwrap();
        let mut ledger = ledger(&temp);

        ledger.link(Path::new("stow/a/bin"), Path::new("bin")).unwrap();
        let err = ledger
            .link(Path::new("stow/b/bin"), Path::new("bin"))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_unlink_then_relink_same_value_cancels() {
        let temp = TempDir::new().unwrap();
        std::os::unix::fs::symlink("stow/pkg/bin", temp.path().join("bin")).unwrap();
        let mut ledger = ledger(&temp);

        ledger.unlink(Path::new("bin")).unwrap();
        ledger.link(Path::new("stow/pkg/bin"), Path::new("bin")).unwrap();

        assert!(ledger.into_tasks().is_empty());
    }

    #[test]
    fn test_rmdir_then_mkdir_cancels() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("bin")).unwrap();
        let mut ledger = ledger(&temp);

        ledger.rmdir(Path::new("bin")).unwrap();
        ledger.mkdir(Path::new("bin")).unwrap();

        assert!(ledger.into_tasks().is_empty());
    }

    #[test]
    fn test_link_over_planned_dir_is_an_internal_error() {
        let temp = TempDir::new().unwrap();
        let mut ledger = ledger(&temp);

        ledger.mkdir(Path::new("bin")).unwrap();
        let err = ledger
            .link(Path::new("stow/pkg/bin"), Path::new("bin"))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_planned_state_overlays_disk() {
        let temp = TempDir::new().unwrap();
        let mut ledger = ledger(&temp);

        assert!(!ledger.is_a_node(Path::new("bin")).unwrap());
        ledger.mkdir(Path::new("bin")).unwrap();
        assert!(ledger.is_a_dir(Path::new("bin")).unwrap());
        assert!(ledger.is_a_node(Path::new("bin")).unwrap());
        assert!(!ledger.is_a_link(Path::new("bin")).unwrap());
    }

    #[test]
    fn test_unfold_sequence_counts_as_node() {
        // Removing a folded link then creating a real directory keeps the
        // path a node throughout planning.
        let temp = TempDir::new().unwrap();
        std::os::unix::fs::symlink("stow/pkg/bin", temp.path().join("bin")).unwrap();
        let mut ledger = ledger(&temp);

        ledger.unlink(Path::new("bin")).unwrap();
        ledger.mkdir(Path::new("bin")).unwrap();

        assert!(ledger.is_a_node(Path::new("bin")).unwrap());
        assert!(ledger.is_a_dir(Path::new("bin")).unwrap());
        assert!(!ledger.is_a_link(Path::new("bin")).unwrap());
    }

    #[test]
    fn test_read_a_link_prefers_planned_value() {
        let temp = TempDir::new().unwrap();
        let mut ledger = ledger(&temp);

        ledger.link(Path::new("stow/pkg/bin"), Path::new("bin")).unwrap();
        assert_eq!(
            ledger.read_a_link(Path::new("bin")).unwrap(),
            PathBuf::from("stow/pkg/bin")
        );
    }

    #[test]
    fn test_child_of_removed_link_is_not_present() {
        let temp = TempDir::new().unwrap();
        std::os::unix::fs::symlink("stow/pkg/bin", temp.path().join("bin")).unwrap();
        let mut ledger = ledger(&temp);

        ledger.unlink(Path::new("bin")).unwrap();
        assert!(!ledger.is_a_node(Path::new("bin/vim")).unwrap());
    }
}
