//! Replays a finalized task sequence against the filesystem.
//!
//! Tasks run in plan order: stow plans emit parents before children and
//! unstow plans emit children before parents, so directory creation always
//! precedes the links inside it and directory removal only ever targets an
//! already-emptied directory. Each operation validates its own
//! precondition implicitly by failing when the filesystem no longer
//! matches what planning observed; a lost race is a fatal error, not a
//! replan. Already-applied tasks are never rolled back.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use crate::error::{Error, Result};
use crate::task::{Task, TaskAction, TaskKind};

/// Apply every task, resolving their target-relative paths against the
/// absolute target root.
pub fn process_tasks(target_root: &Path, tasks: &[Task]) -> Result<()> {
    tracing::debug!("processing {} task(s)", tasks.len());
    for task in tasks {
        tracing::info!("{task}");
        process_task(target_root, task)?;
    }
    Ok(())
}

fn process_task(target_root: &Path, task: &Task) -> Result<()> {
    let path = target_root.join(&task.path);

    match (task.action, task.kind) {
        (TaskAction::Create, TaskKind::Dir) => fs::create_dir(&path).map_err(|e| {
            Error::io(
                format!("could not create directory: {} ({e})", task.path.display()),
                e,
            )
        }),

        (TaskAction::Create, TaskKind::Link) => {
            let source = task.source.as_deref().ok_or_else(|| {
                Error::Internal(format!("link task without a value: {}", task.path.display()))
            })?;
            symlink(source, &path).map_err(|e| {
                Error::io(
                    format!(
                        "could not create symlink: {} => {} ({e})",
                        task.path.display(),
                        source.display()
                    ),
                    e,
                )
            })
        }

        (TaskAction::Remove, TaskKind::Dir) => fs::remove_dir(&path).map_err(|e| {
            Error::io(
                format!("could not remove directory: {} ({e})", task.path.display()),
                e,
            )
        }),

        (TaskAction::Remove, TaskKind::Link) => remove_link(&path).map_err(|e| {
            Error::io(
                format!("could not remove link: {} ({e})", task.path.display()),
                e,
            )
        }),

        (TaskAction::Move, TaskKind::File) => {
            let dest = task.dest.as_deref().ok_or_else(|| {
                Error::Internal(format!(
                    "move task without a destination: {}",
                    task.path.display()
                ))
            })?;
            safe_move(&path, &target_root.join(dest)).map_err(|e| {
                Error::io(
                    format!(
                        "could not move {} -> {} ({e})",
                        task.path.display(),
                        dest.display()
                    ),
                    e,
                )
            })
        }

        (action, kind) => Err(Error::Internal(format!(
            "bad task action: {action:?} {kind:?}"
        ))),
    }
}

/// Remove a symlink, refusing to touch anything that turned into a real
/// directory since planning.
fn remove_link(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::IsADirectory,
            "is a directory",
        ));
    }
    fs::remove_file(path)
}

/// Rename with a lost-acknowledgment check. Some network filesystems
/// report failure for a rename that actually completed; if the source is
/// gone and the destination has the expected size, the move is treated as
/// done. Anything else propagates the original error.
fn safe_move(src: &Path, dst: &Path) -> std::io::Result<()> {
    let expected_len = fs::symlink_metadata(src)?.len();

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if rename_completed(src, dst, expected_len) => {
            tracing::warn!(
                "rename {} -> {} reported failure but completed",
                src.display(),
                dst.display()
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// True when a rename that reported failure nevertheless took effect: the
/// source is gone and the destination has the size the source had.
fn rename_completed(src: &Path, dst: &Path, expected_len: u64) -> bool {
    !src.exists() && fs::symlink_metadata(dst).map(|m| m.len()).ok() == Some(expected_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn link_task(path: &str, source: &str) -> Task {
        Task {
            action: TaskAction::Create,
            kind: TaskKind::Link,
            path: PathBuf::from(path),
            source: Some(PathBuf::from(source)),
            dest: None,
        }
    }

    #[test]
    fn test_tasks_run_in_plan_order() {
        let temp = TempDir::new().unwrap();
        let tasks = vec![
            Task {
                action: TaskAction::Create,
                kind: TaskKind::Dir,
                path: PathBuf::from("bin"),
                source: None,
                dest: None,
            },
            link_task("bin/vim", "../../stow/vim/bin/vim"),
        ];

        process_tasks(temp.path(), &tasks).unwrap();
        assert!(temp.path().join("bin").is_dir());
        assert_eq!(
            fs::read_link(temp.path().join("bin/vim")).unwrap(),
            PathBuf::from("../../stow/vim/bin/vim")
        );
    }

    #[test]
    fn test_removing_a_real_directory_as_a_link_fails() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("bin")).unwrap();
        let task = Task {
            action: TaskAction::Remove,
            kind: TaskKind::Link,
            path: PathBuf::from("bin"),
            source: None,
            dest: None,
        };

        let err = process_tasks(temp.path(), &[task]).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(temp.path().join("bin").is_dir());
    }

    #[test]
    fn test_move_then_link_preserves_content() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("stow/pkg/etc")).unwrap();
        fs::create_dir(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join("etc/conf"), "mine").unwrap();

        let tasks = vec![
            Task {
                action: TaskAction::Move,
                kind: TaskKind::File,
                path: PathBuf::from("etc/conf"),
                source: None,
                dest: Some(PathBuf::from("stow/pkg/etc/conf")),
            },
            link_task("etc/conf", "../stow/pkg/etc/conf"),
        ];

        process_tasks(temp.path(), &tasks).unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join("etc/conf")).unwrap(),
            "mine"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("stow/pkg/etc/conf")).unwrap(),
            "mine"
        );
    }

    #[test]
    fn test_failed_move_propagates_and_leaves_the_source() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("conf"), "mine").unwrap();
        let task = Task {
            action: TaskAction::Move,
            kind: TaskKind::File,
            path: PathBuf::from("conf"),
            source: None,
            dest: Some(PathBuf::from("missing/conf")),
        };

        let err = process_tasks(temp.path(), &[task]).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(
            fs::read_to_string(temp.path().join("conf")).unwrap(),
            "mine"
        );
    }

    #[test]
    fn test_lost_rename_acknowledgment_counts_as_done() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("conf");
        let dst = temp.path().join("adopted");
        fs::write(&dst, "mine").unwrap();

        // Source gone and destination at the recorded size: the rename
        // happened even though it reported failure.
        assert!(rename_completed(&src, &dst, 4));

        // A destination of the wrong size is not proof.
        assert!(!rename_completed(&src, &dst, 2));

        // A surviving source means the rename really failed.
        fs::write(&src, "mine").unwrap();
        assert!(!rename_completed(&src, &dst, 4));
    }

    #[test]
    fn test_failed_task_aborts_the_rest() {
        let temp = TempDir::new().unwrap();
        let tasks = vec![
            link_task("missing/vim", "../../stow/vim/bin/vim"),
            link_task("other", "../stow/vim/other"),
        ];

        assert!(process_tasks(temp.path(), &tasks).is_err());
        assert!(!temp.path().join("other").symlink_metadata().is_ok());
    }
}
