//! Manage farms of symbolic links.
//!
//! A *stow directory* holds self-contained package trees; stowing a
//! package mirrors its tree into a *target directory* using relative
//! symlinks. Where a single package provides a whole subtree, one link to
//! the package directory covers it (*folding*); when a second package
//! later contributes to the same location, the folded link is split back
//! into a real directory with per-entry links (*unfolding*). Unstowing
//! removes exactly the links a package owns and re-folds directories left
//! serving a single package.
//!
//! Planning and execution are strictly separated: every package in a call
//! is planned first, conflicts across the whole batch are collected, and
//! the filesystem is only touched when no conflict was found anywhere.
//!
//! ```no_run
//! use linkfarm::{Config, stow};
//!
//! let config = Config::new("/home/user/stow");
//! let result = stow(&config, &["vim"])?;
//! assert!(result.success);
//! # Ok::<(), linkfarm::Error>(())
//! ```

pub mod config;
pub mod error;
mod executor;
pub mod ignore;
pub mod ownership;
pub mod paths;
pub mod planner;
pub mod task;

pub use config::Config;
pub use error::{Error, Result};
pub use ownership::StowedPath;
pub use planner::Planner;
pub use task::{StowResult, Task, TaskAction, TaskKind};

/// Install the given packages into the target directory.
pub fn stow<S: AsRef<str>>(config: &Config, packages: &[S]) -> Result<StowResult> {
    let packages: Vec<&str> = packages.iter().map(AsRef::as_ref).collect();
    let mut planner = Planner::new(config)?;
    planner.plan_stow(&packages)?;
    planner.execute()
}

/// Remove the given packages' links from the target directory.
pub fn unstow<S: AsRef<str>>(config: &Config, packages: &[S]) -> Result<StowResult> {
    let packages: Vec<&str> = packages.iter().map(AsRef::as_ref).collect();
    let mut planner = Planner::new(config)?;
    planner.plan_unstow(&packages)?;
    planner.execute()
}

/// Unstow then stow the given packages, typically after updating their
/// contents. Both phases share one plan, so links that would be removed
/// and immediately recreated cancel out instead of churning the target.
pub fn restow<S: AsRef<str>>(config: &Config, packages: &[S]) -> Result<StowResult> {
    let packages: Vec<&str> = packages.iter().map(AsRef::as_ref).collect();
    let mut planner = Planner::new(config)?;
    planner.plan_unstow(&packages)?;
    planner.plan_stow(&packages)?;
    planner.execute()
}
