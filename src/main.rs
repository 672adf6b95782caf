//! linkfarm CLI
//!
//! Command-line interface for managing farms of symbolic links.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use linkfarm::{Config, StowResult};

#[derive(Parser)]
#[command(name = "linkfarm")]
#[command(
    author,
    version,
    about = "Manage farms of symbolic links by mirroring package trees into a target directory"
)]
struct Cli {
    /// Stow directory containing the packages
    #[arg(short, long, env = "STOW_DIR", default_value = ".", value_name = "DIR")]
    dir: PathBuf,

    /// Target directory (default: parent of the stow directory)
    #[arg(short, long, value_name = "DIR")]
    target: Option<PathBuf>,

    /// Unstow the packages instead of stowing them
    #[arg(short = 'D', long = "delete", conflicts_with = "restow")]
    delete: bool,

    /// Unstow then stow the packages again (useful after updating them)
    #[arg(short = 'R', long)]
    restow: bool,

    /// Stow the packages (the default action)
    #[arg(short = 'S', long = "stow", conflicts_with_all = ["delete", "restow"])]
    stow: bool,

    /// Plan everything but modify nothing
    #[arg(short = 'n', long, visible_alias = "no")]
    simulate: bool,

    /// Increase verbosity (may be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Move conflicting plain files into the package, then link them
    #[arg(long)]
    adopt: bool,

    /// Translate `dot-` prefixed package entries to dotted target names
    #[arg(long)]
    dotfiles: bool,

    /// Disable folding of new directories into single links
    #[arg(long)]
    no_folding: bool,

    /// Use the legacy unstow algorithm that scans the target tree
    #[arg(long)]
    compat: bool,

    /// Ignore package entries ending in a match of this regex (repeatable)
    #[arg(long, value_name = "REGEX")]
    ignore: Vec<String>,

    /// Don't stow paths beginning with a match of this regex if the path
    /// is already stowed by another package (repeatable)
    #[arg(long, value_name = "REGEX")]
    defer: Vec<String>,

    /// Force stowing paths beginning with a match of this regex even if
    /// they are already stowed by another package (repeatable)
    #[arg(long = "override", value_name = "REGEX")]
    override_: Vec<String>,

    /// Packages to act on
    #[arg(required = true, value_name = "PACKAGE")]
    packages: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = build_config(cli)?;

    let (verb, result) = if cli.delete {
        ("unstowing", linkfarm::unstow(&config, &cli.packages)?)
    } else if cli.restow {
        ("restowing", linkfarm::restow(&config, &cli.packages)?)
    } else {
        if !cli.stow {
            tracing::trace!("no action flag given, defaulting to stow");
        }
        ("stowing", linkfarm::stow(&config, &cli.packages)?)
    };

    if !result.success {
        report_conflicts(verb, &result);
        return Ok(ExitCode::from(1));
    }

    if cli.simulate {
        println!(
            "{}",
            "WARNING: in simulation mode so not modifying filesystem.".yellow()
        );
        for task in &result.tasks {
            println!("{task}");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn build_config(cli: &Cli) -> Result<Config> {
    let compile = |patterns: &[String],
                   f: fn(&str) -> linkfarm::Result<regex::Regex>|
     -> Result<Vec<regex::Regex>> {
        patterns
            .iter()
            .map(|p| f(p).with_context(|| format!("bad pattern {p:?}")))
            .collect()
    };

    Ok(Config {
        dir: cli.dir.clone(),
        target: cli.target.clone(),
        dotfiles: cli.dotfiles,
        adopt: cli.adopt,
        no_folding: cli.no_folding,
        simulate: cli.simulate,
        verbose: cli.verbose,
        compat: cli.compat,
        ignore: compile(&cli.ignore, Config::compile_ignore)?,
        defer: compile(&cli.defer, Config::compile_defer)?,
        overrides: compile(&cli.override_, Config::compile_override)?,
    })
}

fn report_conflicts(verb: &str, result: &StowResult) {
    for (package, messages) in &result.conflicts {
        eprintln!(
            "{} {verb} {} would cause conflicts:",
            "WARNING!".yellow().bold(),
            package.cyan()
        );
        for message in messages {
            eprintln!("  {} {message}", "*".red());
        }
    }
    eprintln!("All operations aborted.");
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}
