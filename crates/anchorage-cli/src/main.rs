//! Anchorage CLI - command-line interface for the Anchorage workspace
//! engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use semver::Version;
use std::path::PathBuf;

use anchorage_core::{
    CheckoutTarget, Decision, PackageIdentity, PackageLocation, Reason, ResolutionMode,
    ResolveOutcome, Workspace, WorkspaceConfig, WorkspaceDelegate,
};

mod git;
mod http;
mod loader;
mod solver;

use git::GitCli;
use http::HttpTransport;
use loader::TomlLoader;
use solver::CatalogSolver;

#[derive(Parser)]
#[command(name = "anchorage")]
#[command(version)]
#[command(about = "Workspace and dependency manager", long_about = None)]
struct Cli {
    /// Workspace root directory (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Fail instead of resolving when the pin file is missing or stale
    #[arg(long, global = true)]
    no_auto_resolve: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the dependency graph and materialize it
    Resolve,

    /// Re-resolve, moving all (or only the named) packages forward
    Update {
        /// Packages to update; all when omitted
        packages: Vec<String>,
    },

    /// Substitute a dependency with a mutable working copy
    Edit {
        /// Package to edit
        package: String,

        /// Where to create the working copy (kept on unedit)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Branch to check the working copy out to
        #[arg(long)]
        branch: Option<String>,

        /// Revision to check the working copy out to
        #[arg(long, conflicts_with = "branch")]
        rev: Option<String>,
    },

    /// Restore an edited dependency to its resolved state
    Unedit {
        /// Package to restore
        package: String,
    },

    /// Resolve one package to an exact version
    Pin {
        /// Package to pin
        package: String,

        /// Exact version to pin to
        version: String,
    },

    /// Remove checkouts, downloaded artifacts, and managed state
    Reset,

    /// Remove the build scratch only
    Clean,
}

/// Prints workspace progress the way users expect from a fetch-heavy
/// tool: one line per long-running side effect.
struct ConsoleDelegate;

impl WorkspaceDelegate for ConsoleDelegate {
    fn will_resolve(&self, reason: &Reason) {
        eprintln!("Resolving dependencies ({reason})");
    }

    fn fetching(&self, identity: &PackageIdentity, location: &PackageLocation) {
        eprintln!("Fetching {identity} from {location}");
    }

    fn checking_out(&self, identity: &PackageIdentity, target: &CheckoutTarget) {
        eprintln!("Checking out {identity} at {target}");
    }

    fn removing(&self, identity: &PackageIdentity) {
        eprintln!("Removing {identity}");
    }

    fn downloading_artifact(&self, url: &str) {
        eprintln!("Downloading {url}");
    }

    fn artifact_ready(&self, url: &str, from_cache: bool) {
        if !from_cache {
            eprintln!("Downloaded {url}");
        }
    }
}

fn report(outcome: &ResolveOutcome) {
    for diagnostic in &outcome.diagnostics {
        eprintln!("{diagnostic}");
    }
    if outcome.decision == Decision::NotRequired && outcome.diagnostics.is_empty() {
        eprintln!("Everything is already up-to-date");
    }
    for package in &outcome.packages {
        println!("{} {}", package.identity, package.state);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let mut config = WorkspaceConfig::new(&root);
    if cli.no_auto_resolve {
        config.resolution = ResolutionMode::Disallowed;
    }

    let loader = TomlLoader::new();
    let git = GitCli::new();
    let transport = HttpTransport::new().context("failed to set up HTTP transport")?;
    let solver = CatalogSolver::new(&git);
    let delegate = ConsoleDelegate;

    let workspace = Workspace::new(config, &loader, &git, &transport, &solver)?
        .with_delegate(&delegate);

    match cli.command {
        Commands::Resolve => {
            let outcome = workspace.resolve_graph()?;
            report(&outcome);
        }
        Commands::Update { packages } => {
            let names: Vec<&str> = packages.iter().map(String::as_str).collect();
            let outcome = workspace.update(&names)?;
            report(&outcome);
        }
        Commands::Edit {
            package,
            path,
            branch,
            rev,
        } => {
            let target = match (branch, rev) {
                (Some(branch), None) => Some(CheckoutTarget::Branch(branch)),
                (None, Some(rev)) => Some(CheckoutTarget::Revision(rev)),
                _ => None,
            };
            let edit_path = workspace.edit(&package, path, target)?;
            println!("{package} is now being edited at {}", edit_path.display());
        }
        Commands::Unedit { package } => {
            for diagnostic in workspace.unedit(&package)? {
                eprintln!("{diagnostic}");
            }
            println!("{package} restored to its resolved state");
        }
        Commands::Pin { package, version } => {
            let version = Version::parse(&version)
                .with_context(|| format!("'{version}' is not a valid version"))?;
            let outcome = workspace.resolve_to_pin(&package, &version)?;
            report(&outcome);
        }
        Commands::Reset => {
            workspace.reset()?;
            println!("Workspace reset");
        }
        Commands::Clean => {
            workspace.clean()?;
            println!("Build scratch removed");
        }
    }

    Ok(())
}
