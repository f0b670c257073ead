use anyhow::Result;
use clap::Parser;
use pkgrepo::commands::{self, GlobalOptions};
use pkgrepo::config::{PROJECT_ENV, REPOS_DIR_ENV};
use std::path::PathBuf;

/// pkgrepo - project package manager
///
/// Installs versioned packages published by JSON repository descriptors into
/// a project's Packages directory and keeps its manifest in sync.
///
/// Examples:
///   pkgrepo repo add https://vpm.example.com/index.json
///   pkgrepo install com.example.tool
#[derive(Parser, Debug)]
#[command(author, version = env!("PKGREPO_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to the current directory; also via PKGREPO_PROJECT)
    #[arg(long, env = PROJECT_ENV, value_name = "PATH", global = true)]
    project: Option<PathBuf>,

    /// Directory holding repository descriptors (also via PKGREPO_REPOS_DIR)
    #[arg(long = "repos-dir", env = REPOS_DIR_ENV, value_name = "PATH", global = true)]
    repos_dir: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage package repositories
    #[command(subcommand)]
    Repo(RepoCommands),

    /// Re-download every repository that has a URL
    Refresh,

    /// Show the version a package would be installed at
    Resolve(ResolveArgs),

    /// Install a package (and its required base package)
    Install(InstallArgs),

    /// Remove an installed package
    Remove(RemoveArgs),

    /// Bring the manifest in line with the packages on disk
    Reconcile,

    /// List installed packages with newer versions available
    Outdated(OutdatedArgs),
}

#[derive(clap::Subcommand, Debug)]
enum RepoCommands {
    /// Add a repository from its descriptor URL
    Add {
        #[arg(value_name = "URL")]
        url: String,
    },

    /// List added repositories
    List,

    /// Remove a repository by name
    Remove {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

#[derive(clap::Args, Debug)]
struct ResolveArgs {
    /// Package id, e.g. com.example.tool
    #[arg(value_name = "ID")]
    id: String,

    /// Consider pre-release versions
    #[arg(long)]
    pre: bool,
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Package id, e.g. com.example.tool
    #[arg(value_name = "ID")]
    id: String,

    /// Exact version to install instead of the latest
    #[arg(long, value_name = "VERSION")]
    version: Option<String>,

    /// Consider pre-release versions
    #[arg(long)]
    pre: bool,
}

#[derive(clap::Args, Debug)]
struct RemoveArgs {
    #[arg(value_name = "ID")]
    id: String,
}

#[derive(clap::Args, Debug)]
struct OutdatedArgs {
    /// Consider pre-release versions
    #[arg(long)]
    pre: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = pkgrepo::runtime::RealRuntime;
    let global = GlobalOptions {
        project: cli.project,
        repos_dir: cli.repos_dir,
    };

    match cli.command {
        Commands::Repo(RepoCommands::Add { url }) => commands::repo_add(runtime, &global, &url).await?,
        Commands::Repo(RepoCommands::List) => commands::repo_list(runtime, &global).await?,
        Commands::Repo(RepoCommands::Remove { name }) => {
            commands::repo_remove(runtime, &global, &name).await?
        }
        Commands::Refresh => commands::refresh(runtime, &global).await?,
        Commands::Resolve(args) => commands::resolve(runtime, &global, &args.id, args.pre).await?,
        Commands::Install(args) => {
            commands::install(runtime, &global, &args.id, args.version.as_deref(), args.pre).await?
        }
        Commands::Remove(args) => commands::remove(runtime, &global, &args.id).await?,
        Commands::Reconcile => commands::reconcile(runtime, &global).await?,
        Commands::Outdated(args) => commands::outdated(runtime, &global, args.pre).await?,
    }
    Ok(())
}
