//! Command implementations behind the CLI.
//!
//! Each command resolves the project configuration, opens a
//! [`PackageManager`] with the local repositories loaded, runs one operation
//! and prints its result.

use anyhow::Result;
use log::debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cleanup::{self, SharedCleanupContext};
use crate::config::Config;
use crate::context::PackageManager;
use crate::install::{InstallProgress, InstallProgressFn, InstallStage};
use crate::runtime::Runtime;

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub project: Option<PathBuf>,
    pub repos_dir: Option<PathBuf>,
}

async fn open<R: Runtime + 'static>(
    runtime: R,
    global: &GlobalOptions,
    include_prerelease: bool,
    cleanup_ctx: SharedCleanupContext,
) -> Result<PackageManager<R>> {
    let config = Config::resolve(&runtime, global.project.clone(), global.repos_dir.clone())?
        .with_prerelease(include_prerelease);
    let manager = PackageManager::new(Arc::new(runtime), config, cleanup_ctx)?;
    let count = manager.load().await?;
    debug!("{} repositories loaded", count);
    Ok(manager)
}

#[tracing::instrument(skip(runtime, global))]
pub async fn repo_add<R: Runtime + 'static>(runtime: R, global: &GlobalOptions, url: &str) -> Result<()> {
    let manager = open(runtime, global, false, cleanup::new_shared()).await?;
    match manager.add_repository(url).await? {
        Some(repo) => println!(
            "Added repository {} ({} packages)",
            repo.name,
            repo.packages.len()
        ),
        None => println!("Repository {} is already added", url),
    }
    Ok(())
}

pub async fn repo_list<R: Runtime + 'static>(runtime: R, global: &GlobalOptions) -> Result<()> {
    let manager = open(runtime, global, false, cleanup::new_shared()).await?;
    let repositories = manager.repositories().await;
    if repositories.is_empty() {
        println!("No repositories added.");
        return Ok(());
    }
    for repo in repositories {
        println!("{}  {}  ({} packages)", repo.name, repo.url, repo.packages.len());
    }
    Ok(())
}

#[tracing::instrument(skip(runtime, global))]
pub async fn repo_remove<R: Runtime + 'static>(runtime: R, global: &GlobalOptions, name: &str) -> Result<()> {
    let manager = open(runtime, global, false, cleanup::new_shared()).await?;
    let removed = manager.remove_repository(name).await?;
    println!("Removed repository {}", removed.name);
    Ok(())
}

#[tracing::instrument(skip(runtime, global))]
pub async fn refresh<R: Runtime + 'static>(runtime: R, global: &GlobalOptions) -> Result<()> {
    let manager = open(runtime, global, false, cleanup::new_shared()).await?;
    let count = manager.refresh().await?;
    println!("Refreshed {} repositories", count);
    Ok(())
}

pub async fn resolve<R: Runtime + 'static>(
    runtime: R,
    global: &GlobalOptions,
    id: &str,
    pre: bool,
) -> Result<()> {
    let manager = open(runtime, global, pre, cleanup::new_shared()).await?;
    let entry = manager.resolve(id, pre)?;
    println!("{} {} (from {})", id, entry.version.version, entry.repository);
    Ok(())
}

/// Prints a line each time the install moves to another stage.
fn stage_printer() -> InstallProgressFn {
    let last: Mutex<Option<(String, InstallStage)>> = Mutex::new(None);
    Arc::new(move |progress: InstallProgress| {
        if advance_stage(&last, &progress) {
            eprintln!(
                "[{:>3.0}%] {} {}",
                progress.fraction * 100.0,
                progress.package,
                progress.stage
            );
        }
    })
}

/// Record `progress` and report whether it starts a new stage.
fn advance_stage(last: &Mutex<Option<(String, InstallStage)>>, progress: &InstallProgress) -> bool {
    let mut last = last.lock().unwrap_or_else(|p| p.into_inner());
    let current = (progress.package.clone(), progress.stage);
    if last.as_ref() == Some(&current) {
        return false;
    }
    *last = Some(current);
    true
}

#[tracing::instrument(skip(runtime, global))]
pub async fn install<R: Runtime + 'static>(
    runtime: R,
    global: &GlobalOptions,
    id: &str,
    version: Option<&str>,
    pre: bool,
) -> Result<()> {
    let cleanup_ctx = cleanup::new_shared();
    let manager = open(runtime, global, pre, cleanup_ctx.clone()).await?;
    let cancel = CancellationToken::new();

    let ctrl_c_handler = {
        let cleanup_ctx = cleanup_ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, cleaning up...");
                cancel.cancel();
                cleanup::lock(&cleanup_ctx).cleanup();
                std::process::exit(130);
            }
        })
    };

    let result = manager
        .install(id, version, pre, stage_printer(), &cancel)
        .await;
    ctrl_c_handler.abort();

    let outcome = result?;
    for package in &outcome.installed {
        println!("Installed {} {}", package.id, package.version);
    }
    debug!(
        "{} files copied, {} stale files removed",
        outcome.files_copied, outcome.files_removed
    );
    Ok(())
}

#[tracing::instrument(skip(runtime, global))]
pub async fn remove<R: Runtime + 'static>(runtime: R, global: &GlobalOptions, id: &str) -> Result<()> {
    let manager = open(runtime, global, false, cleanup::new_shared()).await?;
    manager.remove(id).await?;
    println!("Removed {}", id);
    Ok(())
}

#[tracing::instrument(skip(runtime, global))]
pub async fn reconcile<R: Runtime + 'static>(runtime: R, global: &GlobalOptions) -> Result<()> {
    let manager = open(runtime, global, false, cleanup::new_shared()).await?;
    let updated = manager.reconcile_manifest()?;
    println!("Updated {} manifest entries", updated);
    Ok(())
}

pub async fn outdated<R: Runtime + 'static>(runtime: R, global: &GlobalOptions, pre: bool) -> Result<()> {
    let manager = open(runtime, global, pre, cleanup::new_shared()).await?;
    let outdated = manager.outdated(pre);
    if outdated.is_empty() {
        println!("All packages are up to date.");
        return Ok(());
    }
    for package in outdated {
        println!(
            "{}  {} -> {}  ({})",
            package.id, package.installed, package.latest, package.repository
        );
    }
    Ok(())
}
