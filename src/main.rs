//! modvault - mod package manager
//!
//! Command-line front end over the modvault engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use modvault::hash;
use modvault::identity::PackageIdentity;
use modvault::location::{Context, QueryReport};
use modvault::package::ARCHIVE_EXTENSIONS;
use modvault::repository::{DownloadEvent, RemotePackage, ReqwestClient, DEFAULT_SUFFIX};
use modvault::worker::{self, LocationHandle};

#[derive(Parser)]
#[command(name = "modvault")]
#[command(version)]
#[command(about = "Mod package manager with reversible installs and repository sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Home directory holding locations and batches
    #[arg(long, env = "MODVAULT_HOME", global = true)]
    home: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the identity of package files or folder names
    Ident {
        /// File or folder names
        #[arg(required = true)]
        paths: Vec<String>,

        /// Keep underscores instead of showing them as spaces
        #[arg(long)]
        keep_underscores: bool,
    },

    /// Compute or verify the MD5 checksum of a file
    Checksum {
        file: PathBuf,

        /// Expected checksum (hex)
        #[arg(long)]
        verify: Option<String>,
    },

    /// Manage locations
    #[command(subcommand)]
    Location(LocationCommand),

    /// List the packages in a location's library
    Library {
        /// Location title or uuid
        location: String,
    },

    /// Install a library package
    Install {
        location: String,
        /// Package identity or hex hash
        package: String,
    },

    /// Uninstall an installed package
    Uninstall {
        location: String,
        /// Package identity or hex hash
        package: String,
    },

    /// Manage repositories
    #[command(subcommand)]
    Repo(RepoCommand),

    /// Query a location's repositories
    Query {
        location: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a remote package into the library
    Download {
        location: String,
        /// Remote package identity
        ident: String,
    },

    /// Manage batches
    #[command(subcommand)]
    Batch(BatchCommand),
}

#[derive(Subcommand)]
enum LocationCommand {
    /// Create a location
    Create {
        title: String,
        /// Directory packages are installed into
        destination: PathBuf,
    },

    /// List locations
    List,

    /// Forget a location, keeping its library and install records
    Forget { location: String },
}

#[derive(Subcommand)]
enum RepoCommand {
    /// Add a repository to a location
    Add {
        location: String,
        /// Base URL
        base: String,
        /// Definition file name, without `.xml`
        #[arg(default_value = DEFAULT_SUFFIX)]
        name: String,
    },

    /// Remove a repository by definition URL
    Remove { location: String, url: String },

    /// Write a repository definition describing a location's library
    Publish {
        location: String,
        /// Base URL the definition will be served from
        base: String,

        #[arg(long, default_value = "Repository")]
        title: String,

        /// Download path, absolute or relative to the base URL
        #[arg(long, default_value = "")]
        downpath: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Create an empty batch
    Create { title: String },

    /// List batches
    List,

    /// Add a library package to a batch
    Add {
        batch: String,
        location: String,
        package: String,
    },

    /// Apply a batch to its locations
    Run {
        batch: String,

        /// Only run on this location
        #[arg(long)]
        location: Option<String>,

        /// Never uninstall packages missing from the batch
        #[arg(long)]
        install_only: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(if cli.verbose { "modvault=debug".parse()? } else { "modvault=warn".parse()? }),
            )
            .init();
    }

    match cli.command {
        Commands::Ident { paths, keep_underscores } => {
            for name in &paths {
                let path = Path::new(name);
                let is_file = path.is_file()
                    || path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| ARCHIVE_EXTENSIONS.iter().any(|a| e.eq_ignore_ascii_case(a)));
                let identity = PackageIdentity::from_path_name(name, is_file, !keep_underscores);
                println!("{}  {}  {}", identity.hash_hex(), identity.ident, identity);
            }
        }

        Commands::Checksum { file, verify } => {
            let sum = hash::try_checksum(&file)?;
            match verify {
                Some(expected) if !sum.eq_ignore_ascii_case(expected.trim()) => {
                    bail!("Checksum mismatch: expected {}, got {}", expected.trim(), sum);
                }
                Some(_) => println!("{}  OK", sum),
                None => println!("{}  {}", sum, file.display()),
            }
        }

        Commands::Location(command) => {
            let mut context = open_context(cli.home)?;
            match command {
                LocationCommand::Create { title, destination } => {
                    let handle = context.create_location(&title, &destination)?;
                    let home = handle.with(|loc| loc.home().to_path_buf())?;
                    println!("Created location '{}' at {}", title, home.display());
                }
                LocationCommand::List => {
                    for handle in context.locations() {
                        handle.with(|loc| {
                            println!(
                                "{}  {:<24} {} package(s), {} installed -> {}",
                                loc.uuid(),
                                loc.title(),
                                loc.packages().len(),
                                loc.backups().len(),
                                loc.config().destination.display()
                            );
                        })?;
                    }
                }
                LocationCommand::Forget { location } => {
                    let uuid = find_location(&context, &location)?.with(|loc| loc.uuid().to_string())?;
                    context.forget_location(&uuid)?;
                    println!("Forgot location '{}'", location);
                }
            }
        }

        Commands::Library { location } => {
            let context = open_context(cli.home)?;
            let handle = find_location(&context, &location)?;
            let loc = handle.lock()?;
            for package in loc.packages() {
                println!(
                    "{}  {:<14} {:<40} {} file(s)",
                    package.identity.hash_hex(),
                    format!("{:?}", loc.state(package.identity.hash)),
                    package.identity.ident,
                    package.file_count()
                );
            }
        }

        Commands::Install { location, package } => {
            let context = open_context(cli.home)?;
            let handle = find_location(&context, &location)?;
            let mut loc = handle.lock()?;
            let hash = loc
                .resolve(&package)
                .ok_or_else(|| anyhow!("No package '{}' in '{}'", package, location))?;

            let pb = progress_bar("Installing")?;
            let report = |done: usize, total: usize| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
            };
            let progress: &dyn Fn(usize, usize) = &report;
            let outcome = loc.install(hash, Some(progress));
            pb.finish_and_clear();
            let outcome = outcome?;

            println!("Installed {} ({} entries)", outcome.ident, outcome.entries);
            for other in outcome.overlapped {
                let name = loc.find_backup(other).map(|b| b.ident.clone()).unwrap_or_default();
                println!("  overwrote files of {} [{}]", name, hash::hash_to_hex(other));
            }
        }

        Commands::Uninstall { location, package } => {
            let context = open_context(cli.home)?;
            let handle = find_location(&context, &location)?;
            let mut loc = handle.lock()?;
            let hash = loc
                .resolve(&package)
                .ok_or_else(|| anyhow!("No package '{}' in '{}'", package, location))?;

            let pb = progress_bar("Uninstalling")?;
            let report = |done: usize, total: usize| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
            };
            let progress: &dyn Fn(usize, usize) = &report;
            let outcome = loc.uninstall(hash, Some(progress));
            pb.finish_and_clear();
            let outcome = outcome?;

            for warning in &outcome.warnings {
                eprintln!("warning: {}", warning);
            }
            println!(
                "Uninstalled {}: {} restored, {} deleted",
                package, outcome.report.restored, outcome.report.deleted
            );
        }

        Commands::Repo(command) => {
            let context = open_context(cli.home)?;
            match command {
                RepoCommand::Add { location, base, name } => {
                    let handle = find_location(&context, &location)?;
                    handle.lock()?.add_repository(&base, &name)?;
                    println!("Added repository {}", base);
                }
                RepoCommand::Remove { location, url } => {
                    let handle = find_location(&context, &location)?;
                    if !handle.lock()?.remove_repository(&url)? {
                        bail!("No repository {} in '{}'", url, location);
                    }
                    println!("Removed repository {}", url);
                }
                RepoCommand::Publish {
                    location,
                    base,
                    title,
                    downpath,
                    output,
                } => {
                    let handle = find_location(&context, &location)?;
                    let text = handle.lock()?.publish(&base, &title, &downpath)?;
                    match output {
                        Some(path) => {
                            modvault::document::write_atomic(&path, text.as_bytes())
                                .with_context(|| format!("Failed to write {}", path.display()))?;
                            println!("Wrote {}", path.display());
                        }
                        None => println!("{}", text),
                    }
                }
            }
        }

        Commands::Query { location, json } => {
            let context = open_context(cli.home)?;
            let handle = find_location(&context, &location)?;
            let http = ReqwestClient::new()?;
            let mut loc = handle.lock()?;
            let report = loc.query_repositories(&http, None);

            if json {
                let output = QueryOutput {
                    report: &report,
                    remotes: loc.remotes(),
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                for (url, error) in &report.failed {
                    eprintln!("warning: {}: {}", url, error);
                }
                for warning in &report.warnings {
                    eprintln!("warning: {}", warning);
                }
                for remote in loc.remotes() {
                    println!("{:<28} {:<40} {}", remote.state.to_string(), remote.identity.ident, remote.file);
                }
                println!(
                    "\n{} repositories queried, {} package(s) offered",
                    report.queried, report.remotes
                );
            }
        }

        Commands::Download { location, ident } => {
            let context = open_context(cli.home)?;
            let handle = find_location(&context, &location)?;
            let http = ReqwestClient::new()?;

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] Downloading [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")?
                    .progress_chars("=>-"),
            );
            pb.enable_steady_tick(Duration::from_millis(100));

            let bar = pb.clone();
            let task = worker::spawn(handle, Arc::new(AtomicBool::new(false)), move |loc, abort| {
                if loc.remotes().is_empty() {
                    let report = loc.query_repositories(&http, Some(abort));
                    for (url, error) in &report.failed {
                        bar.println(format!("warning: {}: {}", url, error));
                    }
                }
                loc.download(&ident, &http, Some(abort), &mut |event| {
                    if let DownloadEvent::Progress { downloaded, total } = event {
                        if let Some(total) = total {
                            bar.set_length(total);
                        }
                        bar.set_position(downloaded);
                    }
                })
            });
            let result = task.wait();
            pb.finish_and_clear();
            println!("Downloaded {}", result?.display());
        }

        Commands::Batch(command) => {
            let mut context = open_context(cli.home)?;
            match command {
                BatchCommand::Create { title } => {
                    let batch = context.create_batch(&title)?;
                    println!("Created batch '{}' ({})", batch.title, batch.uuid);
                }
                BatchCommand::List => {
                    for batch in context.batches() {
                        let installs: usize = (0..batch.locations().len())
                            .map(|i| batch.install_hashes(i).len())
                            .sum();
                        println!(
                            "{}  {:<24} {} location(s), {} install(s)",
                            batch.uuid,
                            batch.title,
                            batch.locations().len(),
                            installs
                        );
                    }
                }
                BatchCommand::Add {
                    batch,
                    location,
                    package,
                } => {
                    let handle = find_location(&context, &location)?;
                    let (uuid, hash, ident) = handle.with(|loc| {
                        let hash = loc.resolve(&package)?;
                        let ident = loc.find_package(hash)?.identity.ident.clone();
                        Some((loc.uuid().to_string(), hash, ident))
                    })?
                    .ok_or_else(|| anyhow!("No library package '{}' in '{}'", package, location))?;

                    let entry = context
                        .find_batch_mut(&batch)
                        .ok_or_else(|| anyhow!("No batch named '{}'", batch))?;
                    let index = entry.add_location(&uuid);
                    if entry.add_install(index, hash, &ident) {
                        entry.save()?;
                        println!("Added {} to '{}'", ident, entry.title);
                    } else {
                        println!("{} is already in '{}'", ident, entry.title);
                    }
                }
                BatchCommand::Run {
                    batch,
                    location,
                    install_only,
                } => {
                    let entry = context
                        .find_batch(&batch)
                        .cloned()
                        .ok_or_else(|| anyhow!("No batch named '{}'", batch))?;
                    let only = match &location {
                        Some(key) => Some(find_location(&context, key)?.with(|loc| loc.uuid().to_string())?),
                        None => None,
                    };

                    for uuid in entry.location_uuids() {
                        if only.as_deref().is_some_and(|o| o != uuid) {
                            continue;
                        }
                        let Some(handle) = context.find_location(uuid) else {
                            eprintln!("warning: batch lists unknown location {}", uuid);
                            continue;
                        };
                        let mut loc = handle.lock()?;
                        let report = loc.run_batch(&entry, install_only || entry.install_only)?;
                        println!("== {}", loc.title());
                        for ident in &report.uninstalled {
                            println!("  - {}", ident);
                        }
                        for ident in &report.installed {
                            println!("  + {}", ident);
                        }
                        for ident in &report.missing {
                            eprintln!("  missing: {}", ident);
                        }
                        for failure in &report.failures {
                            eprintln!("  failed: {}", failure);
                        }
                        for warning in &report.warnings {
                            eprintln!("  warning: {}", warning);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct QueryOutput<'a> {
    report: &'a QueryReport,
    remotes: &'a [RemotePackage],
}

fn open_context(home: Option<PathBuf>) -> Result<Context> {
    let home = match home {
        Some(home) => home,
        None => dirs::data_local_dir()
            .map(|dir| dir.join("modvault"))
            .ok_or_else(|| anyhow!("No data directory; pass --home"))?,
    };
    Context::open_or_create(&home)
}

fn find_location(context: &Context, key: &str) -> Result<LocationHandle> {
    context
        .find_location(key)
        .ok_or_else(|| anyhow!("No location named '{}'", key))
}

fn progress_bar(label: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] {} [{{bar:40.cyan/blue}}] {{pos}}/{{len}}",
                label
            ))?
            .progress_chars("=>-"),
    );
    Ok(pb)
}
