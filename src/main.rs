use std::{path::PathBuf, process::ExitCode};

use clap::{CommandFactory, Parser};
use frost_setup::{
    Error, InstallConfig, Installer, UninstallConfig, Uninstaller,
    config::{AppManifest, ArchiveSource, InstallDir, MANIFEST_ENTRY, known_dirs},
    installer::{InstallEvent, InstallObserver, InstallStep},
    installer_creator::{PackOptions, create_installer},
    integration::{MemoryRegistry, RegistryBackend, ShellRegistrar, context_menu_key},
    post_embed,
    uninstaller::UninstallOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Self-extracting installer for Windows applications")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Install the application carried by this executable
    Install {
        /// Install from a zip file instead of the embedded payload
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Directory to install into
        #[arg(long, env = "FROST_SETUP_INSTALL_DIR")]
        install_dir: Option<PathBuf>,
        /// Directory the start menu shortcut is created in
        #[arg(long, env = "FROST_SETUP_START_MENU_DIR")]
        start_menu_dir: Option<PathBuf>,
        /// Keep registry changes in memory and print them
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove an installed application
    Uninstall {
        #[arg(long, env = "FROST_SETUP_INSTALL_DIR")]
        install_dir: PathBuf,
        #[arg(long, env = "FROST_SETUP_START_MENU_DIR")]
        start_menu_dir: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Create an installer from a directory
    Pack {
        /// Directory holding the application files
        #[arg(short, long)]
        source: PathBuf,
        /// Filename of the resulting installer
        #[arg(short, long)]
        out: PathBuf,
        /// Executable to embed the payload into, defaults to this one
        #[arg(long)]
        base: Option<PathBuf>,
        /// Generate install.json from this Cargo.toml
        #[arg(short = 'm', long)]
        cargo_manifest: Option<PathBuf>,
    },
    /// Copy the embedded payload of an installer into a file
    Extract {
        #[arg(long)]
        carrier: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Setup(#[from] Error),
    #[error(transparent)]
    Create(#[from] frost_setup::installer_creator::CreateInstallerError),
    #[error(transparent)]
    Frame(#[from] post_embed::FrameError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let Some(command) = args.command else {
        // Printing help only fails if stdout is gone.
        Args::command().print_help().ok();
        return ExitCode::from(2);
    };

    match run(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Install {
            archive,
            install_dir,
            start_menu_dir,
            dry_run,
        } => {
            let current_exe = std::env::current_exe()?;
            let archive = match archive {
                Some(path) => ArchiveSource::External(path),
                None => ArchiveSource::Carrier(current_exe.clone()),
            };
            let install_dir = match install_dir {
                Some(path) => InstallDir::Exact(path),
                None => InstallDir::Under(known_dirs::user_programs().ok_or_else(|| {
                    CliError::Config(
                        "LOCALAPPDATA is not set, pass --install-dir".to_string(),
                    )
                })?),
            };
            let mut builder = InstallConfig::build()
                .archive(archive)
                .install_dir(install_dir)
                .uninstaller_source(current_exe);
            if let Some(start_menu_dir) = start_menu_dir {
                builder = builder.start_menu_dir(start_menu_dir);
            }
            let config = builder.finish().ok_or_else(|| {
                CliError::Config("APPDATA is not set, pass --start-menu-dir".to_string())
            })?;

            if dry_run {
                let registry = MemoryRegistry::new();
                install(config, &registry)?;
                print_registry(&registry);
            } else {
                install(config, system_registry())?;
            }
        }
        Command::Uninstall {
            install_dir,
            start_menu_dir,
            dry_run,
        } => {
            #[cfg(windows)]
            let relaunched = !dry_run && frost_setup::windows::relaunch_outside(&install_dir)?;
            #[cfg(not(windows))]
            let relaunched = false;
            if relaunched {
                return Ok(());
            }

            let start_menu_dir = start_menu_dir
                .or_else(known_dirs::start_menu_programs)
                .ok_or_else(|| {
                    CliError::Config("APPDATA is not set, pass --start-menu-dir".to_string())
                })?;
            let config = UninstallConfig::new(install_dir, start_menu_dir);

            if dry_run {
                print_uninstall_plan(&config)?;
            } else {
                let uninstaller = Uninstaller::new(config, ShellRegistrar::new(system_registry()));
                report_uninstall(uninstaller.uninstall(&mut ConsoleObserver::new())?);
            }
        }
        Command::Pack {
            source,
            out,
            base,
            cargo_manifest,
        } => {
            let base = match base {
                Some(base) => base,
                None => std::env::current_exe()?,
            };
            let report = create_installer(&PackOptions {
                source_dir: source,
                out,
                base,
                cargo_manifest,
            })?;
            println!(
                "Packed {} bytes ({} compressed)",
                report.unpacked_size, report.payload_size
            );
        }
        Command::Extract { carrier, out } => {
            let span = post_embed::extract(&carrier, &out)?;
            println!("Extracted {} bytes to {}", span.len, out.display());
        }
    }

    Ok(())
}

fn install(config: InstallConfig, registry: impl RegistryBackend) -> Result<(), CliError> {
    let mut installer = Installer::new(config, ShellRegistrar::new(registry));
    let report = installer.install(&mut ConsoleObserver::new())?;
    println!(
        "Installed to {}\nShortcut: {}",
        report.install_dir.display(),
        report.shortcut.display()
    );
    Ok(())
}

fn report_uninstall(outcome: UninstallOutcome) {
    match outcome {
        UninstallOutcome::Removed { name, .. } => println!("{} was removed", name),
        UninstallOutcome::NotInstalled => println!("Nothing to uninstall"),
    }
}

#[cfg(windows)]
fn system_registry() -> frost_setup::windows::WindowsRegistry {
    frost_setup::windows::WindowsRegistry
}

/// Outside of Windows there is no registry to write to, changes are only
/// logged.
#[cfg(not(windows))]
fn system_registry() -> MemoryRegistry {
    log::warn!("no system registry on this platform, registry changes are not persisted");
    MemoryRegistry::new()
}

fn print_uninstall_plan(config: &UninstallConfig) -> Result<(), CliError> {
    let manifest = AppManifest::load(&config.install_dir.join(MANIFEST_ENTRY))
        .map_err(Error::from)?
        .resolve_paths(&config.install_dir);

    println!("Would remove:");
    for entry in &manifest.context_menu_entries {
        println!(r"  HKCU\{}", context_menu_key(&entry.file_pattern, &entry.label));
    }
    println!(
        "  {}",
        config
            .start_menu_dir
            .join(manifest.shortcut_file_name())
            .display()
    );
    println!(r"  HKCU\{}", manifest.uninstall_key());
    println!("  {}", config.install_dir.display());
    Ok(())
}

fn print_registry(registry: &MemoryRegistry) {
    for key in registry.keys() {
        println!(r"HKCU\{}", key);
        for (name, value) in registry.values(&key).unwrap_or_default() {
            let name = if name.is_empty() { "(Default)" } else { name.as_str() };
            println!("    {} = {}", name, value);
        }
    }
}

/// Prints step lines and renders unpack progress as a bar.
struct ConsoleObserver {
    bar: Option<ProgressBar>,
}

impl ConsoleObserver {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl InstallObserver for ConsoleObserver {
    fn on_event(&mut self, event: InstallEvent) {
        match event {
            InstallEvent::StepStarted(step) => {
                if step == InstallStep::Unpack.name() {
                    let style = ProgressStyle::default_bar()
                        .template("{elapsed_precise} [{wide_bar:.green}] {percent}%")
                        .unwrap_or_else(|_| ProgressStyle::default_bar());
                    self.bar = Some(ProgressBar::new(100).with_style(style));
                }
                println!("{}...", step);
            }
            InstallEvent::Progress(fraction) => {
                if let Some(bar) = &self.bar {
                    bar.set_position((fraction * 100.0) as u64);
                }
            }
            InstallEvent::StepFinished(_) => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
            }
            InstallEvent::Done(_) => println!("Installation complete"),
        }
    }
}
