use std::{
    fs, io,
    path::{self, Path},
};

use crate::{
    Error,
    config::{AppManifest, MANIFEST_ENTRY, ResolvedManifest, UninstallConfig},
    installer::{InstallEvent, InstallObserver},
    integration::SystemRegistrar,
};

/// File name prefix of uninstaller copies started from the temp directory.
pub const RELAUNCH_PREFIX: &str = "frost_setup_uninstall_";

pub fn relaunch_copy_name(pid: u32) -> String {
    format!("{RELAUNCH_PREFIX}{pid}.exe")
}

/// Deletes uninstaller copies left in `dir` by earlier relaunches, except
/// `keep`. Copies that are still running can't be deleted and are skipped.
/// Returns the number of removed files.
pub fn remove_stale_relaunch_copies(dir: &Path, keep: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for path in entries.flatten().map(|entry| entry.path()) {
        let is_copy = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(RELAUNCH_PREFIX) && name.ends_with(".exe"));
        if !is_copy || path == keep {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("removed stale uninstaller copy {}", path.display());
                removed += 1;
            }
            Err(err) => log::debug!("keeping {}: {}", path.display(), err),
        }
    }
    removed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallStep {
    LoadDescriptor,
    RemoveContextMenuEntries,
    RemoveShortcut,
    UnregisterUninstallEntry,
    RemoveInstallDir,
}

impl UninstallStep {
    pub fn name(self) -> &'static str {
        match self {
            UninstallStep::LoadDescriptor => "load descriptor",
            UninstallStep::RemoveContextMenuEntries => "remove context menu entries",
            UninstallStep::RemoveShortcut => "remove start menu shortcut",
            UninstallStep::UnregisterUninstallEntry => "unregister uninstall entry",
            UninstallStep::RemoveInstallDir => "remove install directory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed { name: String, uninstall_key: String },
    /// The install directory did not exist, there was nothing to do.
    NotInstalled,
}

/// Removes everything an [`Installer`](crate::installer::Installer) created,
/// in reverse order. Parts that are already gone are skipped.
pub struct Uninstaller<R> {
    config: UninstallConfig,
    registrar: R,
}

impl<R: SystemRegistrar> Uninstaller<R> {
    pub fn new(config: UninstallConfig, registrar: R) -> Self {
        Self { config, registrar }
    }

    pub fn uninstall(
        &self,
        observer: &mut dyn InstallObserver,
    ) -> Result<UninstallOutcome, Error> {
        let install_dir = path::absolute(&self.config.install_dir)
            .map_err(Error::io(&self.config.install_dir))?;
        let install_dir = install_dir.as_path();
        if !install_dir.exists() {
            log::warn!(
                "{} does not exist, nothing to uninstall",
                install_dir.display()
            );
            return Ok(UninstallOutcome::NotInstalled);
        }

        let manifest = self.run_step(UninstallStep::LoadDescriptor, observer, || {
            let manifest = AppManifest::load(&install_dir.join(MANIFEST_ENTRY))?;
            Ok(manifest.resolve_paths(install_dir))
        })?;
        self.run_step(UninstallStep::RemoveContextMenuEntries, observer, || {
            self.remove_context_menu_entries(&manifest)
        })?;
        self.run_step(UninstallStep::RemoveShortcut, observer, || {
            let shortcut = self
                .config
                .start_menu_dir
                .join(manifest.shortcut_file_name());
            self.registrar.remove_start_menu_shortcut(&shortcut)?;
            Ok(())
        })?;
        self.run_step(UninstallStep::UnregisterUninstallEntry, observer, || {
            self.registrar
                .unregister_uninstall_entry(&manifest.uninstall_key())?;
            Ok(())
        })?;
        self.run_step(UninstallStep::RemoveInstallDir, observer, || {
            match fs::remove_dir_all(install_dir) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    Err(Error::io(install_dir)(err))
                }
                _ => Ok(()),
            }
        })?;

        log::info!("uninstalled {}", manifest.name);
        Ok(UninstallOutcome::Removed {
            uninstall_key: manifest.uninstall_key(),
            name: manifest.name,
        })
    }

    fn run_step<T>(
        &self,
        step: UninstallStep,
        observer: &mut dyn InstallObserver,
        run: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        log::debug!("uninstall step: {}", step.name());
        observer.on_event(InstallEvent::StepStarted(step.name()));
        let value = run().map_err(|source| Error::OperationFailed {
            step: step.name(),
            source: Box::new(source),
        })?;
        observer.on_event(InstallEvent::StepFinished(step.name()));
        Ok(value)
    }

    fn remove_context_menu_entries(&self, manifest: &ResolvedManifest) -> Result<(), Error> {
        for entry in &manifest.context_menu_entries {
            self.registrar
                .remove_context_menu_entry(&entry.label, &entry.file_pattern)?;
        }
        if !manifest.context_menu_entries.is_empty() {
            self.registrar.notify_shell();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        installer::Silent,
        integration::{MemoryRegistry, ShellRegistrar},
    };
    use tempfile::tempdir;

    #[test]
    fn missing_install_dir_is_not_installed() {
        let dir = tempdir().unwrap();
        let uninstaller = Uninstaller::new(
            UninstallConfig::new(dir.path().join("gone"), dir.path().join("menu")),
            ShellRegistrar::new(MemoryRegistry::new()),
        );

        assert_eq!(
            uninstaller.uninstall(&mut Silent).unwrap(),
            UninstallOutcome::NotInstalled
        );
    }

    #[test]
    fn missing_manifest_fails_first_step() {
        let dir = tempdir().unwrap();
        let install_dir = dir.path().join("app");
        fs::create_dir_all(&install_dir).unwrap();
        fs::write(install_dir.join("app.exe"), b"exe").unwrap();
        let uninstaller = Uninstaller::new(
            UninstallConfig::new(&install_dir, dir.path().join("menu")),
            ShellRegistrar::new(MemoryRegistry::new()),
        );

        let err = uninstaller.uninstall(&mut Silent).unwrap_err();

        assert_eq!(err.failed_step(), Some("load descriptor"));
        assert!(install_dir.join("app.exe").exists());
    }

    #[test]
    fn removes_directory_without_registry_state() {
        let dir = tempdir().unwrap();
        let install_dir = dir.path().join("app");
        fs::create_dir_all(&install_dir).unwrap();
        let manifest = AppManifest::build().name("app").version("1.0").finish();
        fs::write(
            install_dir.join(MANIFEST_ENTRY),
            manifest.to_json().unwrap(),
        )
        .unwrap();
        let uninstaller = Uninstaller::new(
            UninstallConfig::new(&install_dir, dir.path().join("menu")),
            ShellRegistrar::new(MemoryRegistry::new()),
        );

        let outcome = uninstaller.uninstall(&mut Silent).unwrap();

        assert!(matches!(outcome, UninstallOutcome::Removed { name, .. } if name == "app"));
        assert!(!install_dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn relative_install_dir_is_resolved_against_working_dir() {
        let dir = tempdir().unwrap();
        let install_dir = dir.path().join("app");
        fs::create_dir_all(&install_dir).unwrap();
        let manifest = AppManifest::build().name("app").version("1.0").finish();
        fs::write(
            install_dir.join(MANIFEST_ENTRY),
            manifest.to_json().unwrap(),
        )
        .unwrap();
        let mut relative = std::path::PathBuf::new();
        for _ in std::env::current_dir().unwrap().components().skip(1) {
            relative.push("..");
        }
        let relative = relative.join(install_dir.strip_prefix("/").unwrap());
        let uninstaller = Uninstaller::new(
            UninstallConfig::new(relative, dir.path().join("menu")),
            ShellRegistrar::new(MemoryRegistry::new()),
        );

        uninstaller.uninstall(&mut Silent).unwrap();

        assert!(!install_dir.exists());
    }

    #[test]
    fn stale_relaunch_copies_are_removed() {
        let dir = tempdir().unwrap();
        let current = dir.path().join(relaunch_copy_name(7));
        for name in [relaunch_copy_name(1), relaunch_copy_name(7), "other.exe".to_string()] {
            fs::write(dir.path().join(name), b"MZ").unwrap();
        }

        assert_eq!(remove_stale_relaunch_copies(dir.path(), &current), 1);
        assert!(current.exists());
        assert!(dir.path().join("other.exe").exists());
        assert!(!dir.path().join(relaunch_copy_name(1)).exists());
    }
}
