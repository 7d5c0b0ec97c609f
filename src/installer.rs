use std::{
    fs,
    path::{self, Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::{
    Error, archive,
    config::{
        AppManifest, ArchiveSource, InstallConfig, MANIFEST_ENTRY, ResolvedManifest,
        UNINSTALLER_NAME,
    },
    integration::{SystemRegistrar, UninstallEntry},
    post_embed,
};

mod events;
pub use events::{InstallEvent, InstallObserver, InstallReport, Silent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallState {
    Idle,
    ArchiveLocated,
    DescriptorLoaded,
    Unpacked,
    Registered,
    MenuEntriesAdded,
    ShortcutAdded,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    LocateArchive,
    LoadDescriptor,
    ResolvePaths,
    Unpack,
    RegisterUninstallEntry,
    AddContextMenuEntries,
    AddShortcut,
}

impl InstallStep {
    /// Every step in the order it runs.
    pub const ALL: [InstallStep; 7] = [
        InstallStep::LocateArchive,
        InstallStep::LoadDescriptor,
        InstallStep::ResolvePaths,
        InstallStep::Unpack,
        InstallStep::RegisterUninstallEntry,
        InstallStep::AddContextMenuEntries,
        InstallStep::AddShortcut,
    ];

    pub fn name(self) -> &'static str {
        match self {
            InstallStep::LocateArchive => "locate archive",
            InstallStep::LoadDescriptor => "load descriptor",
            InstallStep::ResolvePaths => "resolve paths",
            InstallStep::Unpack => "unpack",
            InstallStep::RegisterUninstallEntry => "register uninstall entry",
            InstallStep::AddContextMenuEntries => "add context menu entries",
            InstallStep::AddShortcut => "add start menu shortcut",
        }
    }

    /// State reached once this step succeeded.
    pub fn reaches(self) -> InstallState {
        match self {
            InstallStep::LocateArchive => InstallState::ArchiveLocated,
            InstallStep::LoadDescriptor | InstallStep::ResolvePaths => {
                InstallState::DescriptorLoaded
            }
            InstallStep::Unpack => InstallState::Unpacked,
            InstallStep::RegisterUninstallEntry => InstallState::Registered,
            InstallStep::AddContextMenuEntries => InstallState::MenuEntriesAdded,
            InstallStep::AddShortcut => InstallState::ShortcutAdded,
        }
    }
}

/// The archive to install from. A payload extracted from a carrier lives in a
/// temporary file that is removed again by [`LocatedArchive::close`].
enum LocatedArchive {
    Extracted(NamedTempFile),
    External(PathBuf),
}

impl LocatedArchive {
    fn path(&self) -> &Path {
        match self {
            LocatedArchive::Extracted(file) => file.path(),
            LocatedArchive::External(path) => path,
        }
    }

    fn close(self) -> Result<(), Error> {
        match self {
            LocatedArchive::Extracted(file) => {
                let path = file.path().to_path_buf();
                file.close().map_err(Error::io(path))
            }
            LocatedArchive::External(_) => Ok(()),
        }
    }
}

/// Paths derived from the descriptor and the install directory.
struct Target {
    manifest: ResolvedManifest,
    uninstaller: PathBuf,
    shortcut: PathBuf,
}

/// Runs an installation from start to finish.
///
/// There is no rollback. When a step fails, the effects of earlier steps stay
/// in place and the error names the failed step.
pub struct Installer<R> {
    config: InstallConfig,
    registrar: R,
    state: InstallState,
}

impl<R: SystemRegistrar> Installer<R> {
    pub fn new(config: InstallConfig, registrar: R) -> Self {
        Self {
            config,
            registrar,
            state: InstallState::Idle,
        }
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn install(
        &mut self,
        observer: &mut dyn InstallObserver,
    ) -> Result<InstallReport, Error> {
        let archive = self.run_step(InstallStep::LocateArchive, observer, |this, _| {
            this.locate_archive()
        })?;
        let result = self.install_from(archive.path(), observer);
        // The extracted payload has to go on every path.
        let closed = archive.close();
        let report = result?;
        closed?;

        self.state = InstallState::Complete;
        log::info!(
            "installed {} into {}",
            report.uninstall_key,
            report.install_dir.display()
        );
        observer.on_event(InstallEvent::Done(report.clone()));
        Ok(report)
    }

    fn install_from(
        &mut self,
        archive: &Path,
        observer: &mut dyn InstallObserver,
    ) -> Result<InstallReport, Error> {
        let manifest = self.run_step(InstallStep::LoadDescriptor, observer, |_, _| {
            load_descriptor(archive)
        })?;
        let target = self.run_step(InstallStep::ResolvePaths, observer, |this, _| {
            this.resolve(&manifest)
        })?;
        let installed_bytes = self.run_step(InstallStep::Unpack, observer, |this, observer| {
            this.unpack(archive, &target, observer)
        })?;
        self.run_step(InstallStep::RegisterUninstallEntry, observer, |this, _| {
            this.register(&target, installed_bytes)
        })?;
        self.run_step(InstallStep::AddContextMenuEntries, observer, |this, _| {
            this.add_context_menu_entries(&target.manifest)
        })?;
        self.run_step(InstallStep::AddShortcut, observer, |this, _| {
            this.registrar.add_start_menu_shortcut(
                &target.manifest.executable_path,
                &target.manifest.icon_path,
                &target.shortcut,
                0,
            )?;
            Ok(())
        })?;

        Ok(InstallReport {
            install_dir: target.manifest.install_root.clone(),
            uninstall_key: target.manifest.uninstall_key(),
            shortcut: target.shortcut,
            context_menu_entries: target.manifest.context_menu_entries.len(),
            installed_bytes,
        })
    }

    fn run_step<T>(
        &mut self,
        step: InstallStep,
        observer: &mut dyn InstallObserver,
        run: impl FnOnce(&Self, &mut dyn InstallObserver) -> Result<T, Error>,
    ) -> Result<T, Error> {
        log::debug!("install step: {}", step.name());
        observer.on_event(InstallEvent::StepStarted(step.name()));
        let value = run(self, observer).map_err(|source| {
            log::error!("install step '{}' failed: {}", step.name(), source);
            Error::OperationFailed {
                step: step.name(),
                source: Box::new(source),
            }
        })?;
        self.state = step.reaches();
        observer.on_event(InstallEvent::StepFinished(step.name()));
        Ok(value)
    }

    fn locate_archive(&self) -> Result<LocatedArchive, Error> {
        match &self.config.archive {
            ArchiveSource::External(path) => {
                if !path.is_file() {
                    return Err(Error::io(path)(std::io::ErrorKind::NotFound.into()));
                }
                Ok(LocatedArchive::External(path.clone()))
            }
            ArchiveSource::Carrier(carrier) => {
                let file = tempfile::Builder::new()
                    .prefix("frost_setup")
                    .suffix(".zip")
                    .tempfile()
                    .map_err(Error::io(std::env::temp_dir()))?;
                let span = post_embed::extract(carrier, file.path())?;
                log::info!(
                    "found {} byte payload in {}",
                    span.len,
                    carrier.display()
                );
                Ok(LocatedArchive::Extracted(file))
            }
        }
    }

    /// Registry values and shortcuts outlive the working directory, so both
    /// roots are made absolute first.
    fn resolve(&self, manifest: &AppManifest) -> Result<Target, Error> {
        let install_dir = self.config.install_dir.for_app(&manifest.name);
        let install_dir = path::absolute(&install_dir).map_err(Error::io(&install_dir))?;
        let start_menu_dir = &self.config.start_menu_dir;
        let start_menu_dir =
            path::absolute(start_menu_dir).map_err(Error::io(start_menu_dir))?;

        let manifest = manifest.resolve_paths(&install_dir);
        Ok(Target {
            uninstaller: install_dir.join(UNINSTALLER_NAME),
            shortcut: start_menu_dir.join(manifest.shortcut_file_name()),
            manifest,
        })
    }

    fn unpack(
        &self,
        archive: &Path,
        target: &Target,
        observer: &mut dyn InstallObserver,
    ) -> Result<u64, Error> {
        let install_dir = &target.manifest.install_root;
        let mut installed = archive::unpack(archive, install_dir, |progress| {
            observer.on_event(InstallEvent::Progress(progress.fraction()))
        })?;

        if let Some(source) = &self.config.uninstaller_source {
            installed += self.copy_uninstaller(source, &target.uninstaller)?;
            log::info!("uninstaller written to {}", target.uninstaller.display());
        }
        Ok(installed)
    }

    /// The running carrier is copied without its payload, any other
    /// executable as it is.
    fn copy_uninstaller(&self, source: &Path, destination: &Path) -> Result<u64, Error> {
        match &self.config.archive {
            ArchiveSource::Carrier(carrier) if carrier == source => {
                Ok(post_embed::copy_program_image(source, destination)?)
            }
            _ => fs::copy(source, destination).map_err(Error::io(destination)),
        }
    }

    fn register(&self, target: &Target, installed_bytes: u64) -> Result<(), Error> {
        let manifest = &target.manifest;
        let uninstall_command = format!(
            "\"{}\" uninstall --install-dir \"{}\"",
            target.uninstaller.display(),
            manifest.install_root.display()
        );
        let key = manifest.uninstall_key();
        self.registrar.register_uninstall_entry(&UninstallEntry {
            key: &key,
            name: &manifest.name,
            version: &manifest.version,
            publisher: &manifest.publisher,
            install_dir: &manifest.install_root,
            uninstall_command: &uninstall_command,
            display_icon: Some(&manifest.icon_path),
            estimated_size_kib: Some(
                u32::try_from(installed_bytes.div_ceil(1024)).unwrap_or(u32::MAX),
            ),
        })?;
        Ok(())
    }

    fn add_context_menu_entries(&self, manifest: &ResolvedManifest) -> Result<(), Error> {
        let commands = manifest.commands();
        for command in &commands {
            self.registrar.add_context_menu_entry(
                &command.label,
                &command.command,
                &command.file_pattern,
                &command.icon_path,
            )?;
        }
        if !commands.is_empty() {
            self.registrar.notify_shell();
        }
        Ok(())
    }
}

/// Pulls the manifest out of the archive and parses it. The temporary copy is
/// deleted before returning.
fn load_descriptor(archive: &Path) -> Result<AppManifest, Error> {
    let entry = archive::extract_single_entry(archive, MANIFEST_ENTRY)?;
    let manifest = AppManifest::load(entry.path());
    entry.close()?;
    let manifest = manifest?;
    log::info!("loaded manifest for {} {}", manifest.name, manifest.version);
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::InstallDir,
        integration::{MemoryRegistry, ShellRegistrar, registry::RegistryBackend},
    };
    use std::{fs::File, io::Write};
    use tempfile::tempdir;
    use zip::{ZipWriter, write::SimpleFileOptions};

    const MANIFEST: &str = r#"{
        "Name": "beeper",
        "Version": "1.2.0",
        "Publisher": "Beeper Inc",
        "IconPath": "beeper.ico",
        "ExecutablePath": "beeper.exe",
        "RegId": "beeper",
        "ContextualMenuEntries": [
            { "FilePattern": "*.txt", "Arguments": "\"%1\"", "IconPath": "beeper.ico", "Label": "Beep" }
        ]
    }"#;

    fn write_archive(path: &Path, manifest: &str) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in [
            (MANIFEST_ENTRY, manifest.as_bytes()),
            ("beeper.exe", b"exe".as_slice()),
            ("beeper.ico", b"ico".as_slice()),
        ] {
            zip.start_file(name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn steps_reach_states_in_order() {
        let states: Vec<_> = InstallStep::ALL.iter().map(|step| step.reaches()).collect();
        let mut sorted = states.clone();
        sorted.sort();
        assert_eq!(states, sorted);
        assert_eq!(states.last(), Some(&InstallState::ShortcutAdded));
    }

    #[test]
    fn install_reports_events_and_state() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("beeper.zip");
        write_archive(&archive, MANIFEST);
        let config = InstallConfig::build()
            .archive(ArchiveSource::External(archive))
            .install_dir(InstallDir::Under(dir.path().join("Programs")))
            .start_menu_dir(dir.path().join("Start Menu"))
            .finish()
            .unwrap();
        let registry = MemoryRegistry::new();
        let mut installer = Installer::new(config, ShellRegistrar::new(&registry));

        let mut events = Vec::new();
        let report = installer
            .install(&mut |event: InstallEvent| events.push(event))
            .unwrap();

        assert_eq!(installer.state(), InstallState::Complete);
        assert_eq!(report.install_dir, dir.path().join("Programs").join("beeper"));
        assert_eq!(report.context_menu_entries, 1);
        assert_eq!(
            events.first(),
            Some(&InstallEvent::StepStarted("locate archive"))
        );
        assert!(events.contains(&InstallEvent::Progress(1.0)));
        assert_eq!(events.last(), Some(&InstallEvent::Done(report)));
    }

    #[test]
    fn invalid_manifest_stops_before_unpacking() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        write_archive(
            &archive,
            &MANIFEST.replace(r#""ContextualMenuEntries": ["#, r#""ContextualMenuEntries": [null,"#),
        );
        let config = InstallConfig::build()
            .archive(ArchiveSource::External(archive))
            .install_dir(InstallDir::Exact(dir.path().join("beeper")))
            .start_menu_dir(dir.path().join("menu"))
            .finish()
            .unwrap();
        let registry = MemoryRegistry::new();
        let mut installer = Installer::new(config, ShellRegistrar::new(&registry));

        let err = installer.install(&mut Silent).unwrap_err();

        assert_eq!(err.failed_step(), Some("load descriptor"));
        assert_eq!(installer.state(), InstallState::ArchiveLocated);
        assert!(!dir.path().join("beeper").exists());
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn missing_archive_fails_first_step() {
        let dir = tempdir().unwrap();
        let config = InstallConfig::build()
            .archive(ArchiveSource::External(dir.path().join("missing.zip")))
            .install_dir(InstallDir::Exact(dir.path().join("beeper")))
            .start_menu_dir(dir.path().join("menu"))
            .finish()
            .unwrap();
        let mut installer = Installer::new(config, ShellRegistrar::new(MemoryRegistry::new()));

        let err = installer.install(&mut Silent).unwrap_err();

        assert_eq!(err.failed_step(), Some("locate archive"));
        assert_eq!(installer.state(), InstallState::Idle);
    }

    /// `path` spelled relative to the working directory, without changing it.
    fn relative_to_cwd(path: &Path) -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        let mut relative = PathBuf::new();
        for _ in cwd.components().skip(1) {
            relative.push("..");
        }
        relative.join(path.strip_prefix("/").unwrap())
    }

    #[cfg(unix)]
    #[test]
    fn relative_install_dir_is_made_absolute() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("beeper.zip");
        write_archive(&archive, MANIFEST);
        let relative = relative_to_cwd(&dir.path().join("beeper"));
        assert!(relative.is_relative());
        let config = InstallConfig::build()
            .archive(ArchiveSource::External(archive))
            .install_dir(InstallDir::Exact(relative))
            .start_menu_dir(relative_to_cwd(&dir.path().join("menu")))
            .finish()
            .unwrap();
        let registry = MemoryRegistry::new();
        let mut installer = Installer::new(config, ShellRegistrar::new(&registry));

        let report = installer.install(&mut Silent).unwrap();

        assert!(report.install_dir.is_absolute());
        assert!(report.shortcut.is_absolute());
        assert!(report.install_dir.join("beeper.exe").is_file());
        let key = r"Software\Microsoft\Windows\CurrentVersion\Uninstall\beeper";
        for name in ["InstallLocation", "DisplayIcon"] {
            let value = registry.get_value(key, name).unwrap().unwrap().to_string();
            assert!(Path::new(&value).is_absolute(), "{name} = {value}");
        }
        let command = registry
            .get_value(r"Software\Classes\SystemFileAssociations\.txt\shell\Beep\command", "")
            .unwrap()
            .unwrap()
            .to_string();
        assert!(command.starts_with(&format!("\"{}", report.install_dir.display())));
    }
}
