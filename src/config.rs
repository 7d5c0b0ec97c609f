use std::path::{Path, PathBuf};

mod manifest;
pub use manifest::{
    AppManifest, AppManifestBuilder, AppManifestConfig, ContextMenuCommand, ContextMenuEntry,
    DescriptorError, MANIFEST_ENTRY, ResolvedContextMenuEntry, ResolvedManifest, UNINSTALL_ROOT,
    ValidationIssue,
};

/// File name of the payload-free installer copy placed in the install directory.
pub const UNINSTALLER_NAME: &str = "uninstall.exe";

/// Where the install archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    /// An executable with the archive appended as payload, usually the running installer.
    Carrier(PathBuf),
    /// A plain zip file next to the installer.
    External(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallDir {
    /// Install into exactly this directory.
    Exact(PathBuf),
    /// Install into a directory named after the application below this one.
    Under(PathBuf),
}

impl InstallDir {
    pub fn for_app(&self, app_name: &str) -> PathBuf {
        match self {
            InstallDir::Exact(path) => path.clone(),
            InstallDir::Under(root) => root.join(app_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallConfig {
    pub archive: ArchiveSource,
    pub install_dir: InstallDir,
    pub start_menu_dir: PathBuf,
    /// Executable whose program image is copied into the install directory
    /// and registered as uninstaller.
    pub uninstaller_source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct UninstallConfig {
    pub install_dir: PathBuf,
    pub start_menu_dir: PathBuf,
}

impl UninstallConfig {
    pub fn new(install_dir: impl Into<PathBuf>, start_menu_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            start_menu_dir: start_menu_dir.into(),
        }
    }
}

pub type InstallConfigBuilder = ConfigBuilder<ArchiveSource, InstallDir>;

impl InstallConfig {
    pub fn build() -> ConfigBuilder<(), ()> {
        ConfigBuilder {
            archive: (),
            install_dir: (),
            start_menu_dir: None,
            uninstaller_source: None,
        }
    }
}

pub struct ConfigBuilder<A, B> {
    archive: A,
    install_dir: B,
    start_menu_dir: Option<PathBuf>,
    uninstaller_source: Option<PathBuf>,
}

impl<A, B> ConfigBuilder<A, B> {
    pub fn archive(self, archive: ArchiveSource) -> ConfigBuilder<ArchiveSource, B> {
        ConfigBuilder {
            archive,
            install_dir: self.install_dir,
            start_menu_dir: self.start_menu_dir,
            uninstaller_source: self.uninstaller_source,
        }
    }

    pub fn install_dir(self, install_dir: InstallDir) -> ConfigBuilder<A, InstallDir> {
        ConfigBuilder {
            archive: self.archive,
            install_dir,
            start_menu_dir: self.start_menu_dir,
            uninstaller_source: self.uninstaller_source,
        }
    }

    pub fn start_menu_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.start_menu_dir = Some(path.into());
        self
    }

    pub fn uninstaller_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.uninstaller_source = Some(path.into());
        self
    }
}

impl InstallConfigBuilder {
    /// Falls back to the user's start menu when no directory was given.
    /// Returns `None` if neither is known.
    pub fn finish(self) -> Option<InstallConfig> {
        let start_menu_dir = self.start_menu_dir.or_else(known_dirs::start_menu_programs)?;
        Some(InstallConfig {
            archive: self.archive,
            install_dir: self.install_dir,
            start_menu_dir,
            uninstaller_source: self.uninstaller_source,
        })
    }
}

/// Per-user locations, looked up through the environment like the shell does.
pub mod known_dirs {
    use super::*;

    /// `%APPDATA%\Microsoft\Windows\Start Menu\Programs`
    pub fn start_menu_programs() -> Option<PathBuf> {
        let app_data = std::env::var_os("APPDATA")?;
        Some(
            Path::new(&app_data)
                .join("Microsoft")
                .join("Windows")
                .join("Start Menu")
                .join("Programs"),
        )
    }

    /// `%LOCALAPPDATA%\Programs`, the per-user counterpart of `Program Files`.
    pub fn user_programs() -> Option<PathBuf> {
        let local_app_data = std::env::var_os("LOCALAPPDATA")?;
        Some(Path::new(&local_app_data).join("Programs"))
    }
}
