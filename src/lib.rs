pub mod archive;
pub mod config;
mod error;
pub mod installer;
pub mod installer_creator;
pub mod integration;
pub mod link_file;
pub mod post_embed;
pub mod uninstaller;
#[cfg(windows)]
pub mod windows;

pub use config::{AppManifest, InstallConfig, UninstallConfig};
pub use error::Error;
pub use installer::Installer;
pub use uninstaller::Uninstaller;
