use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::link_file::ShellLink;

pub mod registry;
pub use registry::{DEFAULT_VALUE, MemoryRegistry, RegistryBackend, RegistryError, RegistryValue};

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("failed to register {key}: {source}")]
    Registration {
        key: String,
        #[source]
        source: RegistryError,
    },
    #[error("permission denied removing {0}")]
    PermissionDenied(String),
    #[error("shortcut {}: {source}", path.display())]
    Shortcut {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Values of an "Add or Remove Programs" entry.
#[derive(Debug, Clone)]
pub struct UninstallEntry<'a> {
    pub key: &'a str,
    pub name: &'a str,
    pub version: &'a str,
    pub publisher: &'a str,
    pub install_dir: &'a Path,
    pub uninstall_command: &'a str,
    pub display_icon: Option<&'a Path>,
    pub estimated_size_kib: Option<u32>,
}

/// Everything the installer changes outside of the install directory.
///
/// Adding overwrites, removing something that is already gone succeeds.
pub trait SystemRegistrar {
    fn register_uninstall_entry(&self, entry: &UninstallEntry<'_>)
    -> Result<(), IntegrationError>;

    fn unregister_uninstall_entry(&self, key: &str) -> Result<(), IntegrationError>;

    fn add_context_menu_entry(
        &self,
        label: &str,
        command: &str,
        file_pattern: &str,
        icon: &Path,
    ) -> Result<(), IntegrationError>;

    fn remove_context_menu_entry(
        &self,
        label: &str,
        file_pattern: &str,
    ) -> Result<(), IntegrationError>;

    fn add_start_menu_shortcut(
        &self,
        target: &Path,
        icon: &Path,
        shortcut: &Path,
        icon_index: i32,
    ) -> Result<(), IntegrationError>;

    fn remove_start_menu_shortcut(&self, shortcut: &Path) -> Result<(), IntegrationError>;

    /// Tells the shell that file associations changed.
    fn notify_shell(&self) {}
}

impl<T: SystemRegistrar + ?Sized> SystemRegistrar for &T {
    fn register_uninstall_entry(
        &self,
        entry: &UninstallEntry<'_>,
    ) -> Result<(), IntegrationError> {
        (**self).register_uninstall_entry(entry)
    }

    fn unregister_uninstall_entry(&self, key: &str) -> Result<(), IntegrationError> {
        (**self).unregister_uninstall_entry(key)
    }

    fn add_context_menu_entry(
        &self,
        label: &str,
        command: &str,
        file_pattern: &str,
        icon: &Path,
    ) -> Result<(), IntegrationError> {
        (**self).add_context_menu_entry(label, command, file_pattern, icon)
    }

    fn remove_context_menu_entry(
        &self,
        label: &str,
        file_pattern: &str,
    ) -> Result<(), IntegrationError> {
        (**self).remove_context_menu_entry(label, file_pattern)
    }

    fn add_start_menu_shortcut(
        &self,
        target: &Path,
        icon: &Path,
        shortcut: &Path,
        icon_index: i32,
    ) -> Result<(), IntegrationError> {
        (**self).add_start_menu_shortcut(target, icon, shortcut, icon_index)
    }

    fn remove_start_menu_shortcut(&self, shortcut: &Path) -> Result<(), IntegrationError> {
        (**self).remove_start_menu_shortcut(shortcut)
    }

    fn notify_shell(&self) {
        (**self).notify_shell()
    }
}

/// Registry key of a context menu entry, relative to HKCU.
///
/// `*` applies to every file, `*.ext` to one extension through
/// `SystemFileAssociations`, anything else (`Directory`, a ProgID) is used as
/// the class name.
pub fn context_menu_key(file_pattern: &str, label: &str) -> String {
    let class = match file_pattern {
        "*" => "*".to_string(),
        pattern => match pattern.strip_prefix("*.") {
            Some(extension) => format!(r"SystemFileAssociations\.{extension}"),
            None => pattern.to_string(),
        },
    };
    format!(r"Software\Classes\{class}\shell\{label}")
}

/// The registrar used for real installs: registry values go through a
/// [`RegistryBackend`], shortcuts are written as `.lnk` files.
pub struct ShellRegistrar<B> {
    registry: B,
}

impl<B: RegistryBackend> ShellRegistrar<B> {
    pub fn new(registry: B) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &B {
        &self.registry
    }

    fn remove_tree(&self, key: &str) -> Result<(), IntegrationError> {
        match self.registry.delete_tree(key) {
            Ok(()) => {
                log::info!("removed registry key {}", key);
                Ok(())
            }
            Err(RegistryError::NotFound(_)) => {
                log::debug!("registry key {} already absent", key);
                Ok(())
            }
            Err(RegistryError::AccessDenied(_)) => {
                Err(IntegrationError::PermissionDenied(key.to_string()))
            }
            Err(source) => Err(IntegrationError::Registration {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set_values(&self, key: &str, values: &[(&str, RegistryValue)]) -> Result<(), IntegrationError> {
        self.registry
            .set_values(key, values)
            .map_err(|source| IntegrationError::Registration {
                key: key.to_string(),
                source,
            })
    }
}

impl<B: RegistryBackend> SystemRegistrar for ShellRegistrar<B> {
    fn register_uninstall_entry(
        &self,
        entry: &UninstallEntry<'_>,
    ) -> Result<(), IntegrationError> {
        let mut values: Vec<(&str, RegistryValue)> = vec![
            ("DisplayName", entry.name.into()),
            ("DisplayVersion", entry.version.into()),
            ("Publisher", entry.publisher.into()),
            (
                "InstallLocation",
                entry.install_dir.display().to_string().into(),
            ),
            ("UninstallString", entry.uninstall_command.into()),
            ("NoModify", 1u32.into()),
            ("NoRepair", 1u32.into()),
        ];
        if let Some(icon) = entry.display_icon {
            values.push(("DisplayIcon", icon.display().to_string().into()));
        }
        if let Some(size) = entry.estimated_size_kib {
            values.push(("EstimatedSize", size.into()));
        }

        self.set_values(entry.key, &values)?;
        log::info!("registered uninstall entry {}", entry.key);
        Ok(())
    }

    fn unregister_uninstall_entry(&self, key: &str) -> Result<(), IntegrationError> {
        self.remove_tree(key)
    }

    fn add_context_menu_entry(
        &self,
        label: &str,
        command: &str,
        file_pattern: &str,
        icon: &Path,
    ) -> Result<(), IntegrationError> {
        let key = context_menu_key(file_pattern, label);
        self.set_values(
            &key,
            &[
                (DEFAULT_VALUE, label.into()),
                ("Icon", icon.display().to_string().into()),
            ],
        )?;
        self.set_values(&format!(r"{key}\command"), &[(DEFAULT_VALUE, command.into())])?;
        log::info!("added context menu entry {:?} for {:?}", label, file_pattern);
        Ok(())
    }

    fn remove_context_menu_entry(
        &self,
        label: &str,
        file_pattern: &str,
    ) -> Result<(), IntegrationError> {
        self.remove_tree(&context_menu_key(file_pattern, label))
    }

    fn add_start_menu_shortcut(
        &self,
        target: &Path,
        icon: &Path,
        shortcut: &Path,
        icon_index: i32,
    ) -> Result<(), IntegrationError> {
        let shortcut_error = |source| IntegrationError::Shortcut {
            path: shortcut.to_path_buf(),
            source,
        };
        if let Some(parent) = shortcut.parent() {
            fs::create_dir_all(parent).map_err(shortcut_error)?;
        }
        ShellLink::new(target)
            .icon(icon, icon_index)
            .save(shortcut)
            .map_err(shortcut_error)?;
        log::info!("created shortcut {}", shortcut.display());
        Ok(())
    }

    fn remove_start_menu_shortcut(&self, shortcut: &Path) -> Result<(), IntegrationError> {
        match fs::remove_file(shortcut) {
            Ok(()) => {
                log::info!("removed shortcut {}", shortcut.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Err(
                IntegrationError::PermissionDenied(shortcut.display().to_string()),
            ),
            Err(source) => Err(IntegrationError::Shortcut {
                path: shortcut.to_path_buf(),
                source,
            }),
        }
    }

    fn notify_shell(&self) {
        #[cfg(windows)]
        crate::windows::notify_association_change();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_file::ShellLink;
    use tempfile::tempdir;

    fn registrar() -> ShellRegistrar<MemoryRegistry> {
        ShellRegistrar::new(MemoryRegistry::new())
    }

    #[test]
    fn context_menu_keys() {
        assert_eq!(
            context_menu_key("*", "encrypt"),
            r"Software\Classes\*\shell\encrypt"
        );
        assert_eq!(
            context_menu_key("*.txt", "Open with beeper"),
            r"Software\Classes\SystemFileAssociations\.txt\shell\Open with beeper"
        );
        assert_eq!(
            context_menu_key("Directory", "scan"),
            r"Software\Classes\Directory\shell\scan"
        );
    }

    #[test]
    fn context_menu_entry_layout() {
        let registrar = registrar();
        registrar
            .add_context_menu_entry("encrypt", "\"app.exe\" \"%1\"", "*", Path::new("icon.ico"))
            .unwrap();

        let key = r"Software\Classes\*\shell\encrypt";
        let registry = registrar.registry();
        assert_eq!(
            registry.get_value(key, DEFAULT_VALUE).unwrap(),
            Some("encrypt".into())
        );
        assert_eq!(
            registry.get_value(key, "Icon").unwrap(),
            Some("icon.ico".into())
        );
        assert_eq!(
            registry
                .get_value(&format!(r"{key}\command"), DEFAULT_VALUE)
                .unwrap(),
            Some("\"app.exe\" \"%1\"".into())
        );
    }

    #[test]
    fn same_label_and_pattern_overwrites() {
        let registrar = registrar();
        let icon = Path::new("icon.ico");
        registrar
            .add_context_menu_entry("open", "first", "*", icon)
            .unwrap();
        registrar
            .add_context_menu_entry("open", "second", "*", icon)
            .unwrap();

        assert_eq!(
            registrar
                .registry()
                .get_value(r"Software\Classes\*\shell\open\command", DEFAULT_VALUE)
                .unwrap(),
            Some("second".into())
        );
    }

    #[test]
    fn removals_are_idempotent() {
        let registrar = registrar();
        let dir = tempdir().unwrap();
        let shortcut = dir.path().join("menu").join("app.lnk");
        let target = dir.path().join("app.exe");
        fs::write(&target, b"exe").unwrap();

        registrar
            .add_context_menu_entry("encrypt", "cmd", "*", Path::new("i.ico"))
            .unwrap();
        registrar
            .add_start_menu_shortcut(&target, &target, &shortcut, 0)
            .unwrap();
        registrar
            .register_uninstall_entry(&UninstallEntry {
                key: r"Software\Microsoft\Windows\CurrentVersion\Uninstall\app",
                name: "app",
                version: "1",
                publisher: "me",
                install_dir: dir.path(),
                uninstall_command: "uninstall.exe",
                display_icon: None,
                estimated_size_kib: None,
            })
            .unwrap();

        for _ in 0..2 {
            registrar.remove_context_menu_entry("encrypt", "*").unwrap();
            registrar.remove_start_menu_shortcut(&shortcut).unwrap();
            registrar
                .unregister_uninstall_entry(r"Software\Microsoft\Windows\CurrentVersion\Uninstall\app")
                .unwrap();
        }

        assert!(registrar.registry().keys().is_empty());
        assert!(!shortcut.exists());
    }

    #[test]
    fn denied_removal_is_permission_denied() {
        let registrar = registrar();
        registrar
            .add_context_menu_entry("encrypt", "cmd", "*", Path::new("i.ico"))
            .unwrap();
        registrar.registry().deny_access(r"Software\Classes");

        assert!(matches!(
            registrar.remove_context_menu_entry("encrypt", "*"),
            Err(IntegrationError::PermissionDenied(_))
        ));
    }

    #[test]
    fn denied_registration_is_a_registration_error() {
        let registrar = registrar();
        registrar.registry().deny_access(r"Software\Microsoft");

        let result = registrar.register_uninstall_entry(&UninstallEntry {
            key: r"Software\Microsoft\Windows\CurrentVersion\Uninstall\app",
            name: "app",
            version: "1",
            publisher: "me",
            install_dir: Path::new("/apps/app"),
            uninstall_command: "uninstall.exe",
            display_icon: None,
            estimated_size_kib: None,
        });

        assert!(matches!(
            result,
            Err(IntegrationError::Registration {
                source: RegistryError::AccessDenied(_),
                ..
            })
        ));
    }

    #[test]
    fn shortcut_points_at_target() {
        let registrar = registrar();
        let dir = tempdir().unwrap();
        let target = dir.path().join("app.exe");
        let icon = dir.path().join("app.ico");
        let shortcut = dir.path().join("Programs").join("app.lnk");

        registrar
            .add_start_menu_shortcut(&target, &icon, &shortcut, 2)
            .unwrap();

        let link = ShellLink::read(&mut fs::File::open(&shortcut).unwrap()).unwrap();
        assert_eq!(link.target, target.display().to_string());
        assert_eq!(link.icon_location, Some(icon.display().to_string()));
        assert_eq!(link.icon_index, 2);
    }
}
