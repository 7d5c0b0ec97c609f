use std::{
    env, fs, io,
    path::Path,
    process::Command,
};

use windows::Win32::UI::Shell::{SHCNE_ASSOCCHANGED, SHCNF_IDLIST, SHChangeNotify};
use windows_registry::CURRENT_USER;
use windows_result::HRESULT;

use crate::{
    integration::{RegistryBackend, RegistryError, RegistryValue},
    uninstaller::{relaunch_copy_name, remove_stale_relaunch_copies},
};

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_ACCESS_DENIED: u32 = 5;

/// Set on the relaunched copy so it does not relaunch again.
pub const RELAUNCHED_ENV: &str = "FROST_SETUP_RELAUNCHED";

/// `HKEY_CURRENT_USER` as a [`RegistryBackend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRegistry;

fn map_error(key: &str) -> impl FnOnce(windows_result::Error) -> RegistryError + '_ {
    move |err| {
        let code = err.code();
        if code == HRESULT::from_win32(ERROR_FILE_NOT_FOUND) {
            RegistryError::NotFound(key.to_string())
        } else if code == HRESULT::from_win32(ERROR_ACCESS_DENIED) {
            RegistryError::AccessDenied(key.to_string())
        } else {
            RegistryError::Other {
                key: key.to_string(),
                message: err.message(),
            }
        }
    }
}

impl RegistryBackend for WindowsRegistry {
    fn set_values(&self, key: &str, values: &[(&str, RegistryValue)]) -> Result<(), RegistryError> {
        let handle = CURRENT_USER.create(key).map_err(map_error(key))?;
        for (name, value) in values {
            match value {
                RegistryValue::String(value) => handle.set_string(*name, value.as_str()),
                RegistryValue::Dword(value) => handle.set_u32(*name, *value),
            }
            .map_err(map_error(key))?;
        }
        Ok(())
    }

    fn delete_tree(&self, key: &str) -> Result<(), RegistryError> {
        CURRENT_USER.remove_tree(key).map_err(map_error(key))
    }

    fn get_value(&self, key: &str, name: &str) -> Result<Option<RegistryValue>, RegistryError> {
        let handle = CURRENT_USER.open(key).map_err(map_error(key))?;
        if let Ok(value) = handle.get_string(name) {
            return Ok(Some(RegistryValue::String(value)));
        }
        match handle.get_u32(name) {
            Ok(value) => Ok(Some(RegistryValue::Dword(value))),
            Err(err) => match map_error(key)(err) {
                RegistryError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    fn key_exists(&self, key: &str) -> Result<bool, RegistryError> {
        match CURRENT_USER.open(key) {
            Ok(_) => Ok(true),
            Err(err) => match map_error(key)(err) {
                RegistryError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

/// Makes Explorer pick up changed context menu entries without a restart.
pub fn notify_association_change() {
    unsafe { SHChangeNotify(SHCNE_ASSOCCHANGED, SHCNF_IDLIST, None, None) };
}

/// Running executables can't be deleted on Windows. If the current executable
/// lives inside `install_dir`, copies it to the temp directory and starts the
/// copy with the same arguments. The caller should exit right after.
///
/// Copies from earlier runs are swept first, the copy started here is removed
/// by the next uninstall that runs.
///
/// Returns `false` when no relaunch is needed.
pub fn relaunch_outside(install_dir: &Path) -> io::Result<bool> {
    let current = env::current_exe()?;
    remove_stale_relaunch_copies(&env::temp_dir(), &current);
    if env::var_os(RELAUNCHED_ENV).is_some() {
        return Ok(false);
    }
    let inside = match (current.canonicalize(), install_dir.canonicalize()) {
        (Ok(current), Ok(install_dir)) => current.starts_with(install_dir),
        _ => false,
    };
    if !inside {
        return Ok(false);
    }

    let copy = env::temp_dir().join(relaunch_copy_name(std::process::id()));
    fs::copy(&current, &copy)?;
    log::info!("relaunching uninstaller from {}", copy.display());

    // The working directory may be the install directory.
    Command::new(&copy)
        .args(env::args_os().skip(1))
        .env(RELAUNCHED_ENV, "1")
        .current_dir(env::temp_dir())
        .spawn()?;
    Ok(true)
}
