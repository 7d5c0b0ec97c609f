use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    archive::{self, ArchiveError},
    config::{AppManifest, ContextMenuEntry, DescriptorError, MANIFEST_ENTRY},
    post_embed::{self, FrameError},
};

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

#[derive(Debug, Error)]
pub enum CreateInstallerError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cargo.toml error: {0}")]
    CargoToml(#[from] cargo_toml::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("manifest encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{} contains no {MANIFEST_ENTRY} and no Cargo.toml was given", .0.display())]
    MissingManifest(PathBuf),
    #[error("generated manifest is invalid: {0:?}")]
    InvalidMetadata(Vec<String>),
}

impl CreateInstallerError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> CreateInstallerError + '_ {
        move |source| CreateInstallerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
struct Metadata {
    frost_setup: Option<SetupMetadata>,
}

/// `[package.metadata.frost_setup]`
#[derive(Deserialize, Clone, Debug, Default)]
struct SetupMetadata {
    friendly_name: Option<String>,
    publisher: Option<String>,
    icon: Option<String>,
    executable: Option<String>,
    reg_id: Option<String>,
    #[serde(default)]
    context_menu: Vec<MenuMetadata>,
}

#[derive(Deserialize, Clone, Debug)]
struct MenuMetadata {
    file_pattern: String,
    label: String,
    #[serde(default = "default_arguments")]
    arguments: String,
    icon: Option<String>,
}

fn default_arguments() -> String {
    "\"%1\"".to_string()
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub source_dir: PathBuf,
    pub out: PathBuf,
    /// Executable the payload is appended to.
    pub base: PathBuf,
    /// Generate `install.json` from this crate's package metadata.
    pub cargo_manifest: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PackReport {
    pub manifest: AppManifest,
    pub unpacked_size: u64,
    pub payload_size: u64,
}

/// Builds a self-extracting installer: a copy of the base executable with the
/// zipped source directory appended.
pub fn create_installer(options: &PackOptions) -> Result<PackReport, CreateInstallerError> {
    let generated = match &options.cargo_manifest {
        Some(cargo_manifest) => {
            println!("Reading metadata from {}", cargo_manifest.display());
            Some(manifest_from_cargo(cargo_manifest)?)
        }
        None => None,
    };
    let manifest = match &generated {
        Some(manifest) => manifest.clone(),
        None => {
            let path = options.source_dir.join(MANIFEST_ENTRY);
            if !path.is_file() {
                return Err(CreateInstallerError::MissingManifest(
                    options.source_dir.clone(),
                ));
            }
            AppManifest::load(&path)?
        }
    };

    println!("Building installer for:\n{}\n{}", manifest.name, manifest.version);

    if is_carrier(&options.base)? {
        println!("Stripping existing payload from {}", options.base.display());
        post_embed::copy_program_image(&options.base, &options.out)?;
    } else {
        fs::copy(&options.base, &options.out).map_err(CreateInstallerError::io(&options.out))?;
    }

    println!("Zipping {}", options.source_dir.display());
    let zip_file = tempfile::Builder::new()
        .prefix("frost_setup")
        .suffix(".zip")
        .tempfile()
        .map_err(CreateInstallerError::io(&options.out))?;
    let unpacked_size = match &generated {
        Some(manifest) => {
            let json = manifest.to_json()?;
            archive::pack_directory_with(
                &options.source_dir,
                zip_file.path(),
                &[(MANIFEST_ENTRY, json.as_bytes())],
            )?
        }
        None => archive::pack_directory(&options.source_dir, zip_file.path())?,
    };

    println!("Embedding payload");
    let payload_size = post_embed::append(&options.out, zip_file.path())?;
    let zip_path = zip_file.path().to_path_buf();
    zip_file
        .close()
        .map_err(CreateInstallerError::io(&zip_path))?;

    println!("Installer saved to {}", options.out.display());

    Ok(PackReport {
        manifest,
        unpacked_size,
        payload_size,
    })
}

/// Whether `path` already carries a zip payload, e.g. an installer reused as
/// base executable.
pub fn is_carrier(path: &Path) -> Result<bool, CreateInstallerError> {
    let span = match post_embed::payload_span(path) {
        Ok(span) => span,
        Err(FrameError::CorruptFormat { .. }) => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    if span.len < ZIP_MAGIC.len() as u64 {
        return Ok(false);
    }

    let mut file = File::open(path).map_err(CreateInstallerError::io(path))?;
    let mut magic = [0u8; 4];
    file.seek(SeekFrom::Start(span.offset))
        .and_then(|_| file.read_exact(&mut magic))
        .map_err(CreateInstallerError::io(path))?;
    Ok(&magic == ZIP_MAGIC)
}

/// Derives an install manifest from a crate's `Cargo.toml`.
pub fn manifest_from_cargo(path: &Path) -> Result<AppManifest, CreateInstallerError> {
    let cargo_manifest = cargo_toml::Manifest::<Metadata>::from_path_with_metadata(path)?;
    let package = cargo_manifest.package();
    let metadata = package
        .metadata
        .clone()
        .and_then(|metadata| metadata.frost_setup)
        .unwrap_or_default();

    let bin_name = cargo_manifest
        .bin
        .first()
        .and_then(|bin| bin.name.clone())
        .unwrap_or_else(|| package.name.clone());
    let name = metadata.friendly_name.unwrap_or_else(|| package.name.clone());
    let executable = metadata
        .executable
        .unwrap_or_else(|| format!("{}.exe", bin_name));

    let mut builder = AppManifest::build()
        .name(name)
        .version(package.version())
        .executable_path(&executable);
    if let Some(publisher) = metadata.publisher {
        builder = builder.publisher(publisher);
    }
    if let Some(icon) = &metadata.icon {
        builder = builder.icon_path(icon);
    }
    if let Some(reg_id) = metadata.reg_id {
        builder = builder.reg_id(reg_id);
    }
    for entry in metadata.context_menu {
        let icon_path = entry
            .icon
            .or_else(|| metadata.icon.clone())
            .unwrap_or_else(|| executable.clone());
        builder = builder.context_menu_entry(ContextMenuEntry {
            file_pattern: entry.file_pattern,
            arguments: entry.arguments,
            icon_path,
            label: entry.label,
        });
    }

    let manifest = builder.finish();
    let issues = manifest.validate();
    if !issues.is_empty() {
        return Err(CreateInstallerError::InvalidMetadata(
            issues.iter().map(ToString::to_string).collect(),
        ));
    }
    Ok(manifest)
}
