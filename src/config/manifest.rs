use std::{
    collections::HashSet,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the manifest entry inside every install archive. Unpacking the
/// archive leaves a copy of it in the install directory for the uninstaller.
pub const MANIFEST_ENTRY: &str = "install.json";

pub const UNINSTALL_ROOT: &str = r"Software\Microsoft\Windows\CurrentVersion\Uninstall";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("IO error reading manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid manifest {}: {}", path.display(), join_issues(issues))]
    Invalid {
        path: PathBuf,
        issues: Vec<ValidationIssue>,
    },
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    NullContextMenuEntry { index: usize },
    EmptyField { field: &'static str },
    InvalidKeyName { field: &'static str, value: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::NullContextMenuEntry { index } => {
                write!(f, "ContextualMenuEntries[{index}] is null")
            }
            ValidationIssue::EmptyField { field } => write!(f, "{field} must not be empty"),
            ValidationIssue::InvalidKeyName { field, value } => {
                write!(f, "{field} {value:?} cannot be used as a registry key name")
            }
        }
    }
}

/// The installation descriptor as authored in `install.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppManifest {
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub icon_path: String,
    pub executable_path: String,
    pub reg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contextual_menu_entries: Option<Vec<Option<ContextMenuEntry>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContextMenuEntry {
    /// `*` for every file or `*.ext` for one extension.
    pub file_pattern: String,
    /// Command line appended after the quoted executable, e.g. `"%1"`.
    pub arguments: String,
    pub icon_path: String,
    /// Visible text, also the registry sub-key name.
    pub label: String,
}

impl AppManifest {
    pub fn build() -> AppManifestBuilder<(), ()> {
        AppManifestBuilder {
            name: (),
            version: (),
            publisher: None,
            icon_path: None,
            executable_path: None,
            reg_id: None,
            entries: Vec::new(),
        }
    }

    /// Reads and validates a manifest file.
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let text = fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: AppManifest =
            serde_json::from_str(&text).map_err(|source| DescriptorError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let issues = manifest.validate();
        if !issues.is_empty() {
            return Err(DescriptorError::Invalid {
                path: path.to_path_buf(),
                issues,
            });
        }

        for (file_pattern, label) in manifest.duplicate_entries() {
            log::warn!(
                "context menu entry {:?} for {:?} is declared more than once, the last one wins",
                label,
                file_pattern
            );
        }

        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Collects every problem that would make this manifest unusable.
    ///
    /// A missing entry list is fine, a `null` inside a declared list is not.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("Name", &self.name),
            ("ExecutablePath", &self.executable_path),
            ("RegId", &self.reg_id),
        ] {
            if value.trim().is_empty() {
                issues.push(ValidationIssue::EmptyField { field });
            }
        }
        check_key_name(&mut issues, "RegId", &self.reg_id);

        for (index, entry) in self.entries_with_nulls().enumerate() {
            match entry {
                None => issues.push(ValidationIssue::NullContextMenuEntry { index }),
                Some(entry) => {
                    if entry.label.trim().is_empty() {
                        issues.push(ValidationIssue::EmptyField { field: "Label" });
                    }
                    if entry.file_pattern.trim().is_empty() {
                        issues.push(ValidationIssue::EmptyField {
                            field: "FilePattern",
                        });
                    }
                    check_key_name(&mut issues, "Label", &entry.label);
                    check_key_name(&mut issues, "FilePattern", &entry.file_pattern);
                }
            }
        }

        issues
    }

    /// `(file pattern, label)` pairs declared more than once.
    pub fn duplicate_entries(&self) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for entry in self.entries() {
            let key = (entry.file_pattern.clone(), entry.label.clone());
            if !seen.insert(key.clone()) {
                duplicates.push(key);
            }
        }
        duplicates
    }

    pub fn entries(&self) -> impl Iterator<Item = &ContextMenuEntry> {
        self.entries_with_nulls().flatten()
    }

    fn entries_with_nulls(&self) -> impl Iterator<Item = Option<&ContextMenuEntry>> {
        self.contextual_menu_entries
            .iter()
            .flatten()
            .map(Option::as_ref)
    }

    /// Returns a copy with every relative path prefixed by `install_root`.
    /// Rooted paths are kept as they are.
    pub fn resolve_paths(&self, install_root: &Path) -> ResolvedManifest {
        ResolvedManifest {
            name: self.name.clone(),
            version: self.version.clone(),
            publisher: self.publisher.clone(),
            reg_id: self.reg_id.clone(),
            icon_path: resolve(install_root, &self.icon_path),
            executable_path: resolve(install_root, &self.executable_path),
            install_root: install_root.to_path_buf(),
            context_menu_entries: self
                .entries()
                .map(|entry| ResolvedContextMenuEntry {
                    file_pattern: entry.file_pattern.clone(),
                    label: entry.label.clone(),
                    arguments: entry.arguments.clone(),
                    icon_path: resolve(install_root, &entry.icon_path),
                })
                .collect(),
        }
    }
}

fn check_key_name(issues: &mut Vec<ValidationIssue>, field: &'static str, value: &str) {
    if value.contains('\\') || value == "." || value == ".." {
        issues.push(ValidationIssue::InvalidKeyName {
            field,
            value: value.to_string(),
        });
    }
}

fn resolve(install_root: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    // `has_root` keeps drive-less paths like `\custom\app.ico` untouched on Windows too.
    if path.is_absolute() || path.has_root() {
        path.to_path_buf()
    } else {
        install_root.join(path)
    }
}

/// A manifest bound to an install directory. Every path in here is absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedManifest {
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub reg_id: String,
    pub icon_path: PathBuf,
    pub executable_path: PathBuf,
    pub install_root: PathBuf,
    pub context_menu_entries: Vec<ResolvedContextMenuEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContextMenuEntry {
    pub file_pattern: String,
    pub label: String,
    pub arguments: String,
    pub icon_path: PathBuf,
}

/// A context menu entry with its full command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMenuCommand {
    pub file_pattern: String,
    pub label: String,
    pub icon_path: PathBuf,
    pub command: String,
}

impl ResolvedManifest {
    /// Computes `"<main_executable>" <arguments>` for every entry.
    pub fn bind_commands(&self, main_executable: &Path) -> Vec<ContextMenuCommand> {
        self.context_menu_entries
            .iter()
            .map(|entry| ContextMenuCommand {
                file_pattern: entry.file_pattern.clone(),
                label: entry.label.clone(),
                icon_path: entry.icon_path.clone(),
                command: format!("\"{}\" {}", main_executable.display(), entry.arguments),
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<ContextMenuCommand> {
        self.bind_commands(&self.executable_path)
    }

    /// Registry key of the "Add or Remove Programs" entry, relative to HKCU.
    pub fn uninstall_key(&self) -> String {
        format!(r"{}\{}", UNINSTALL_ROOT, self.reg_id)
    }

    /// File name of the start menu shortcut, derived from the application name.
    pub fn shortcut_file_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| match c {
                '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        format!("{}.lnk", name.trim())
    }
}

pub type AppManifestConfig = AppManifestBuilder<String, String>;

#[derive(Clone)]
pub struct AppManifestBuilder<A, B> {
    name: A,
    version: B,
    publisher: Option<String>,
    icon_path: Option<String>,
    executable_path: Option<String>,
    reg_id: Option<String>,
    entries: Vec<ContextMenuEntry>,
}

impl<A, B> AppManifestBuilder<A, B> {
    pub fn name(self, name: impl Into<String>) -> AppManifestBuilder<String, B> {
        AppManifestBuilder {
            name: name.into(),
            version: self.version,
            publisher: self.publisher,
            icon_path: self.icon_path,
            executable_path: self.executable_path,
            reg_id: self.reg_id,
            entries: self.entries,
        }
    }

    pub fn version(self, version: impl Into<String>) -> AppManifestBuilder<A, String> {
        AppManifestBuilder {
            name: self.name,
            version: version.into(),
            publisher: self.publisher,
            icon_path: self.icon_path,
            executable_path: self.executable_path,
            reg_id: self.reg_id,
            entries: self.entries,
        }
    }

    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn icon_path(mut self, icon_path: impl Into<String>) -> Self {
        self.icon_path = Some(icon_path.into());
        self
    }

    pub fn executable_path(mut self, executable_path: impl Into<String>) -> Self {
        self.executable_path = Some(executable_path.into());
        self
    }

    pub fn reg_id(mut self, reg_id: impl Into<String>) -> Self {
        self.reg_id = Some(reg_id.into());
        self
    }

    pub fn context_menu_entry(mut self, entry: ContextMenuEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

impl AppManifestConfig {
    /// Fills the optional fields from the name: `<name>.exe` as executable,
    /// the executable itself as icon and the name as registration id.
    pub fn finish(self) -> AppManifest {
        let executable_path = self
            .executable_path
            .unwrap_or_else(|| format!("{}.exe", self.name));
        AppManifest {
            icon_path: self.icon_path.unwrap_or_else(|| executable_path.clone()),
            reg_id: self.reg_id.unwrap_or_else(|| self.name.clone()),
            publisher: self.publisher.unwrap_or_default(),
            executable_path,
            contextual_menu_entries: (!self.entries.is_empty())
                .then(|| self.entries.into_iter().map(Some).collect()),
            name: self.name,
            version: self.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BEEPER: &str = r#"{
        "Name": "beeper",
        "Version": "1.0.0",
        "Publisher": "Denis",
        "IconPath": "beeper.ico",
        "ExecutablePath": "beeper.exe",
        "RegId": "beeper",
        "ContextualMenuEntries": [
            {
                "FilePattern": "*",
                "Label": "encrypt",
                "Arguments": "\"encrypt\" \"%1\"",
                "IconPath": "icon-encrypt.ico"
            }
        ]
    }"#;

    fn load_str(json: &str) -> Result<AppManifest, DescriptorError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_ENTRY);
        fs::write(&path, json).unwrap();
        AppManifest::load(&path)
    }

    #[test]
    fn loads_full_manifest() {
        let manifest = load_str(BEEPER).unwrap();
        assert_eq!(manifest.name, "beeper");
        assert_eq!(manifest.reg_id, "beeper");
        let entries: Vec<_> = manifest.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].arguments, r#""encrypt" "%1""#);
    }

    #[test]
    fn missing_entry_list_is_valid() {
        let manifest = load_str(
            r#"{"Name":"a","Version":"1","Publisher":"p","IconPath":"a.ico","ExecutablePath":"a.exe","RegId":"a"}"#,
        )
        .unwrap();
        assert!(manifest.contextual_menu_entries.is_none());
        assert!(manifest.validate().is_empty());
    }

    #[test]
    fn null_entry_list_is_valid() {
        let manifest = load_str(
            r#"{"Name":"a","Version":"1","Publisher":"p","IconPath":"a.ico","ExecutablePath":"a.exe","RegId":"a","ContextualMenuEntries":null}"#,
        )
        .unwrap();
        assert_eq!(manifest.entries().count(), 0);
    }

    #[test]
    fn null_entry_is_invalid() {
        let err = load_str(
            r#"{"Name":"a","Version":"1","Publisher":"p","IconPath":"a.ico","ExecutablePath":"a.exe","RegId":"a",
                "ContextualMenuEntries":[{"FilePattern":"*","Label":"x","Arguments":"%1","IconPath":"x.ico"}, null]}"#,
        )
        .unwrap_err();
        match err {
            DescriptorError::Invalid { issues, .. } => {
                assert_eq!(issues, vec![ValidationIssue::NullContextMenuEntry { index: 1 }]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let err = load_str(r#"{"Name":"a","Version":"1"}"#).unwrap_err();
        assert!(matches!(err, DescriptorError::Parse { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            load_str("{ not json").unwrap_err(),
            DescriptorError::Parse { .. }
        ));
    }

    #[test]
    fn empty_reg_id_is_rejected() {
        let mut manifest = load_str(BEEPER).unwrap();
        manifest.reg_id = " ".into();
        assert_eq!(
            manifest.validate(),
            vec![ValidationIssue::EmptyField { field: "RegId" }]
        );
    }

    #[test]
    fn label_with_backslash_is_rejected() {
        let mut manifest = load_str(BEEPER).unwrap();
        if let Some(entries) = manifest.contextual_menu_entries.as_mut() {
            entries[0].as_mut().unwrap().label = r"..\..\Run".into();
        }
        assert!(matches!(
            manifest.validate().as_slice(),
            [ValidationIssue::InvalidKeyName { field: "Label", .. }]
        ));
    }

    #[test]
    fn relative_paths_are_prefixed() {
        let manifest = AppManifest::build()
            .name("app")
            .version("1.0")
            .icon_path("app.ico")
            .executable_path("app.exe")
            .finish();
        let root = Path::new("/opt/apps/app");

        let resolved = manifest.resolve_paths(root);

        assert_eq!(resolved.icon_path, root.join("app.ico"));
        assert_eq!(resolved.executable_path, root.join("app.exe"));
        assert_eq!(manifest.icon_path, "app.ico");
    }

    #[test]
    fn rooted_paths_are_kept() {
        let manifest = AppManifest::build()
            .name("app")
            .version("1.0")
            .icon_path("/custom/app.ico")
            .finish();

        let resolved = manifest.resolve_paths(Path::new("/opt/apps/app"));

        assert_eq!(resolved.icon_path, PathBuf::from("/custom/app.ico"));
    }

    #[test]
    fn commands_quote_the_executable() {
        let manifest = load_str(BEEPER).unwrap();
        let root = Path::new("/d");
        let resolved = manifest.resolve_paths(root);

        let commands = resolved.commands();

        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].command,
            format!(r#""{}" "encrypt" "%1""#, root.join("beeper.exe").display())
        );
        assert_eq!(commands[0].icon_path, root.join("icon-encrypt.ico"));
    }

    #[test]
    fn duplicates_are_reported() {
        let entry = ContextMenuEntry {
            file_pattern: "*".into(),
            arguments: "%1".into(),
            icon_path: "a.ico".into(),
            label: "open".into(),
        };
        let manifest = AppManifest::build()
            .name("app")
            .version("1")
            .context_menu_entry(entry.clone())
            .context_menu_entry(entry)
            .finish();

        assert_eq!(
            manifest.duplicate_entries(),
            vec![("*".to_string(), "open".to_string())]
        );
        assert!(manifest.validate().is_empty());
    }

    #[test]
    fn derived_names() {
        let manifest = load_str(BEEPER).unwrap();
        let resolved = manifest.resolve_paths(Path::new("/d"));
        assert_eq!(
            resolved.uninstall_key(),
            r"Software\Microsoft\Windows\CurrentVersion\Uninstall\beeper"
        );
        assert_eq!(resolved.shortcut_file_name(), "beeper.lnk");

        let mut odd = resolved.clone();
        odd.name = "A/B: C?".into();
        assert_eq!(odd.shortcut_file_name(), "A_B_ C_.lnk");
    }

    #[test]
    fn builder_defaults() {
        let manifest = AppManifest::build().name("tool").version("2.0").finish();
        assert_eq!(manifest.executable_path, "tool.exe");
        assert_eq!(manifest.icon_path, "tool.exe");
        assert_eq!(manifest.reg_id, "tool");
        assert!(manifest.contextual_menu_entries.is_none());
    }
}
