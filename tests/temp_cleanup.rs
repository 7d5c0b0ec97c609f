//! Temp directory overrides are process wide, so this lives in its own test
//! binary with a single test.

use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};

use frost_setup::{
    InstallConfig, Installer,
    config::{ArchiveSource, InstallDir, MANIFEST_ENTRY},
    installer::Silent,
    integration::{MemoryRegistry, ShellRegistrar},
    post_embed,
};
use tempfile::tempdir;
use zip::{ZipWriter, write::SimpleFileOptions};

const MANIFEST: &str = r#"{
    "Name": "beeper",
    "Version": "1.0.0",
    "Publisher": "Denis",
    "IconPath": "beeper.exe",
    "ExecutablePath": "beeper.exe",
    "RegId": "beeper"
}"#;

fn write_carrier(dir: &Path, name: &str, manifest: &str) -> std::path::PathBuf {
    let archive = dir.join(format!("{name}.zip"));
    let mut zip = ZipWriter::new(File::create(&archive).unwrap());
    for (entry, contents) in [
        (MANIFEST_ENTRY, manifest.as_bytes()),
        ("beeper.exe", b"beeper program".as_slice()),
    ] {
        zip.start_file(entry, SimpleFileOptions::default()).unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();

    let carrier = dir.join(format!("{name}.exe"));
    fs::write(&carrier, b"MZ setup program").unwrap();
    post_embed::append(&carrier, &archive).unwrap();
    carrier
}

fn entries(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn carrier_installs_leave_no_temp_files() {
    let work = tempdir().unwrap();
    let temp = work.path().join("temp");
    fs::create_dir_all(&temp).unwrap();
    tempfile::env::override_temp_dir(&temp).unwrap();

    let install = |carrier: &Path| {
        let config = InstallConfig::build()
            .archive(ArchiveSource::Carrier(carrier.to_path_buf()))
            .install_dir(InstallDir::Exact(work.path().join("beeper")))
            .start_menu_dir(work.path().join("menu"))
            .finish()
            .unwrap();
        Installer::new(config, ShellRegistrar::new(MemoryRegistry::new())).install(&mut Silent)
    };

    let good = write_carrier(work.path(), "good", MANIFEST);
    install(&good).unwrap();
    assert!(work.path().join("beeper").join("beeper.exe").is_file());
    assert_eq!(entries(&temp), Vec::<String>::new());

    let broken = write_carrier(
        work.path(),
        "broken",
        &MANIFEST.replace(r#""RegId": "beeper""#, r#""RegId": "beeper", "ContextualMenuEntries": [null]"#),
    );
    let err = install(&broken).unwrap_err();
    assert_eq!(err.failed_step(), Some("load descriptor"));
    assert_eq!(entries(&temp), Vec::<String>::new());
}
