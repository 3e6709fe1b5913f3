//! Helpers shared by the unit tests.

use std::io::{Cursor, Write};
use std::path::Path;

use crate::config::AppConfig;

/// Build a zip archive in memory from `(name, contents)` pairs.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Config that stages into `workspace` and replaces the packaging tool with
/// `sh -c` scripts.
pub fn sh_config(workspace: &Path, init_script: &str, build_script: &str) -> AppConfig {
    AppConfig {
        workspace: workspace.to_path_buf(),
        builder: "sh".to_string(),
        verbose: false,
        init_args: vec!["-c".to_string(), init_script.to_string()],
        build_args: vec!["-c".to_string(), build_script.to_string()],
        artifact_dirs: vec!["bin".into(), "out/apk".into()],
        build_timeout_secs: Some(30),
        requirements: Vec::new(),
        ..AppConfig::default()
    }
}
