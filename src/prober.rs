//! Environment probing for the external packaging toolchain.
//!
//! The packaging tool needs a native compression header package, a Java
//! compiler and the Android SDK/NDK. None of that can be fixed from inside
//! the service, so absences are collected up front and reported as a
//! blocking list.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// How a capability is looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capability {
    /// An executable file with this name in one of the `PATH` directories
    Executable { name: String },

    /// A package the OS package manager reports as installed.
    /// `query` is run with the package name appended and must exit zero.
    OsPackage {
        name: String,
        #[serde(default = "default_package_query")]
        query: Vec<String>,
    },

    /// An environment variable naming an existing directory
    EnvDir { var: String },
}

fn default_package_query() -> Vec<String> {
    vec!["dpkg".to_string(), "-s".to_string()]
}

/// A capability plus what to tell the operator when it is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub label: String,
    pub hint: String,
    #[serde(flatten)]
    pub capability: Capability,
}

impl Requirement {
    pub fn new(label: &str, hint: &str, capability: Capability) -> Self {
        Self {
            label: label.to_string(),
            hint: hint.to_string(),
            capability,
        }
    }

    /// The toolchain `buildozer android debug` needs on a Debian-like host.
    pub fn defaults() -> Vec<Requirement> {
        vec![
            Requirement::new(
                "zlib1g-dev",
                "run: sudo apt-get install zlib1g-dev",
                Capability::OsPackage {
                    name: "zlib1g-dev".to_string(),
                    query: default_package_query(),
                },
            ),
            Requirement::new(
                "Java JDK",
                "install from: https://www.oracle.com/java/technologies/javase-jdk11-downloads.html",
                Capability::Executable {
                    name: "javac".to_string(),
                },
            ),
            Requirement::new(
                "Android SDK",
                "set ANDROID_HOME environment variable and install from: https://developer.android.com/studio",
                Capability::EnvDir {
                    var: "ANDROID_HOME".to_string(),
                },
            ),
            Requirement::new(
                "Android NDK",
                "set ANDROID_NDK_HOME environment variable and install from: https://developer.android.com/ndk/downloads",
                Capability::EnvDir {
                    var: "ANDROID_NDK_HOME".to_string(),
                },
            ),
        ]
    }
}

/// A requirement the probe could not satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    pub label: String,
    pub hint: String,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.hint)
    }
}

/// Result of probing, as shown to the front end.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentReport {
    pub ready: bool,
    pub missing: Vec<MissingDependency>,
}

impl From<Vec<MissingDependency>> for EnvironmentReport {
    fn from(missing: Vec<MissingDependency>) -> Self {
        Self {
            ready: missing.is_empty(),
            missing,
        }
    }
}

/// Probe against the real process environment.
pub async fn probe_system(requirements: &[Requirement]) -> Vec<MissingDependency> {
    probe(requirements, |key| std::env::var_os(key)).await
}

/// Return the requirements that are absent, in declaration order.
///
/// `env` resolves environment variables, including `PATH` for executable
/// lookups.
pub async fn probe<F>(requirements: &[Requirement], env: F) -> Vec<MissingDependency>
where
    F: Fn(&str) -> Option<OsString>,
{
    let mut missing = Vec::new();

    for requirement in requirements {
        let present = match &requirement.capability {
            Capability::Executable { name } => find_on_path(name, env("PATH")).is_some(),
            Capability::OsPackage { name, query } => package_installed(name, query).await,
            Capability::EnvDir { var } => env(var)
                .filter(|value| !value.is_empty())
                .is_some_and(|value| Path::new(&value).is_dir()),
        };

        if present {
            info!("[Probe] Found {}", requirement.label);
        } else {
            warn!("[Probe] Missing {}", requirement.label);
            missing.push(MissingDependency {
                label: requirement.label.clone(),
                hint: requirement.hint.clone(),
            });
        }
    }

    missing
}

fn find_on_path(name: &str, path_var: Option<OsString>) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }

    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

async fn package_installed(name: &str, query: &[String]) -> bool {
    let Some((program, args)) = query.split_first() else {
        warn!("[Probe] Empty package query for {}", name);
        return false;
    };

    match Command::new(program)
        .args(args)
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("[Probe] Could not run {}: {}", program, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;

    fn env_from(pairs: &[(&str, OsString)]) -> impl Fn(&str) -> Option<OsString> + use<> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn executable(dir: &Path, name: &str) {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn reports_only_absent_capabilities() {
        let bin = tempfile::tempdir().unwrap();
        let sdk = tempfile::tempdir().unwrap();
        executable(bin.path(), "javac");

        let requirements = vec![
            Requirement::new("JDK", "install a JDK", Capability::Executable { name: "javac".into() }),
            Requirement::new("SDK", "set ANDROID_HOME", Capability::EnvDir { var: "ANDROID_HOME".into() }),
            Requirement::new("NDK", "set ANDROID_NDK_HOME", Capability::EnvDir { var: "ANDROID_NDK_HOME".into() }),
        ];
        let env = env_from(&[
            ("PATH", bin.path().as_os_str().to_owned()),
            ("ANDROID_HOME", sdk.path().as_os_str().to_owned()),
        ]);

        let missing = probe(&requirements, env).await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].label, "NDK");
        assert_eq!(missing[0].to_string(), "NDK (set ANDROID_NDK_HOME)");
    }

    #[tokio::test]
    async fn env_dir_must_exist() {
        let requirements = vec![Requirement::new(
            "SDK",
            "hint",
            Capability::EnvDir { var: "ANDROID_HOME".into() },
        )];
        let env = env_from(&[("ANDROID_HOME", OsString::from("/definitely/not/here"))]);
        assert_eq!(probe(&requirements, env).await.len(), 1);

        let env = env_from(&[("ANDROID_HOME", OsString::new())]);
        assert_eq!(probe(&requirements, env).await.len(), 1);
    }

    #[tokio::test]
    async fn non_executable_file_is_absent() {
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("javac"), "").unwrap();
        let requirements = vec![Requirement::new(
            "JDK",
            "hint",
            Capability::Executable { name: "javac".into() },
        )];
        let env = env_from(&[("PATH", bin.path().as_os_str().to_owned())]);
        assert_eq!(probe(&requirements, env).await.len(), 1);
    }

    #[tokio::test]
    async fn package_query_exit_status_decides() {
        let package = |query: &[&str]| {
            Requirement::new(
                "zlib",
                "apt-get install",
                Capability::OsPackage {
                    name: "zlib1g-dev".into(),
                    query: query.iter().map(|s| s.to_string()).collect(),
                },
            )
        };
        let requirements = vec![
            package(&["sh", "-c", "exit 0"]),
            package(&["sh", "-c", "exit 1"]),
            package(&["no-such-package-manager-here"]),
            package(&[]),
        ];

        let missing = probe(&requirements, |_| None).await;
        assert_eq!(missing.len(), 3);
    }

    #[test]
    fn requirements_deserialize_with_default_query() {
        let requirement: Requirement = serde_json::from_str(
            r#"{ "label": "zlib", "hint": "apt", "kind": "os_package", "name": "zlib1g-dev" }"#,
        )
        .unwrap();
        assert_eq!(
            requirement.capability,
            Capability::OsPackage {
                name: "zlib1g-dev".into(),
                query: vec!["dpkg".into(), "-s".into()],
            }
        );
    }

    #[test]
    fn report_is_ready_without_missing() {
        assert!(EnvironmentReport::from(Vec::new()).ready);
    }
}
