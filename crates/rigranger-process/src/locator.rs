//! Strategies for finding the `rigctld` binary.
//!
//! The supervisor never touches the filesystem itself; it asks a
//! [`DaemonLocator`]. [`FixedPathLocator`] uses a configured path,
//! [`SearchLocator`] searches bundled application directories, the usual
//! install locations and finally every directory on `PATH`.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use rigranger_core::error::{Error, Result};
use walkdir::WalkDir;

/// File name of the daemon binary on this platform.
pub const BINARY_NAME: &str = if cfg!(windows) { "rigctld.exe" } else { "rigctld" };

/// Resolves the path of the daemon binary.
pub trait DaemonLocator: Send + Sync + fmt::Debug {
    /// Return the binary to launch, or [`Error::BinaryNotFound`].
    fn locate(&self) -> Result<PathBuf>;
}

/// Uses one explicitly configured binary.
#[derive(Debug, Clone)]
pub struct FixedPathLocator {
    path: PathBuf,
}

impl FixedPathLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DaemonLocator for FixedPathLocator {
    fn locate(&self) -> Result<PathBuf> {
        if is_executable(&self.path) {
            Ok(self.path.clone())
        } else {
            Err(Error::BinaryNotFound(format!(
                "{} is not an executable file",
                self.path.display()
            )))
        }
    }
}

/// Searches well-known locations in a fixed order.
///
/// 1. application directories, walked recursively; a binary inside a `bin`
///    directory wins over one found elsewhere in the same tree
/// 2. platform install directories
/// 3. each entry of the executable search path
#[derive(Debug, Clone)]
pub struct SearchLocator {
    binary_name: String,
    app_dirs: Vec<PathBuf>,
    install_dirs: Vec<PathBuf>,
    search_path: Option<OsString>,
}

impl Default for SearchLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchLocator {
    /// Platform defaults: an `app` directory next to the running executable,
    /// the standard install locations and the process `PATH`.
    pub fn new() -> Self {
        let app_dirs = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("app")))
            .into_iter()
            .collect();

        Self {
            binary_name: BINARY_NAME.to_string(),
            app_dirs,
            install_dirs: platform_install_dirs(),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// A locator with no locations at all; add them with the `with_*` methods.
    pub fn empty() -> Self {
        Self {
            binary_name: BINARY_NAME.to_string(),
            app_dirs: Vec::new(),
            install_dirs: Vec::new(),
            search_path: None,
        }
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn with_app_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.app_dirs.push(dir.into());
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dirs.push(dir.into());
        self
    }

    /// Replace the search path (same syntax as `PATH`).
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Every candidate path, in search order. Candidates may not exist.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();

        for dir in &self.app_dirs {
            out.extend(self.walk_app_dir(dir));
        }
        for dir in &self.install_dirs {
            out.push(dir.join(&self.binary_name));
        }
        if let Some(path) = &self.search_path {
            out.extend(std::env::split_paths(path).map(|dir| dir.join(&self.binary_name)));
        }

        out
    }

    fn walk_app_dir(&self, dir: &Path) -> Vec<PathBuf> {
        if !dir.is_dir() {
            return Vec::new();
        }

        let (mut in_bin, elsewhere): (Vec<PathBuf>, Vec<PathBuf>) = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == self.binary_name.as_str())
            .map(|entry| entry.into_path())
            .partition(|path| {
                path.parent()
                    .and_then(Path::file_name)
                    .is_some_and(|name| name == "bin")
            });

        in_bin.extend(elsewhere);
        in_bin
    }
}

impl DaemonLocator for SearchLocator {
    fn locate(&self) -> Result<PathBuf> {
        for candidate in self.candidates() {
            if is_executable(&candidate) {
                tracing::debug!(path = %candidate.display(), "found rigctld");
                return Ok(candidate);
            }
            tracing::trace!(path = %candidate.display(), "no rigctld here");
        }
        tracing::warn!("rigctld not found; install Hamlib or configure binary_path");
        Err(Error::BinaryNotFound(format!(
            "{} not found in application, install or PATH directories",
            self.binary_name
        )))
    }
}

fn platform_install_dirs() -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![
            PathBuf::from(r"C:\Program Files\Hamlib\bin"),
            PathBuf::from(r"C:\Program Files (x86)\Hamlib\bin"),
        ]
    } else {
        let mut dirs = vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/homebrew/bin"),
        ];
        let on_pi = std::fs::read_to_string("/proc/cpuinfo")
            .map(|cpuinfo| is_raspberry_pi(&cpuinfo))
            .unwrap_or(false);
        if on_pi {
            dirs.push(PathBuf::from("/home/pi/hamlib/bin"));
        }
        dirs
    }
}

fn is_raspberry_pi(cpuinfo: &str) -> bool {
    cpuinfo.contains("Raspberry Pi")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
