//! Dependency file resolution.
//!
//! Maps a dependency module name to the on-disk file the foreign loader would
//! pick, applying the standard DLL search order. Alternative policies (test
//! fixtures, custom redirection) implement [`FileResolver`] themselves.

use std::{
    env,
    path::{Path, PathBuf},
};

use crate::arch::Architecture;

/// Resolves a dependency module name to its backing file.
pub trait FileResolver: Send + Sync {
    /// Returns the file path for `module_name`, or `None` when no candidate exists.
    fn resolve(&self, module_name: &str) -> Option<PathBuf>;
}

/// The standard search order: the process's `.local` redirection directory, the
/// mapped DLL's own directory, the process directory, the system directory, the
/// Windows directory, the working directory, then every `PATH` entry.
#[derive(Debug)]
pub struct SearchOrderResolver {
    process_path: PathBuf,
    root_directory: Option<PathBuf>,
    architecture: Architecture,
}

impl SearchOrderResolver {
    /// Creates a resolver for a foreign process with the given main-executable
    /// path. `root_directory` is the directory of the DLL being mapped, when it
    /// was loaded from disk.
    pub fn new(
        process_path: PathBuf,
        root_directory: Option<PathBuf>,
        architecture: Architecture,
    ) -> SearchOrderResolver {
        SearchOrderResolver {
            process_path,
            root_directory,
            architecture,
        }
    }

    fn system_directory(&self) -> Option<PathBuf> {
        let windows_directory = self.windows_directory()?;

        // A 32-bit target on a 64-bit host resolves against the WOW64 system tree.
        let subdirectory = match self.architecture {
            Architecture::X86 if cfg!(target_pointer_width = "64") => "SysWOW64",
            _ => "System32",
        };

        Some(windows_directory.join(subdirectory))
    }

    fn windows_directory(&self) -> Option<PathBuf> {
        env::var_os("SystemRoot")
            .or_else(|| env::var_os("windir"))
            .map(PathBuf::from)
    }

    fn candidate_directories(&self) -> Vec<PathBuf> {
        let mut directories = Vec::new();

        // DotLocal redirection: "<process image>.local" as a directory.
        let mut local = self.process_path.clone().into_os_string();
        local.push(".local");
        directories.push(PathBuf::from(local));

        if let Some(root) = &self.root_directory {
            directories.push(root.clone());
        }

        if let Some(process_directory) = self.process_path.parent() {
            directories.push(process_directory.to_path_buf());
        }

        if let Some(system) = self.system_directory() {
            directories.push(system);
        }

        if let Some(windows) = self.windows_directory() {
            directories.push(windows);
        }

        if let Ok(working_directory) = env::current_dir() {
            directories.push(working_directory);
        }

        if let Some(path) = env::var_os("PATH") {
            directories.extend(env::split_paths(&path));
        }

        directories
    }
}

impl FileResolver for SearchOrderResolver {
    fn resolve(&self, module_name: &str) -> Option<PathBuf> {
        // An explicit path short-circuits the search.
        if Path::new(module_name).is_absolute() {
            let path = PathBuf::from(module_name);
            return path.is_file().then_some(path);
        }

        self.candidate_directories()
            .into_iter()
            .map(|directory| directory.join(module_name))
            .find(|candidate| candidate.is_file())
    }
}
