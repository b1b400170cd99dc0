// Workspace Discovery
// Locating the repository a run operates on and its pipeline definition

use std::io;
use std::path::{Path, PathBuf};

/// File names probed, in order, when no definition path is given
pub const PIPELINE_FILE_CANDIDATES: &[&str] = &[
    "deploy-pipeline.yaml",
    "deploy-pipeline.yml",
    ".deploy/pipeline.yaml",
    ".deploy/pipeline.yml",
];

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no ancestor contains a `.git` entry.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    // Canonicalize to resolve symlinks and get an absolute path
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Directory steps run in.
///
/// An explicit directory must exist. Without one, the enclosing repository
/// root of the current directory is used, else the current directory itself.
pub fn resolve_working_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    if let Some(dir) = explicit {
        let dir = dir.canonicalize()?;
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            ));
        }
        return Ok(dir);
    }

    let cwd = std::env::current_dir()?;
    Ok(find_repo_root(&cwd).unwrap_or(cwd))
}

/// First pipeline definition found in `dir`
pub fn find_pipeline_file(dir: &Path) -> Option<PathBuf> {
    PIPELINE_FILE_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}
