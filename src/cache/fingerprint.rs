use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::core::{Blake3Hasher, Hash32};
use crate::task::{Input, Output, Task};

/// Marker hashed in place of a file that doesn't exist.
const MISSING: &[u8] = b"\0missing";

/// Hashes of the declared inputs and outputs of a task at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub inputs: Hash32,
    pub outputs: Hash32,
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't hash '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Path is not valid UTF-8: {0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

impl Fingerprint {
    /// Fingerprint the current state of everything `task` declares.
    pub fn of(task: &Task, root: &Utf8Path) -> Result<Self, FingerprintError> {
        Ok(Self {
            inputs: hash_inputs(task.declared_inputs(), root)?,
            outputs: hash_outputs(task.declared_outputs(), root)?,
        })
    }
}

fn hash_inputs(inputs: &[Input], root: &Utf8Path) -> Result<Hash32, FingerprintError> {
    let mut hasher = Blake3Hasher::new();

    for input in inputs {
        match input {
            Input::Path(path) => {
                hasher.field("path").field(path.as_str());
                hash_files(&mut hasher, root, expand_path(root, path)?)?;
            }
            Input::Glob(pattern) => {
                hasher.field("glob").field(pattern);
                hash_files(&mut hasher, root, expand_glob(root, pattern)?)?;
            }
            Input::Value(value) => {
                hasher.field("value").field(value);
            }
        }
    }

    Ok(hasher.finish())
}

fn hash_outputs(outputs: &[Output], root: &Utf8Path) -> Result<Hash32, FingerprintError> {
    let mut hasher = Blake3Hasher::new();

    for output in outputs {
        match output {
            Output::Path(path) => {
                hasher.field("path").field(path.as_str());
                hash_files(&mut hasher, root, expand_path(root, path)?)?;
            }
            Output::Glob(pattern) => {
                hasher.field("glob").field(pattern);
                hash_files(&mut hasher, root, expand_glob(root, pattern)?)?;
            }
        }
    }

    Ok(hasher.finish())
}

/// Content hashes are computed in parallel, then folded in path order so the
/// result doesn't depend on scheduling.
fn hash_files(
    hasher: &mut Blake3Hasher,
    root: &Utf8Path,
    files: Vec<Utf8PathBuf>,
) -> Result<(), FingerprintError> {
    let hashes = files
        .par_iter()
        .map(|file| match Hash32::hash_file(file) {
            Ok(hash) => Ok(Some(hash)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FingerprintError::Io(file.clone(), err)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    for (file, hash) in files.iter().zip(hashes) {
        let relative = file.strip_prefix(root).unwrap_or(file);
        hasher.field(relative.as_str());
        match hash {
            Some(hash) => hasher.field(hash.as_bytes()),
            None => hasher.field(MISSING),
        };
    }

    Ok(())
}

/// A file maps to itself, a directory to every file below it, and a missing
/// path to itself (hashed as missing).
pub(crate) fn expand_path(
    root: &Utf8Path,
    path: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
    let full = root.join(path);

    match fs::metadata(&full) {
        Ok(meta) if meta.is_dir() => {
            let pattern = format!("{}/**/*", glob::Pattern::escape(full.as_str()));
            collect_files(&pattern)
        }
        _ => Ok(vec![full]),
    }
}

pub(crate) fn expand_glob(
    root: &Utf8Path,
    pattern: &str,
) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
    let full = format!("{}/{}", glob::Pattern::escape(root.as_str()), pattern);
    collect_files(&full)
}

fn collect_files(pattern: &str) -> Result<Vec<Utf8PathBuf>, FingerprintError> {
    let mut files = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
