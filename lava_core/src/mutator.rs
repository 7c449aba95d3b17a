use crate::catalog::{Catalog, CatalogError};
use crate::model::Bug;
use crate::trigger::{TriggerError, TriggerMode};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MutationError {
    /// An offset taken from the catalog does not exist in the input file.
    /// The labels always come from taint over this very file, so this means
    /// the catalog and the inputs directory disagree.
    #[error("Offset {offset} is outside input {path:?} of {len} bytes")]
    OffsetOutOfBounds {
        path: PathBuf,
        offset: u32,
        len: usize,
    },
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("Mutation I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Writes a bug's trigger value over every group of tainted offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMutator {
    mode: TriggerMode,
}

impl TriggerMutator {
    pub fn new(mode: TriggerMode) -> Self {
        Self { mode }
    }

    /// Returns a copy of `original` with the trigger for `bug_id` written at
    /// the first four offsets of each group, in order. Every group receives
    /// the same value.
    pub fn mutate_bytes<G: AsRef<[u32]>>(
        &self,
        original: &[u8],
        groups: &[G],
        bug_id: u64,
    ) -> Result<Vec<u8>, MutationError> {
        let trigger = self.mode.encode(bug_id)?;
        let mut bytes = original.to_vec();
        for group in groups {
            for (&offset, &value) in group.as_ref().iter().zip(trigger.iter()) {
                let len = bytes.len();
                let slot = bytes.get_mut(offset as usize).ok_or_else(|| {
                    MutationError::OffsetOutOfBounds {
                        path: PathBuf::new(),
                        offset,
                        len,
                    }
                })?;
                *slot = value;
            }
        }
        Ok(bytes)
    }

    /// Reads `original`, mutates it and writes the result to the derived
    /// fuzzed path, which is returned. An existing fuzzed file is overwritten.
    pub fn mutate_file<G: AsRef<[u32]>>(
        &self,
        original: &Path,
        groups: &[G],
        bug_id: u64,
    ) -> Result<PathBuf, MutationError> {
        let data = fs::read(original).map_err(|source| MutationError::Io {
            path: original.to_path_buf(),
            source,
        })?;
        let mutated = self
            .mutate_bytes(&data, groups, bug_id)
            .map_err(|e| match e {
                MutationError::OffsetOutOfBounds { offset, len, .. } => {
                    MutationError::OffsetOutOfBounds {
                        path: original.to_path_buf(),
                        offset,
                        len,
                    }
                }
                other => other,
            })?;
        let fuzzed = fuzzed_input_path(original, bug_id);
        fs::write(&fuzzed, mutated).map_err(|source| MutationError::Io {
            path: fuzzed.clone(),
            source,
        })?;
        Ok(fuzzed)
    }
}

/// Suffix of a file name including the dot, or an empty string. Only the
/// last extension counts, so `a.tar.gz` yields `.gz`.
pub fn file_suffix(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| format!(".{ext}"))
        .unwrap_or_default()
}

/// `<stem>-fuzzed-<bug_id><suffix>` next to the original.
pub fn fuzzed_input_path(unfuzzed: &Path, bug_id: u64) -> PathBuf {
    let name = unfuzzed
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = file_suffix(unfuzzed);
    let stem = &name[..name.len() - suffix.len()];
    unfuzzed.with_file_name(format!("{stem}-fuzzed-{bug_id}{suffix}"))
}

/// Offset groups to overwrite for `bug`: its trigger bytes first, then every
/// extra DUA-bytes entry in the order the bug lists them.
pub fn trigger_groups(catalog: &dyn Catalog, bug: &Bug) -> Result<Vec<Vec<u32>>, CatalogError> {
    let mut groups = Vec::with_capacity(1 + bug.extra_duas.len());
    groups.push(catalog.dua_bytes(bug.trigger)?.all_labels);
    for &extra in &bug.extra_duas {
        groups.push(catalog.dua_bytes(extra)?.all_labels);
    }
    Ok(groups)
}
