//! Versioned JSON artifacts for fitted models and scalers.
//!
//! Every file holds `{"format_version": N, "generation": id, "artifact": ...}`.
//! A batch of artifacts is written to temporary files first and only renamed
//! into place once every file of the batch has been written. Files being
//! replaced are moved aside and restored if any rename fails. All files of a
//! batch share one generation id, so a set mixed from two saves is refused
//! at load.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::ModelError;

/// Bumped whenever a serialized model layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 2;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    format_version: u32,
    generation: Uuid,
    artifact: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    format_version: u32,
    generation: Uuid,
    artifact: T,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// True only when every named artifact is present.
    pub fn exists_all(&self, names: &[&str]) -> bool {
        names.iter().all(|name| self.path(name).is_file())
    }

    fn read_envelope<T: DeserializeOwned>(&self, name: &str) -> Result<Envelope<T>, ModelError> {
        let bytes = fs::read(self.path(name))?;
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(ModelError::IncompatibleArtifact {
                name: name.to_string(),
                found: envelope.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(envelope)
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T, ModelError> {
        Ok(self.read_envelope(name)?.artifact)
    }

    /// Fails unless every named artifact was written by the same batch.
    pub fn ensure_same_generation(&self, names: &[&str]) -> Result<(), ModelError> {
        let mut first: Option<Uuid> = None;
        for name in names {
            let generation = self.read_envelope::<IgnoredAny>(name)?.generation;
            match first {
                None => first = Some(generation),
                Some(expected) if expected != generation => {
                    return Err(ModelError::MixedGenerations(names.join(", ")));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn batch(&self) -> ArtifactBatch<'_> {
        ArtifactBatch {
            store: self,
            generation: Uuid::new_v4(),
            staged: Vec::new(),
        }
    }
}

/// Artifacts serialized in memory, waiting to be committed together.
#[derive(Debug)]
pub struct ArtifactBatch<'a> {
    store: &'a ArtifactStore,
    generation: Uuid,
    staged: Vec<(String, Vec<u8>)>,
}

/// One staged file on its way into place.
struct Pending {
    tmp: PathBuf,
    target: PathBuf,
    backup: PathBuf,
    backed_up: bool,
    installed: bool,
}

impl ArtifactBatch<'_> {
    pub fn add<T: Serialize>(mut self, name: &str, artifact: &T) -> Result<Self, ModelError> {
        let bytes = serde_json::to_vec(&EnvelopeRef {
            format_version: FORMAT_VERSION,
            generation: self.generation,
            artifact,
        })?;
        self.staged.push((name.to_string(), bytes));
        Ok(self)
    }

    /// Write every staged artifact to a temp file, then rename them all into
    /// place. Either every target holds the new batch or every target is left
    /// as it was.
    pub fn commit(self) -> Result<(), ModelError> {
        let dir = self.store.dir();
        fs::create_dir_all(dir)?;

        let suffix = self.generation;
        let mut pending: Vec<Pending> = Vec::with_capacity(self.staged.len());
        for (name, bytes) in &self.staged {
            let tmp = dir.join(format!(".{}.{}.tmp", name, suffix));
            let entry = Pending {
                target: self.store.path(name),
                backup: dir.join(format!(".{}.{}.bak", name, suffix)),
                tmp,
                backed_up: false,
                installed: false,
            };
            let written = fs::write(&entry.tmp, bytes);
            pending.push(entry);
            if let Err(e) = written {
                roll_back(&pending);
                return Err(e.into());
            }
        }

        for i in 0..pending.len() {
            if let Err(e) = install(&mut pending[i]) {
                warn!(
                    target = %pending[i].target.display(),
                    error = %e,
                    "Artifact rename failed, restoring previous artifacts"
                );
                roll_back(&pending);
                return Err(e.into());
            }
        }

        for entry in pending.iter().filter(|p| p.backed_up) {
            remove_quietly(&entry.backup);
        }
        info!(
            dir = %dir.display(),
            artifacts = pending.len(),
            generation = %self.generation,
            "Model artifacts saved"
        );
        Ok(())
    }
}

/// Move an existing target file aside, then rename the temp file over it.
fn install(entry: &mut Pending) -> std::io::Result<()> {
    if entry.target.is_file() {
        fs::rename(&entry.target, &entry.backup)?;
        entry.backed_up = true;
    }
    fs::rename(&entry.tmp, &entry.target)?;
    entry.installed = true;
    Ok(())
}

/// Undo every install, put the moved-aside files back and drop temp files.
fn roll_back(pending: &[Pending]) {
    for entry in pending.iter().rev() {
        if entry.installed {
            remove_quietly(&entry.target);
        }
        if entry.backed_up {
            if let Err(e) = fs::rename(&entry.backup, &entry.target) {
                warn!(
                    backup = %entry.backup.display(),
                    error = %e,
                    "Failed to restore previous artifact"
                );
            }
        }
        remove_quietly(&entry.tmp);
    }
}

fn remove_quietly(path: &Path) {
    if path.is_file() {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove artifact file");
        }
    }
}
