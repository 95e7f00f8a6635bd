//! Memoized stage execution.
//!
//! [`StageRunner::run_stage`] checks a stage's declared outputs before
//! doing any work. When all of them exist the stage is skipped (or, with
//! [`ExistingOutputs::Fail`], rejected). Otherwise the stage closure
//! receives temporary sibling paths, and the temporaries are renamed
//! onto the real outputs only after the closure succeeds, so an
//! interrupted run never leaves a file that passes the existence check.
//!
//! Every run writes a manifest recording a SipHash fingerprint of the
//! stage parameters. Skipping a stage whose parameters changed since the
//! outputs were written logs a warning.

use std::fs;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::StageError;
use crate::stage::StageId;

/// What to do when a stage's outputs already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingOutputs {
    /// Skip the stage when all outputs exist.
    #[default]
    Skip,
    /// Refuse to run when any output exists.
    Fail,
}

impl FromStr for ExistingOutputs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("unknown existing-output policy {s:?}")),
        }
    }
}

/// Whether a stage did work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The closure ran and its outputs were committed.
    Ran,
    /// All outputs existed; the closure was not called.
    Skipped,
}

/// Record of the last committed run of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageManifest {
    /// Stage key.
    pub stage: String,
    /// Hex SipHash-1-3 of the canonical parameter JSON.
    pub fingerprint: String,
    /// The parameters themselves.
    pub parameters: serde_json::Value,
    /// Output files, as committed.
    pub outputs: Vec<PathBuf>,
}

/// Runs stages against a manifest directory.
#[derive(Debug, Clone)]
pub struct StageRunner {
    manifest_dir: PathBuf,
    policy: ExistingOutputs,
}

impl StageRunner {
    /// A runner keeping manifests under `manifest_dir`.
    #[must_use]
    pub fn new(manifest_dir: impl Into<PathBuf>, policy: ExistingOutputs) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            policy,
        }
    }

    /// The existing-output policy.
    #[must_use]
    pub const fn policy(&self) -> ExistingOutputs {
        self.policy
    }

    /// Run `stage` unless all `outputs` exist.
    ///
    /// `run` receives one temporary path per output, in the same order,
    /// and must write every one of them.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::AlreadyExists`] under
    /// [`ExistingOutputs::Fail`] when an output exists,
    /// [`StageError::MissingOutput`] when `run` leaves a temporary
    /// unwritten, and any error `run` itself returns. Temporaries are
    /// removed on failure.
    pub fn run_stage<P, F>(
        &self,
        stage: StageId,
        outputs: &[PathBuf],
        parameters: &P,
        run: F,
    ) -> Result<StageOutcome, StageError>
    where
        P: Serialize,
        F: FnOnce(&[PathBuf]) -> Result<(), StageError>,
    {
        let parameters = serde_json::to_value(parameters).map_err(|source| StageError::Json {
            path: self.manifest_path(stage),
            source,
        })?;
        let fingerprint = fingerprint(&parameters);

        if self.policy == ExistingOutputs::Fail
            && let Some(existing) = outputs.iter().find(|p| p.exists())
        {
            return Err(StageError::AlreadyExists(existing.clone()));
        }
        if !outputs.is_empty() && outputs.iter().all(|p| p.exists()) {
            self.warn_if_changed(stage, &fingerprint);
            tracing::info!(stage = stage.as_str(), "outputs exist, skipping");
            return Ok(StageOutcome::Skipped);
        }

        tracing::info!(stage = stage.as_str(), outputs = outputs.len(), "running");
        let temps: Vec<PathBuf> = outputs.iter().map(|p| temp_path(p)).collect();
        for (output, temp) in outputs.iter().zip(&temps) {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
            }
            remove_if_present(temp);
        }

        if let Err(e) = run(&temps).and_then(|()| commit(outputs, &temps)) {
            temps.iter().for_each(|t| remove_if_present(t));
            return Err(e);
        }

        let manifest = StageManifest {
            stage: stage.as_str().to_string(),
            fingerprint,
            parameters,
            outputs: outputs.to_vec(),
        };
        self.write_manifest(stage, &manifest)?;
        tracing::info!(stage = stage.as_str(), "done");
        Ok(StageOutcome::Ran)
    }

    /// The manifest of the last committed run of `stage`, if readable.
    #[must_use]
    pub fn manifest(&self, stage: StageId) -> Option<StageManifest> {
        let text = fs::read_to_string(self.manifest_path(stage)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn manifest_path(&self, stage: StageId) -> PathBuf {
        self.manifest_dir.join(format!("{}.json", stage.as_str()))
    }

    fn warn_if_changed(&self, stage: StageId, fingerprint: &str) {
        match self.manifest(stage) {
            Some(m) if m.fingerprint != fingerprint => tracing::warn!(
                stage = stage.as_str(),
                previous = %m.fingerprint,
                current = %fingerprint,
                "parameters changed since outputs were written; remove them to rerun",
            ),
            Some(_) => {}
            None => tracing::debug!(stage = stage.as_str(), "no manifest for existing outputs"),
        }
    }

    fn write_manifest(&self, stage: StageId, manifest: &StageManifest) -> Result<(), StageError> {
        let path = self.manifest_path(stage);
        let text = serde_json::to_string_pretty(manifest).map_err(|source| StageError::Json {
            path: path.clone(),
            source,
        })?;
        fs::create_dir_all(&self.manifest_dir).map_err(|e| StageError::io(&self.manifest_dir, e))?;
        write_atomic(&path, text.as_bytes())
    }
}

/// Hex SipHash-1-3 of `value`'s JSON text.
#[must_use]
pub fn fingerprint(value: &serde_json::Value) -> String {
    let mut hasher = SipHasher13::new();
    hasher.write(value.to_string().as_bytes());
    format!("{:016x}", hasher.finish())
}

/// Write `bytes` to a temporary sibling of `path` and rename it into
/// place.
///
/// # Errors
///
/// Returns [`StageError::Io`] if writing or renaming fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StageError> {
    let temp = temp_path(path);
    fs::write(&temp, bytes).map_err(|e| StageError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| {
        remove_if_present(&temp);
        StageError::io(path, e)
    })
}

/// `dir/.name.partial.ext` next to `path`. The extension is kept so
/// format writers that look at it still work.
fn temp_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(|| "output".into(), |s| s.to_string_lossy());
    let name = match path.extension() {
        Some(ext) => format!(".{stem}.partial.{}", ext.to_string_lossy()),
        None => format!(".{stem}.partial"),
    };
    path.with_file_name(name)
}

fn commit(outputs: &[PathBuf], temps: &[PathBuf]) -> Result<(), StageError> {
    if let Some(missing) = outputs
        .iter()
        .zip(temps)
        .find_map(|(output, temp)| (!temp.exists()).then_some(output))
    {
        return Err(StageError::MissingOutput(missing.clone()));
    }
    for (output, temp) in outputs.iter().zip(temps) {
        fs::rename(temp, output).map_err(|e| StageError::io(output, e))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "could not remove temporary file");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_a_hidden_sibling() {
        assert_eq!(
            temp_path(Path::new("/w/floodplain.tif")),
            PathBuf::from("/w/.floodplain.partial.tif")
        );
        assert_eq!(temp_path(Path::new("/w/notes")), PathBuf::from("/w/.notes.partial"));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = fingerprint(&serde_json::json!({"threshold": 9}));
        let b = fingerprint(&serde_json::json!({"threshold": 9}));
        let c = fingerprint(&serde_json::json!({"threshold": 10}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn policy_parses() {
        assert_eq!("skip".parse::<ExistingOutputs>().unwrap(), ExistingOutputs::Skip);
        assert_eq!("FAIL".parse::<ExistingOutputs>().unwrap(), ExistingOutputs::Fail);
        assert!("overwrite".parse::<ExistingOutputs>().is_err());
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!temp_path(&path).exists());
    }
}
