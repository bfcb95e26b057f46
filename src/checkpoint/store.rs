//! Checkpoint files for one (model, train identity) pair.
//!
//! Layout: `<checkpoints>/<model>/<train-hash>/`
//! - `checkpoint<N>.ckpt`: final checkpoint with id `N`
//! - `mid-checkpoint<N>.ckpt`: best-so-far state of the training run that
//!   will finalize as id `N`
//!
//! Every file is a bincode [`Envelope`] carrying the model name and a SHA-256
//! digest of the opaque model payload, so truncated or foreign files are
//! rejected on load instead of being handed to the model.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BenchError, LoadError, Result};

const ENVELOPE_VERSION: u32 = 1;
const FINAL_PREFIX: &str = "checkpoint";
const MID_PREFIX: &str = "mid-checkpoint";
const EXTENSION: &str = ".ckpt";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    id: u64,
    model: String,
    sha256: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Mid,
    Final,
}

/// A verified checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: u64,
    pub model: String,
    pub payload: Vec<u8>,
}

fn digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Parse a file name into its kind and id. `checkpoint.ckpt` has id 0.
pub fn parse_file_name(name: &str) -> Option<(CheckpointKind, u64)> {
    let stem = name.strip_suffix(EXTENSION)?;
    let (kind, digits) = if let Some(rest) = stem.strip_prefix(MID_PREFIX) {
        (CheckpointKind::Mid, rest)
    } else {
        (CheckpointKind::Final, stem.strip_prefix(FINAL_PREFIX)?)
    };
    if digits.is_empty() {
        return Some((kind, 0));
    }
    digits.parse().ok().map(|id| (kind, id))
}

pub struct CheckpointStore {
    dir: PathBuf,
    model: String,
}

impl CheckpointStore {
    pub fn open(checkpoints_root: &Path, model: &str, train_hash: &str) -> Result<Self> {
        let dir = checkpoints_root.join(model).join(train_hash);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            model: model.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn final_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{}{}", FINAL_PREFIX, id, EXTENSION))
    }

    pub fn mid_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{}{}", MID_PREFIX, id, EXTENSION))
    }

    fn entries(&self) -> Vec<(CheckpointKind, u64, PathBuf)> {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        read_dir
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                parse_file_name(&name).map(|(kind, id)| (kind, id, e.path()))
            })
            .collect()
    }

    /// Ids of final checkpoints, ascending.
    pub fn final_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .entries()
            .into_iter()
            .filter(|(kind, _, _)| *kind == CheckpointKind::Final)
            .map(|(_, id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Id the next training run finalizes under.
    pub fn next_id(&self) -> u64 {
        self.final_ids().last().map_or(1, |max| max + 1)
    }

    /// Highest-numbered final checkpoint.
    pub fn latest_final(&self) -> Option<(u64, PathBuf)> {
        self.entries()
            .into_iter()
            .filter(|(kind, _, _)| *kind == CheckpointKind::Final)
            .max_by_key(|(_, id, _)| *id)
            .map(|(_, id, path)| (id, path))
    }

    /// Bring an external checkpoint under management.
    ///
    /// A file already inside the managed directory is used in place. Anything
    /// else is copied to `checkpoint<fresh_id>.ckpt`. Returns the path to load.
    pub fn import(&self, source: &Path, fresh_id: u64) -> std::result::Result<PathBuf, LoadError> {
        if !source.is_file() {
            return Err(LoadError::Missing);
        }

        let source_dir = source
            .parent()
            .and_then(|p| fs::canonicalize(p).ok());
        let managed_dir = fs::canonicalize(&self.dir).ok();
        if source_dir.is_some() && source_dir == managed_dir {
            return Ok(source.to_path_buf());
        }

        let dest = self.final_path(fresh_id);
        fs::copy(source, &dest).map_err(|e| LoadError::Corrupt(format!("copy failed: {}", e)))?;
        tracing::info!(from = %source.display(), to = %dest.display(), "imported checkpoint");
        Ok(dest)
    }

    /// Read and verify a checkpoint file.
    pub fn load(&self, path: &Path) -> std::result::Result<Checkpoint, LoadError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(LoadError::Missing),
            Err(e) => return Err(LoadError::Corrupt(e.to_string())),
        };

        let envelope: Envelope =
            bincode::deserialize(&bytes).map_err(|e| LoadError::Corrupt(e.to_string()))?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(LoadError::Corrupt(format!("unknown envelope version {}", envelope.version)));
        }
        if envelope.model != self.model {
            return Err(LoadError::WrongModel {
                expected: self.model.clone(),
                found: envelope.model,
            });
        }
        if digest(&envelope.payload) != envelope.sha256 {
            return Err(LoadError::Corrupt("payload digest mismatch".into()));
        }

        Ok(Checkpoint {
            id: envelope.id,
            model: envelope.model,
            payload: envelope.payload,
        })
    }

    /// Atomically replace the mid checkpoint for `id`, then delete every
    /// other mid file in the directory.
    pub fn write_mid(&self, id: u64, payload: Vec<u8>) -> Result<PathBuf> {
        let path = self.mid_path(id);
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            id,
            model: self.model.clone(),
            sha256: digest(&payload),
            payload,
        };
        let bytes = bincode::serialize(&envelope).map_err(|e| BenchError::checkpoint_save(&path, e))?;

        let temp = path.with_extension("ckpt.tmp");
        {
            let mut file = File::create(&temp).map_err(|e| BenchError::checkpoint_save(&temp, e))?;
            file.write_all(&bytes)
                .map_err(|e| BenchError::checkpoint_save(&temp, e))?;
            file.sync_all().map_err(|e| BenchError::checkpoint_save(&temp, e))?;
        }
        fs::rename(&temp, &path).map_err(|e| BenchError::checkpoint_save(&path, e))?;

        for (kind, other, stale) in self.entries() {
            if kind == CheckpointKind::Mid && other != id {
                if let Err(e) = fs::remove_file(&stale) {
                    tracing::warn!(path = %stale.display(), error = %e, "could not remove stale mid checkpoint");
                }
            }
        }

        Ok(path)
    }

    /// Rename the mid checkpoint for `id` to its final name. `None` when no
    /// mid checkpoint was ever written.
    pub fn promote(&self, id: u64) -> Result<Option<PathBuf>> {
        let mid = self.mid_path(id);
        if !mid.is_file() {
            return Ok(None);
        }
        let dest = self.final_path(id);
        fs::rename(&mid, &dest).map_err(|e| BenchError::checkpoint_save(&dest, e))?;
        Ok(Some(dest))
    }

    /// Whether any mid file is present.
    pub fn has_mid(&self) -> bool {
        self.entries().iter().any(|(kind, _, _)| *kind == CheckpointKind::Mid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path(), "ngram", "abc123").unwrap()
    }

    #[test]
    fn test_parse_file_names() {
        assert_eq!(parse_file_name("checkpoint3.ckpt"), Some((CheckpointKind::Final, 3)));
        assert_eq!(parse_file_name("mid-checkpoint12.ckpt"), Some((CheckpointKind::Mid, 12)));
        assert_eq!(parse_file_name("checkpoint.ckpt"), Some((CheckpointKind::Final, 0)));
        assert_eq!(parse_file_name("checkpointX.ckpt"), None);
        assert_eq!(parse_file_name("checkpoint3.ckpt.tmp"), None);
        assert_eq!(parse_file_name("notes.txt"), None);
    }

    #[test]
    fn test_ids_and_latest() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert_eq!(s.next_id(), 1);
        assert!(s.latest_final().is_none());

        for id in [1, 4, 2] {
            s.write_mid(id, vec![id as u8]).unwrap();
            s.promote(id).unwrap();
        }
        assert_eq!(s.final_ids(), vec![1, 2, 4]);
        assert_eq!(s.next_id(), 5);
        assert_eq!(s.latest_final().unwrap().0, 4);
    }

    #[test]
    fn test_write_mid_leaves_single_mid() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.write_mid(7, vec![1]).unwrap();
        s.write_mid(8, vec![2]).unwrap();
        s.write_mid(8, vec![3]).unwrap();

        let mids: Vec<_> = s.entries().into_iter().filter(|(k, _, _)| *k == CheckpointKind::Mid).collect();
        assert_eq!(mids.len(), 1);
        assert_eq!(mids[0].1, 8);
        assert_eq!(s.load(&s.mid_path(8)).unwrap().payload, vec![3]);
        assert!(!s.mid_path(8).with_extension("ckpt.tmp").exists());
    }

    #[test]
    fn test_promote_is_rename() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert_eq!(s.promote(1).unwrap(), None);

        s.write_mid(1, b"state".to_vec()).unwrap();
        let final_path = s.promote(1).unwrap().unwrap();
        assert!(!s.has_mid());
        let ckpt = s.load(&final_path).unwrap();
        assert_eq!(ckpt.id, 1);
        assert_eq!(ckpt.payload, b"state");
    }

    #[test]
    fn test_load_failures() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        assert_eq!(s.load(&s.final_path(9)), Err(LoadError::Missing));

        std::fs::write(s.final_path(2), b"garbage").unwrap();
        assert!(matches!(s.load(&s.final_path(2)), Err(LoadError::Corrupt(_))));

        let other = CheckpointStore::open(dir.path(), "other", "abc123").unwrap();
        other.write_mid(1, vec![1, 2]).unwrap();
        let promoted = other.promote(1).unwrap().unwrap();
        assert!(matches!(s.load(&promoted), Err(LoadError::WrongModel { .. })));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let path = s.write_mid(1, vec![0u8; 64]).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(s.load(&path), Err(LoadError::Corrupt("payload digest mismatch".into())));
    }

    #[test]
    fn test_import_copies_external_file() {
        let dir = TempDir::new().unwrap();
        let external = TempDir::new().unwrap();
        let s = store(&dir);

        let src_store = CheckpointStore::open(external.path(), "ngram", "abc123").unwrap();
        src_store.write_mid(1, vec![42]).unwrap();
        let src = src_store.promote(1).unwrap().unwrap();

        let imported = s.import(&src, 3).unwrap();
        assert_eq!(imported, s.final_path(3));
        assert_eq!(s.load(&imported).unwrap().payload, vec![42]);

        // A file already under management is used in place
        assert_eq!(s.import(&imported, 4).unwrap(), imported);
        assert_eq!(s.import(Path::new("/nonexistent.ckpt"), 5), Err(LoadError::Missing));
    }
}
