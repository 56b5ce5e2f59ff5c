//! Full-tree backups taken before a change and restored when it fails.
//!
//! Layout under the backup root:
//!
//! ```text
//! <backup_root>/.gitignore       "*", keeps backups out of commits
//! <backup_root>/<id>/            tree copy
//! <backup_root>/<id>.json        snapshot metadata
//! ```
//!
//! Metadata lives beside the copy rather than inside it so a restore never writes it into the
//! working tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::exclude::ExcludeRules;
use crate::core::types::Snapshot;
use crate::io::checksum::tree_checksum;
use crate::io::config::ChangeguardConfig;
use crate::io::sync::{TreeSync, clear_tree};
use crate::io::tool::ToolRunner;

const METADATA_EXT: &str = "json";

/// Creates, restores and discards snapshots of one working tree.
#[derive(Debug, Clone)]
pub struct SnapshotStore<'a, R: ToolRunner> {
    sync: TreeSync<'a, R>,
    workdir: PathBuf,
    backup_root: PathBuf,
    rules: ExcludeRules,
}

impl<'a, R: ToolRunner> SnapshotStore<'a, R> {
    pub fn from_config(runner: &'a R, workdir: &Path, cfg: &ChangeguardConfig) -> Self {
        Self {
            sync: TreeSync::from_config(runner, cfg),
            workdir: workdir.to_path_buf(),
            backup_root: cfg.backup_root_in(workdir),
            rules: cfg.exclude_rules(workdir),
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copy the working tree into a fresh backup and record its checksum.
    ///
    /// The backup is verified against the source before this returns. On failure the partial
    /// backup is removed.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn create(&self) -> Result<Snapshot> {
        self.prepare_backup_root()?;
        let (snapshot_id, backup_path) = self.allocate_backup_dir()?;
        debug!(%snapshot_id, "backup directory allocated");

        match self.fill_backup(&snapshot_id, &backup_path) {
            Ok(snapshot) => {
                info!(
                    snapshot_id = %snapshot.snapshot_id,
                    file_count = snapshot.file_count,
                    "snapshot created"
                );
                Ok(snapshot)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&backup_path) {
                    warn!(err = %cleanup, path = %backup_path.display(), "failed to remove partial backup");
                }
                Err(err)
            }
        }
    }

    fn fill_backup(&self, snapshot_id: &str, backup_path: &Path) -> Result<Snapshot> {
        let created_at = Utc::now();
        let source = tree_checksum(&self.workdir, &self.rules).context("checksum working tree")?;
        self.sync
            .copy_tree(&self.workdir, backup_path, &self.rules)
            .context("copy working tree to backup")?;
        let copy = tree_checksum(backup_path, &self.rules).context("checksum backup")?;
        if copy != source {
            return Err(anyhow!(
                "backup does not match working tree (source {} files {}, backup {} files {})",
                source.checksum,
                source.file_count,
                copy.checksum,
                copy.file_count
            ));
        }

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.to_string(),
            created_at,
            source_path: self.workdir.clone(),
            backup_path: backup_path.to_path_buf(),
            file_count: source.file_count,
            checksum: source.checksum,
        };
        self.write_metadata(&snapshot)?;
        Ok(snapshot)
    }

    /// Recompute the backup checksum and compare it with the recorded one.
    pub fn verify(&self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.backup_path.is_dir() {
            return Err(anyhow!(
                "backup missing: {}",
                snapshot.backup_path.display()
            ));
        }
        let digest = tree_checksum(&snapshot.backup_path, &self.rules).context("checksum backup")?;
        if digest.checksum != snapshot.checksum {
            return Err(anyhow!(
                "backup {} is corrupted (expected {}, found {})",
                snapshot.snapshot_id,
                snapshot.checksum,
                digest.checksum
            ));
        }
        Ok(())
    }

    /// Replace the working tree with the backup, verify it, then drop the backup.
    ///
    /// Excluded paths (`.git`, caches, changeguard's own dirs) are left untouched. On error the
    /// backup stays on disk.
    #[instrument(skip_all, fields(snapshot_id = %snapshot.snapshot_id))]
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        self.verify(snapshot)?;

        clear_tree(&self.workdir, &self.rules).context("clear working tree")?;
        self.sync
            .copy_tree(&snapshot.backup_path, &self.workdir, &self.rules)
            .context("copy backup to working tree")?;

        let restored = tree_checksum(&self.workdir, &self.rules).context("checksum restored tree")?;
        if restored.checksum != snapshot.checksum {
            return Err(anyhow!(
                "restored tree does not match snapshot {} (expected {}, found {})",
                snapshot.snapshot_id,
                snapshot.checksum,
                restored.checksum
            ));
        }
        info!("working tree restored and verified");

        // The tree is already consistent; a leftover backup only costs disk space.
        if let Err(err) = self.discard(snapshot) {
            warn!(err = %format!("{err:#}"), "failed to remove backup after restore");
        }
        Ok(())
    }

    /// Delete a backup and its metadata.
    #[instrument(skip_all, fields(snapshot_id = %snapshot.snapshot_id))]
    pub fn discard(&self, snapshot: &Snapshot) -> Result<()> {
        match fs::remove_dir_all(&snapshot.backup_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove {}", snapshot.backup_path.display()));
            }
        }
        let metadata = self.metadata_path(&snapshot.snapshot_id);
        match fs::remove_file(&metadata) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove {}", metadata.display()));
            }
        }
        debug!("snapshot discarded");
        Ok(())
    }

    pub fn load(&self, snapshot_id: &str) -> Result<Snapshot> {
        if snapshot_id.is_empty() || snapshot_id.contains(['/', '\\']) || snapshot_id.starts_with('.')
        {
            return Err(anyhow!("invalid snapshot id '{snapshot_id}'"));
        }
        let path = self.metadata_path(snapshot_id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read snapshot metadata {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse snapshot metadata {}", path.display()))
    }

    /// All snapshots with metadata, oldest first.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read directory {}", self.backup_root.display()));
            }
        };
        let mut snapshots = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read directory {}", self.backup_root.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => warn!(err = %format!("{err:#}"), "skipping unreadable snapshot metadata"),
            }
        }
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        Ok(snapshots)
    }

    fn prepare_backup_root(&self) -> Result<()> {
        fs::create_dir_all(&self.backup_root)
            .with_context(|| format!("create directory {}", self.backup_root.display()))?;
        let gitignore = self.backup_root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")
                .with_context(|| format!("write {}", gitignore.display()))?;
        }
        Ok(())
    }

    fn allocate_backup_dir(&self) -> Result<(String, PathBuf)> {
        let base = snapshot_id_base(&self.workdir, Utc::now());
        for attempt in 1..=1000u32 {
            let id = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}_{attempt}")
            };
            if self.metadata_path(&id).exists() {
                continue;
            }
            let path = self.backup_root.join(&id);
            match fs::create_dir(&path) {
                Ok(()) => return Ok((id, path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create directory {}", path.display()));
                }
            }
        }
        Err(anyhow!("could not allocate a snapshot id for {base}"))
    }

    fn write_metadata(&self, snapshot: &Snapshot) -> Result<()> {
        let path = self.metadata_path(&snapshot.snapshot_id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
        fs::write(&tmp, format!("{contents}\n"))
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }

    fn metadata_path(&self, snapshot_id: &str) -> PathBuf {
        self.backup_root
            .join(format!("{snapshot_id}.{METADATA_EXT}"))
    }
}

/// `snap_<YYYYmmdd_HHMMSS>_<8 hex chars of sha256(source path)>`.
fn snapshot_id_base(source: &Path, now: chrono::DateTime<Utc>) -> String {
    let digest = Sha256::digest(source.to_string_lossy().as_bytes());
    let short = hex::encode(digest);
    format!("snap_{}_{}", now.format("%Y%m%d_%H%M%S"), &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::SyncBackend;
    use crate::io::tool::SystemToolRunner;
    use chrono::TimeZone;

    fn config() -> ChangeguardConfig {
        let mut cfg = ChangeguardConfig::default();
        cfg.sync.backend = SyncBackend::Native;
        cfg
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn id_has_timestamp_and_path_hash() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        let id = snapshot_id_base(Path::new("/srv/app"), now);
        assert!(id.starts_with("snap_20260304_050607_"));
        assert_eq!(id.len(), "snap_20260304_050607_".len() + 8);
        assert_eq!(id, snapshot_id_base(Path::new("/srv/app"), now));
        assert_ne!(id, snapshot_id_base(Path::new("/srv/other"), now));
    }

    #[test]
    fn create_writes_backup_metadata_and_gitignore() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "src/app.py", "x = 1\n");
        write(temp.path(), ".git/HEAD", "ref");
        let cfg = config();
        let store = SnapshotStore::from_config(&SystemToolRunner, temp.path(), &cfg);

        let snapshot = store.create().expect("create");

        assert_eq!(snapshot.file_count, 1);
        assert!(snapshot.backup_path.join("src/app.py").exists());
        assert!(!snapshot.backup_path.join(".git").exists());
        assert_eq!(
            fs::read_to_string(store.backup_root().join(".gitignore")).expect("read"),
            "*\n"
        );
        assert_eq!(store.load(&snapshot.snapshot_id).expect("load"), snapshot);
        store.verify(&snapshot).expect("verify");
    }

    #[test]
    fn ids_are_unique_within_one_second() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a.txt", "a");
        let cfg = config();
        let store = SnapshotStore::from_config(&SystemToolRunner, temp.path(), &cfg);
        let first = store.create().expect("create");
        let second = store.create().expect("create");
        assert_ne!(first.snapshot_id, second.snapshot_id);
        assert_eq!(store.list().expect("list").len(), 2);
    }

    #[test]
    fn restore_undoes_edits_and_removes_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "src/app.py", "x = 1\n");
        write(temp.path(), ".git/HEAD", "ref");
        let cfg = config();
        let store = SnapshotStore::from_config(&SystemToolRunner, temp.path(), &cfg);
        let snapshot = store.create().expect("create");

        write(temp.path(), "src/app.py", "x = 2\n");
        write(temp.path(), "src/new.py", "y = 1\n");
        fs::remove_file(temp.path().join(".git/HEAD")).expect("rm");
        write(temp.path(), ".git/HEAD", "other");

        store.restore(&snapshot).expect("restore");

        assert_eq!(
            fs::read_to_string(temp.path().join("src/app.py")).expect("read"),
            "x = 1\n"
        );
        assert!(!temp.path().join("src/new.py").exists());
        // Excluded paths are not part of the snapshot and stay as they are.
        assert_eq!(
            fs::read_to_string(temp.path().join(".git/HEAD")).expect("read"),
            "other"
        );
        assert!(!snapshot.backup_path.exists());
        assert!(store.load(&snapshot.snapshot_id).is_err());
    }

    #[test]
    fn restore_refuses_missing_or_corrupted_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a.txt", "a");
        let cfg = config();
        let store = SnapshotStore::from_config(&SystemToolRunner, temp.path(), &cfg);

        let snapshot = store.create().expect("create");
        write(&snapshot.backup_path, "a.txt", "tampered");
        write(temp.path(), "a.txt", "edited");
        let err = store.restore(&snapshot).unwrap_err();
        assert!(err.to_string().contains("corrupted"));
        assert_eq!(
            fs::read_to_string(temp.path().join("a.txt")).expect("read"),
            "edited"
        );
        assert!(snapshot.backup_path.exists());

        let gone = store.create().expect("create");
        fs::remove_dir_all(&gone.backup_path).expect("rm");
        let err = store.restore(&gone).unwrap_err();
        assert!(err.to_string().contains("backup missing"));
    }

    #[test]
    fn load_rejects_path_like_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = config();
        let store = SnapshotStore::from_config(&SystemToolRunner, temp.path(), &cfg);
        assert!(store.load("../config").is_err());
        assert!(store.load("").is_err());
    }
}
