//! Content checksum of a directory tree.
//!
//! The digest covers every non-excluded regular file and symlink, visited in path order, so it
//! does not depend on directory iteration order or timestamps. Each entry contributes its
//! root-relative path, a kind tag, its length and its bytes (or link target).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::core::exclude::ExcludeRules;

/// SHA-256 digest (hex) and number of files hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub checksum: String,
    pub file_count: u64,
}

pub fn tree_checksum(root: &Path, rules: &ExcludeRules) -> Result<TreeDigest> {
    let mut hasher = Sha256::new();
    let mut file_count = 0u64;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| !rules.is_excluded(rel))
                .unwrap_or(false)
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");

        let (tag, contents) = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("read link {}", entry.path().display()))?;
            (b'L', target.to_string_lossy().into_owned().into_bytes())
        } else {
            let contents =
                fs::read(entry.path()).with_context(|| format!("read {}", entry.path().display()))?;
            (b'F', contents)
        };

        hasher.update(rel.as_bytes());
        hasher.update([0u8, tag]);
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
        file_count += 1;
    }

    Ok(TreeDigest {
        checksum: hex::encode(hasher.finalize()),
        file_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExcludeRules {
        ExcludeRules::new([".git", "*.pyc"]).with_anchored(".changeguard")
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn identical_trees_hash_identically() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        for root in [a.path(), b.path()] {
            write(root, "src/app.py", "print('hi')\n");
            write(root, "README.md", "# demo\n");
        }
        let da = tree_checksum(a.path(), &rules()).expect("checksum");
        let db = tree_checksum(b.path(), &rules()).expect("checksum");
        assert_eq!(da, db);
        assert_eq!(da.file_count, 2);
        assert_eq!(da.checksum.len(), 64);
    }

    #[test]
    fn single_byte_change_alters_digest() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "src/app.py", "x = 1\n");
        let before = tree_checksum(temp.path(), &rules()).expect("checksum");
        write(temp.path(), "src/app.py", "x = 2\n");
        let after = tree_checksum(temp.path(), &rules()).expect("checksum");
        assert_ne!(before.checksum, after.checksum);
    }

    #[test]
    fn moving_content_between_files_alters_digest() {
        let a = tempfile::tempdir().expect("tempdir");
        write(a.path(), "a.txt", "ab");
        write(a.path(), "b.txt", "");
        let b = tempfile::tempdir().expect("tempdir");
        write(b.path(), "a.txt", "a");
        write(b.path(), "b.txt", "b");
        assert_ne!(
            tree_checksum(a.path(), &rules()).expect("checksum").checksum,
            tree_checksum(b.path(), &rules()).expect("checksum").checksum
        );
    }

    #[test]
    fn excluded_paths_do_not_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "src/app.py", "x = 1\n");
        let before = tree_checksum(temp.path(), &rules()).expect("checksum");

        write(temp.path(), ".git/HEAD", "ref: refs/heads/main\n");
        write(temp.path(), "src/app.cpython-312.pyc", "\0\0");
        write(temp.path(), ".changeguard/snapshots/snap_1/src/app.py", "x = 0\n");
        let after = tree_checksum(temp.path(), &rules()).expect("checksum");
        assert_eq!(before, after);
    }

    #[test]
    fn empty_tree_has_zero_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let digest = tree_checksum(temp.path(), &rules()).expect("checksum");
        assert_eq!(digest.file_count, 0);
    }
}
