//! Self-balancing directory tree
//!
//! Every directory under the cache root is either a leaf, holding only data
//! files named by digest, or an internal node holding exactly two child
//! directories named by boundary values. A child owns every digest greater
//! than its preceding sibling's boundary and no greater than its own name, so
//! a digest is found by descending into the first child, in ascending name
//! order, whose name is `>=` the digest.
//!
//! Nothing here takes the rebalancing lock; callers in [`super::cache`] do.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::hasher::KeyHash;
use super::types::{CacheError, Result};

/// Inclusive range of digests owned by a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRange {
    pub start: KeyHash,
    pub end: KeyHash,
}

impl NodeRange {
    pub const ROOT: NodeRange = NodeRange {
        start: KeyHash::MIN,
        end: KeyHash::MAX,
    };

    pub fn contains(&self, digest: &KeyHash) -> bool {
        self.start <= *digest && *digest <= self.end
    }
}

/// Boundary-named subdirectories of `dir`, sorted ascending.
pub fn child_boundaries(dir: &Path) -> Result<Vec<(KeyHash, PathBuf)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Ok(boundary) = KeyHash::parse_hex(&name) {
            children.push((boundary, entry.path()));
        }
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

/// Data files directly inside `dir`. Names that are not digests are skipped.
pub fn entry_files(dir: &Path) -> Result<Vec<(KeyHash, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Ok(digest) = KeyHash::parse_hex(&name) {
            files.push((digest, entry.path()));
        }
    }
    Ok(files)
}

/// Split a node's range across its sorted children.
fn child_ranges(
    range: NodeRange,
    children: Vec<(KeyHash, PathBuf)>,
) -> Vec<(PathBuf, NodeRange)> {
    let mut start = range.start;
    let mut out = Vec::with_capacity(children.len());
    for (boundary, path) in children {
        out.push((
            path,
            NodeRange {
                start,
                end: boundary,
            },
        ));
        match boundary.successor() {
            Some(next) => start = next,
            None => break,
        }
    }
    out
}

/// Leaf directory currently responsible for `digest`.
pub fn locate(root: &Path, digest: &KeyHash) -> Result<PathBuf> {
    locate_with_range(root, digest).map(|(leaf, _)| leaf)
}

/// Like [`locate`], also returning the range the leaf owns.
pub fn locate_with_range(root: &Path, digest: &KeyHash) -> Result<(PathBuf, NodeRange)> {
    let mut dir = root.to_path_buf();
    let mut range = NodeRange::ROOT;
    loop {
        let children = child_boundaries(&dir)?;
        if children.is_empty() {
            return Ok((dir, range));
        }
        let next = child_ranges(range, children)
            .into_iter()
            .find(|(_, child)| child.end >= *digest);
        match next {
            Some((child_dir, child_range)) => {
                dir = child_dir;
                range = child_range;
            }
            None => return Err(CacheError::CorruptTree { path: dir }),
        }
    }
}

/// Split `dir` in two if it holds more than `max_node_files` entries.
///
/// The lower child is named by the midpoint of the leaf's range and receives
/// every digest `<=` it; the upper child reuses the leaf's own upper bound.
/// Returns the two child directories when a split happened.
pub fn split_leaf(
    dir: &Path,
    range: NodeRange,
    max_node_files: usize,
) -> Result<Option<(PathBuf, PathBuf)>> {
    let files = entry_files(dir)?;
    if files.len() <= max_node_files {
        return Ok(None);
    }
    if range.start >= range.end {
        warn!(
            "Leaf {} exceeds {} entries but owns a single digest; not splitting",
            dir.display(),
            max_node_files
        );
        return Ok(None);
    }

    let mid = KeyHash::midpoint(&range.start, &range.end);
    let lower = dir.join(mid.to_hex());
    let upper = dir.join(range.end.to_hex());
    fs::create_dir_all(&lower)?;
    fs::create_dir_all(&upper)?;

    let total = files.len();
    let mut moved_lower = 0usize;
    for (digest, path) in files {
        let target_dir = if digest <= mid {
            moved_lower += 1;
            &lower
        } else {
            &upper
        };
        fs::rename(&path, target_dir.join(digest.to_hex()))?;
    }

    info!(
        "Split {} ({} entries): {} -> {}, {} -> {}",
        dir.display(),
        total,
        moved_lower,
        mid,
        total - moved_lower,
        range.end
    );
    Ok(Some((lower, upper)))
}

/// Finish a split that stopped partway: give the node a child owning
/// `range.end` and move data files left beside the children into them.
fn repair_internal_node(
    dir: &Path,
    range: NodeRange,
    mut children: Vec<(KeyHash, PathBuf)>,
) -> Result<Vec<(KeyHash, PathBuf)>> {
    if children.last().is_some_and(|(boundary, _)| *boundary < range.end) {
        let upper = dir.join(range.end.to_hex());
        warn!(
            "Node {} is missing its upper child, creating {}",
            dir.display(),
            range.end
        );
        fs::create_dir_all(&upper)?;
        children.push((range.end, upper));
    }

    let stray = entry_files(dir)?;
    if stray.is_empty() {
        return Ok(children);
    }
    let ranges = child_ranges(range, children.clone());
    for (digest, path) in &stray {
        let Some((child_dir, _)) = ranges.iter().find(|(_, child)| child.end >= *digest) else {
            continue;
        };
        let target = child_dir.join(digest.to_hex());
        if target.exists() {
            // The copy below was written after the split began.
            fs::remove_file(path)?;
        } else {
            fs::rename(path, target)?;
        }
    }
    warn!(
        "Moved {} stray entries out of internal node {}",
        stray.len(),
        dir.display()
    );
    Ok(children)
}

/// Visit every node below `dir`, splitting oversized leaves and descending
/// into freshly created children so one pass can cascade down a path.
/// Internal nodes left inconsistent by an interrupted split are repaired on
/// the way. Returns the number of splits performed.
pub fn rebalance(dir: &Path, range: NodeRange, max_node_files: usize) -> Result<usize> {
    let mut splits = 0usize;
    let mut children = child_boundaries(dir)?;
    if children.is_empty() {
        if split_leaf(dir, range, max_node_files)?.is_none() {
            return Ok(0);
        }
        splits += 1;
        children = child_boundaries(dir)?;
    } else {
        children = repair_internal_node(dir, range, children)?;
    }
    for (child_dir, child_range) in child_ranges(range, children) {
        splits += rebalance(&child_dir, child_range, max_node_files)?;
    }
    Ok(splits)
}

/// Shape of the tree below a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub entries: usize,
    pub leaves: usize,
    pub internal_nodes: usize,
    pub max_depth: usize,
    pub largest_leaf: usize,
}

pub fn shape(root: &Path) -> Result<TreeShape> {
    fn visit(dir: &Path, depth: usize, shape: &mut TreeShape) -> Result<()> {
        let children = child_boundaries(dir)?;
        if children.is_empty() {
            let count = entry_files(dir)?.len();
            shape.leaves += 1;
            shape.entries += count;
            shape.largest_leaf = shape.largest_leaf.max(count);
            shape.max_depth = shape.max_depth.max(depth);
            return Ok(());
        }
        shape.internal_nodes += 1;
        for (_, child) in children {
            visit(&child, depth + 1, shape)?;
        }
        Ok(())
    }

    let mut shape = TreeShape::default();
    visit(root, 0, &mut shape)?;
    debug!("Tree shape under {}: {:?}", root.display(), shape);
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_entry(dir: &Path, key: &str) -> KeyHash {
        let digest = KeyHash::from_key(key);
        fs::write(dir.join(digest.to_hex()), key).unwrap();
        digest
    }

    #[test]
    fn test_empty_tree_root_is_leaf() {
        let temp_dir = tempdir().unwrap();
        let digest = KeyHash::from_key("anything");
        let (leaf, range) = locate_with_range(temp_dir.path(), &digest).unwrap();
        assert_eq!(leaf, temp_dir.path());
        assert_eq!(range, NodeRange::ROOT);
    }

    #[test]
    fn test_locate_is_stable_without_mutation() {
        let temp_dir = tempdir().unwrap();
        for i in 0..20 {
            write_entry(temp_dir.path(), &format!("key-{i}"));
        }
        rebalance(temp_dir.path(), NodeRange::ROOT, 3).unwrap();

        let digest = KeyHash::from_key("key-7");
        let first = locate(temp_dir.path(), &digest).unwrap();
        let second = locate(temp_dir.path(), &digest).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_root_split_uses_seven_f_and_all_f() {
        let temp_dir = tempdir().unwrap();
        for i in 0..5 {
            write_entry(temp_dir.path(), &format!("k{i}"));
        }
        let (lower, upper) = split_leaf(temp_dir.path(), NodeRange::ROOT, 2)
            .unwrap()
            .unwrap();
        let lower_name = lower.file_name().unwrap().to_str().unwrap().to_string();
        let upper_name = upper.file_name().unwrap().to_str().unwrap().to_string();
        assert!(lower_name.starts_with('7'));
        assert!(lower_name[1..].chars().all(|c| c == 'f'));
        assert!(upper_name.chars().all(|c| c == 'f'));
    }

    #[test]
    fn test_split_preserves_count_and_reachability() {
        let temp_dir = tempdir().unwrap();
        let digests: Vec<_> = (0..40)
            .map(|i| write_entry(temp_dir.path(), &format!("entry-{i}")))
            .collect();

        let (lower, upper) = split_leaf(temp_dir.path(), NodeRange::ROOT, 10)
            .unwrap()
            .unwrap();
        let moved = entry_files(&lower).unwrap().len() + entry_files(&upper).unwrap().len();
        assert_eq!(moved, digests.len());
        assert!(entry_files(temp_dir.path()).unwrap().is_empty());

        for digest in &digests {
            let leaf = locate(temp_dir.path(), digest).unwrap();
            assert!(leaf.join(digest.to_hex()).exists());
        }
    }

    #[test]
    fn test_no_split_at_threshold() {
        let temp_dir = tempdir().unwrap();
        for i in 0..3 {
            write_entry(temp_dir.path(), &format!("k{i}"));
        }
        assert!(split_leaf(temp_dir.path(), NodeRange::ROOT, 3)
            .unwrap()
            .is_none());
        assert!(child_boundaries(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_cascades_and_keeps_every_entry_reachable() {
        let temp_dir = tempdir().unwrap();
        let digests: Vec<_> = (0..200)
            .map(|i| write_entry(temp_dir.path(), &format!("https://example.com/{i}")))
            .collect();

        let splits = rebalance(temp_dir.path(), NodeRange::ROOT, 8).unwrap();
        assert!(splits > 1);

        let tree = shape(temp_dir.path()).unwrap();
        assert_eq!(tree.entries, digests.len());
        assert!(tree.largest_leaf <= 8);
        assert!(tree.max_depth >= 2);

        for digest in &digests {
            let (leaf, range) = locate_with_range(temp_dir.path(), digest).unwrap();
            assert!(range.contains(digest));
            assert!(leaf.join(digest.to_hex()).exists());
        }
    }

    #[test]
    fn test_sweep_finishes_split_missing_upper_child() {
        let temp_dir = tempdir().unwrap();
        let digests: Vec<_> = (0..12)
            .map(|i| write_entry(temp_dir.path(), &format!("entry-{i}")))
            .collect();
        let mid = KeyHash::midpoint(&KeyHash::MIN, &KeyHash::MAX);
        fs::create_dir(temp_dir.path().join(mid.to_hex())).unwrap();

        let high = digests.iter().find(|d| **d > mid).unwrap();
        assert!(matches!(
            locate(temp_dir.path(), high),
            Err(CacheError::CorruptTree { .. })
        ));

        rebalance(temp_dir.path(), NodeRange::ROOT, 100).unwrap();
        assert_eq!(child_boundaries(temp_dir.path()).unwrap().len(), 2);
        assert!(entry_files(temp_dir.path()).unwrap().is_empty());
        for digest in &digests {
            let leaf = locate(temp_dir.path(), digest).unwrap();
            assert!(leaf.join(digest.to_hex()).exists());
        }
    }

    #[test]
    fn test_sweep_rehomes_entries_stranded_mid_split() {
        let temp_dir = tempdir().unwrap();
        let digests: Vec<_> = (0..20)
            .map(|i| write_entry(temp_dir.path(), &format!("entry-{i}")))
            .collect();
        let (lower, upper) = split_leaf(temp_dir.path(), NodeRange::ROOT, 5)
            .unwrap()
            .unwrap();

        // Put half the entries back beside the children, as if the renames stopped.
        for digest in digests.iter().step_by(2) {
            let from = if lower.join(digest.to_hex()).exists() {
                &lower
            } else {
                &upper
            };
            fs::rename(
                from.join(digest.to_hex()),
                temp_dir.path().join(digest.to_hex()),
            )
            .unwrap();
        }
        // One stale duplicate whose newer copy already sits in its leaf.
        let duplicate = digests[1];
        fs::write(temp_dir.path().join(duplicate.to_hex()), "stale").unwrap();

        rebalance(temp_dir.path(), NodeRange::ROOT, 100).unwrap();
        assert!(entry_files(temp_dir.path()).unwrap().is_empty());
        assert_eq!(shape(temp_dir.path()).unwrap().entries, digests.len());
        for digest in &digests {
            let leaf = locate(temp_dir.path(), digest).unwrap();
            assert!(leaf.join(digest.to_hex()).exists());
        }
        let leaf = locate(temp_dir.path(), &duplicate).unwrap();
        assert_eq!(
            fs::read_to_string(leaf.join(duplicate.to_hex())).unwrap(),
            "entry-1"
        );
    }

    #[test]
    fn test_non_digest_files_are_ignored() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("index"), "20240101 x: \"y\"\n").unwrap();
        fs::write(temp_dir.path().join(".tmpXYZ"), "partial").unwrap();
        write_entry(temp_dir.path(), "a");
        assert_eq!(entry_files(temp_dir.path()).unwrap().len(), 1);
    }
}
