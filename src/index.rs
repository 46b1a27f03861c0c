//! Photo index abstraction and its two concrete backends.
//!
//! A [`PhotoIndex`] hands out an [`IndexCursor`] over its rows sorted newest
//! first, with the [`FilterMode`] applied by the index itself. The page source
//! drives the cursor; it never filters rows on its own.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::error::StorageError;
use crate::events::{FilterMode, Locator, PhotoId, PhotoRef};

/// Source of photo metadata rows.
pub trait PhotoIndex: Send + Sync {
    /// Open a cursor over the rows visible under `filter`, newest first.
    ///
    /// # Errors
    /// Returns [`StorageError::Unavailable`] when the store cannot be read.
    fn open(&self, filter: FilterMode) -> Result<Box<dyn IndexCursor>, StorageError>;
}

/// Forward-reading cursor with explicit repositioning.
pub trait IndexCursor: Send {
    /// Number of rows behind this cursor.
    fn row_count(&self) -> usize;

    /// Position the cursor so that the next [`IndexCursor::next_row`] yields `row`.
    ///
    /// `row == row_count()` is valid and leaves the cursor exhausted.
    fn seek(&mut self, row: usize) -> Result<(), StorageError>;

    /// Read the row under the cursor and advance past it.
    fn next_row(&mut self) -> Result<Option<PhotoRef>, StorageError>;
}

/// Cursor over an already-materialized, already-filtered row set.
#[derive(Debug)]
pub struct SnapshotCursor {
    rows: Vec<PhotoRef>,
    position: usize,
}

impl SnapshotCursor {
    pub fn new(rows: Vec<PhotoRef>) -> Self {
        Self { rows, position: 0 }
    }
}

impl IndexCursor for SnapshotCursor {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn seek(&mut self, row: usize) -> Result<(), StorageError> {
        if row > self.rows.len() {
            return Err(StorageError::SeekOutOfRange {
                row,
                rows: self.rows.len(),
            });
        }
        self.position = row;
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<PhotoRef>, StorageError> {
        let row = self.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }
}

/// Rows supplied by the host, e.g. from a platform media query.
///
/// Rows are expected newest first; `selected` marks the ids visible under
/// [`FilterMode::SelectionOnly`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    rows: Arc<Vec<PhotoRef>>,
    selected: Arc<HashSet<PhotoId>>,
}

impl InMemoryIndex {
    pub fn new(rows: Vec<PhotoRef>) -> Self {
        Self {
            rows: Arc::new(rows),
            selected: Arc::default(),
        }
    }

    pub fn with_selection(mut self, selected: impl IntoIterator<Item = PhotoId>) -> Self {
        self.selected = Arc::new(selected.into_iter().collect());
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl PhotoIndex for InMemoryIndex {
    fn open(&self, filter: FilterMode) -> Result<Box<dyn IndexCursor>, StorageError> {
        let rows = match filter {
            FilterMode::All => self.rows.as_ref().clone(),
            FilterMode::SelectionOnly => self
                .rows
                .iter()
                .filter(|row| self.selected.contains(&row.id))
                .cloned()
                .collect(),
        };
        Ok(Box::new(SnapshotCursor::new(rows)))
    }
}

/// Photo library rooted at a directory on disk.
///
/// Files are ordered by creation time, newest first (modification time when
/// the platform does not record creation), ties broken by path. The optional
/// selection list plays the role of a limited-access grant.
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    root: PathBuf,
    selection: Arc<HashSet<PathBuf>>,
}

impl DirectoryIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            selection: Arc::default(),
        }
    }

    /// Paths are resolved relative to the library root when not absolute.
    pub fn with_selection(mut self, selection: impl IntoIterator<Item = PathBuf>) -> Self {
        let root = self.root.clone();
        self.selection = Arc::new(
            selection
                .into_iter()
                .map(|p| if p.is_absolute() { p } else { root.join(p) })
                .collect(),
        );
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect(&self, filter: FilterMode) -> Result<Vec<PhotoRef>, StorageError> {
        if !self.root.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a readable directory",
                self.root.display()
            )));
        }

        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !is_supported_image(path) {
                continue;
            }
            if filter == FilterMode::SelectionOnly && !self.selection.contains(path) {
                continue;
            }
            let created = entry
                .metadata()
                .ok()
                .and_then(|m| m.created().or_else(|_| m.modified()).ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((created, path.to_path_buf()));
        }

        found.sort_by(|(ta, pa), (tb, pb)| tb.cmp(ta).then_with(|| pa.cmp(pb)));
        debug!(rows = found.len(), ?filter, "directory index materialized");

        Ok(found
            .into_iter()
            .map(|(_, path)| PhotoRef {
                id: stable_id(&path),
                display_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                locator: Locator::Path(path),
            })
            .collect())
    }
}

impl PhotoIndex for DirectoryIndex {
    fn open(&self, filter: FilterMode) -> Result<Box<dyn IndexCursor>, StorageError> {
        let rows = self.collect(filter)?;
        info!(root = %self.root.display(), rows = rows.len(), ?filter, "opened photo index");
        Ok(Box::new(SnapshotCursor::new(rows)))
    }
}

fn stable_id(path: &Path) -> PhotoId {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    PhotoId(hasher.finish())
}

/// Return `true` if `path` has an extension the loader can decode.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    const EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            EXTS.iter().any(|e| *e == ext)
        })
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    // Never skip the root; tempfile roots can be dot-dirs.
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn row(id: u64) -> PhotoRef {
        PhotoRef {
            id: PhotoId(id),
            locator: Locator::Path(PathBuf::from(format!("/photos/{id}.jpg"))),
            display_name: format!("{id}.jpg"),
        }
    }

    #[test]
    fn snapshot_cursor_seeks_and_reads() {
        let mut cursor = SnapshotCursor::new((0..5).map(row).collect());
        assert_eq!(cursor.row_count(), 5);
        cursor.seek(3).unwrap();
        assert_eq!(cursor.next_row().unwrap().unwrap().id, PhotoId(3));
        assert_eq!(cursor.next_row().unwrap().unwrap().id, PhotoId(4));
        assert!(cursor.next_row().unwrap().is_none());
        cursor.seek(5).unwrap();
        assert!(cursor.next_row().unwrap().is_none());
        assert!(matches!(
            cursor.seek(6),
            Err(StorageError::SeekOutOfRange { row: 6, rows: 5 })
        ));
    }

    #[test]
    fn in_memory_selection_filter() {
        let index = InMemoryIndex::new((0..6).map(row).collect())
            .with_selection([PhotoId(1), PhotoId(4)]);
        let mut cursor = index.open(FilterMode::SelectionOnly).unwrap();
        assert_eq!(cursor.row_count(), 2);
        assert_eq!(cursor.next_row().unwrap().unwrap().id, PhotoId(1));
        assert_eq!(cursor.next_row().unwrap().unwrap().id, PhotoId(4));
        assert_eq!(index.open(FilterMode::All).unwrap().row_count(), 6);
    }

    #[test]
    fn directory_index_filters_extensions_and_hidden_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::create_dir_all(root.join(".thumbnails")).unwrap();
        fs::write(root.join("a.jpg"), b"x").unwrap();
        fs::write(root.join("nested").join("b.PNG"), b"x").unwrap();
        fs::write(root.join("notes.txt"), b"x").unwrap();
        fs::write(root.join(".thumbnails").join("c.jpg"), b"x").unwrap();

        let index = DirectoryIndex::new(root);
        let mut cursor = index.open(FilterMode::All).unwrap();
        let mut names = Vec::new();
        while let Some(row) = cursor.next_row().unwrap() {
            names.push(row.display_name);
        }
        names.sort();
        assert_eq!(names, vec!["a.jpg".to_string(), "b.PNG".to_string()]);
    }

    #[test]
    fn directory_index_selection_only() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("a.jpg"), b"x").unwrap();
        fs::write(root.join("b.jpg"), b"x").unwrap();

        let index = DirectoryIndex::new(root).with_selection([PathBuf::from("b.jpg")]);
        let mut cursor = index.open(FilterMode::SelectionOnly).unwrap();
        assert_eq!(cursor.row_count(), 1);
        assert_eq!(cursor.next_row().unwrap().unwrap().display_name, "b.jpg");
    }

    #[test]
    fn ids_are_stable_across_opens() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.jpg"), b"x").unwrap();
        let index = DirectoryIndex::new(tmp.path());
        let first = index.open(FilterMode::All).unwrap().next_row().unwrap().unwrap();
        let second = index.open(FilterMode::All).unwrap().next_row().unwrap().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn missing_root_is_unavailable() {
        let index = DirectoryIndex::new("/definitely/not/here");
        assert!(matches!(
            index.open(FilterMode::All),
            Err(StorageError::Unavailable(_))
        ));
    }
}
