//! Frame persistence boundary.
//!
//! The analyzer never owns frames. It reads image bytes, selects frames for
//! batch runs and reports status changes through [`FrameSource`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use cache::FrameId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AnalysisError;

/// Analysis state of a frame as tracked by the frame store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    #[default]
    Imported,
    Analyzed,
    /// Its embeddings were removed; results are stale.
    NeedsAnalysis,
    Failed,
}

/// Batch selection criteria. Unset fields match every frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFilter {
    pub movie_id: Option<i64>,
    pub status: Option<FrameStatus>,
    /// Frames carrying any of these tags.
    pub tags: Vec<String>,
    /// Frames where this cast member was detected.
    pub cast_member_id: Option<i64>,
    /// Stored `time_of_day` attribute value. Resolved against the attribute
    /// store by the analyzer, so frame sources ignore it.
    pub time_of_day: Option<String>,
}

pub trait FrameSource: Send + Sync {
    fn exists(&self, frame_id: FrameId) -> Result<bool, AnalysisError>;

    /// Encoded image bytes of the frame.
    fn load_image(&self, frame_id: FrameId) -> Result<Vec<u8>, AnalysisError>;

    /// Up to `limit` matching frame ids, ascending.
    fn select(&self, filter: &FrameFilter, limit: usize) -> Result<Vec<FrameId>, AnalysisError>;

    fn mark_needs_analysis(&self, frame_id: FrameId) -> Result<(), AnalysisError>;

    fn mark_analyzed(&self, _frame_id: FrameId) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn mark_failed(&self, _frame_id: FrameId, _reason: &str) -> Result<(), AnalysisError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameEntry {
    pub image: Vec<u8>,
    pub movie_id: Option<i64>,
    pub tags: Vec<String>,
    /// Cast members detected in the frame.
    pub cast: Vec<i64>,
    pub status: FrameStatus,
    pub failure: Option<String>,
}

impl FrameEntry {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            ..Self::default()
        }
    }

    pub fn with_movie(mut self, movie_id: i64) -> Self {
        self.movie_id = Some(movie_id);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cast<I: IntoIterator<Item = i64>>(mut self, cast: I) -> Self {
        self.cast = cast.into_iter().collect();
        self
    }

    fn matches(&self, filter: &FrameFilter) -> bool {
        filter.movie_id.is_none_or(|m| self.movie_id == Some(m))
            && filter.status.is_none_or(|s| self.status == s)
            && (filter.tags.is_empty() || filter.tags.iter().any(|t| self.tags.contains(t)))
            && filter.cast_member_id.is_none_or(|c| self.cast.contains(&c))
    }
}

#[derive(Default)]
pub struct InMemoryFrameSource {
    frames: RwLock<BTreeMap<FrameId, FrameEntry>>,
}

impl InMemoryFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, frame_id: FrameId, image: Vec<u8>) {
        self.insert_entry(frame_id, FrameEntry::new(image));
    }

    pub fn insert_entry(&self, frame_id: FrameId, entry: FrameEntry) {
        self.frames
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(frame_id, entry);
    }

    pub fn entry(&self, frame_id: FrameId) -> Option<FrameEntry> {
        self.frames
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&frame_id)
            .cloned()
    }

    pub fn status(&self, frame_id: FrameId) -> Option<FrameStatus> {
        self.entry(frame_id).map(|e| e.status)
    }

    fn update<F>(&self, frame_id: FrameId, f: F) -> Result<(), AnalysisError>
    where
        F: FnOnce(&mut FrameEntry),
    {
        let mut guard = self
            .frames
            .write()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?;
        let entry = guard
            .get_mut(&frame_id)
            .ok_or(AnalysisError::FrameNotFound(frame_id))?;
        f(entry);
        Ok(())
    }
}

impl FrameSource for InMemoryFrameSource {
    fn exists(&self, frame_id: FrameId) -> Result<bool, AnalysisError> {
        let guard = self
            .frames
            .read()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?;
        Ok(guard.contains_key(&frame_id))
    }

    fn load_image(&self, frame_id: FrameId) -> Result<Vec<u8>, AnalysisError> {
        let guard = self
            .frames
            .read()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?;
        guard
            .get(&frame_id)
            .map(|e| e.image.clone())
            .ok_or(AnalysisError::FrameNotFound(frame_id))
    }

    fn select(&self, filter: &FrameFilter, limit: usize) -> Result<Vec<FrameId>, AnalysisError> {
        let guard = self
            .frames
            .read()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?;
        Ok(guard
            .iter()
            .filter(|(_, entry)| entry.matches(filter))
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }

    fn mark_needs_analysis(&self, frame_id: FrameId) -> Result<(), AnalysisError> {
        self.update(frame_id, |e| e.status = FrameStatus::NeedsAnalysis)
    }

    fn mark_analyzed(&self, frame_id: FrameId) -> Result<(), AnalysisError> {
        self.update(frame_id, |e| {
            e.status = FrameStatus::Analyzed;
            e.failure = None;
        })
    }

    fn mark_failed(&self, frame_id: FrameId, reason: &str) -> Result<(), AnalysisError> {
        self.update(frame_id, |e| {
            e.status = FrameStatus::Failed;
            e.failure = Some(reason.to_string());
        })
    }
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Frames stored as `{frame_id}.{png,jpg,jpeg,webp}` in one directory.
///
/// Files carry no movie, tag or cast metadata, so filters on those match
/// nothing. The id to path index is built on open and rebuilt when a lookup
/// misses or a listed file has gone. Status changes live in memory for the
/// life of the source.
pub struct DirectoryFrameSource {
    root: PathBuf,
    index: RwLock<BTreeMap<FrameId, PathBuf>>,
    statuses: RwLock<HashMap<FrameId, FrameStatus>>,
}

impl DirectoryFrameSource {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, AnalysisError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(AnalysisError::frame_source(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let index = scan_dir(&root)?;
        debug!(root = %root.display(), frames = index.len(), "indexed frame directory");
        Ok(Self {
            root,
            index: RwLock::new(index),
            statuses: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rescans the directory and replaces the index.
    pub fn refresh(&self) -> Result<(), AnalysisError> {
        let fresh = scan_dir(&self.root)?;
        *self
            .index
            .write()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))? = fresh;
        Ok(())
    }

    fn indexed(&self, frame_id: FrameId) -> Result<Option<PathBuf>, AnalysisError> {
        let guard = self
            .index
            .read()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?;
        Ok(guard.get(&frame_id).cloned())
    }

    fn path_of(&self, frame_id: FrameId) -> Result<Option<PathBuf>, AnalysisError> {
        if let Some(path) = self.indexed(frame_id)? {
            return Ok(Some(path));
        }
        self.refresh()?;
        self.indexed(frame_id)
    }

    fn status(&self, frame_id: FrameId) -> FrameStatus {
        self.statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&frame_id)
            .copied()
            .unwrap_or_default()
    }

    fn set_status(&self, frame_id: FrameId, status: FrameStatus) -> Result<(), AnalysisError> {
        if self.path_of(frame_id)?.is_none() {
            return Err(AnalysisError::FrameNotFound(frame_id));
        }
        self.statuses
            .write()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?
            .insert(frame_id, status);
        Ok(())
    }
}

fn scan_dir(root: &Path) -> Result<BTreeMap<FrameId, PathBuf>, AnalysisError> {
    let mut frames = BTreeMap::new();
    for entry in fs::read_dir(root).map_err(AnalysisError::frame_source)? {
        let path = entry.map_err(AnalysisError::frame_source)?.path();
        let known_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !known_ext {
            continue;
        }
        match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<FrameId>) {
            Some(Ok(frame_id)) => {
                frames.insert(frame_id, path);
            }
            _ => debug!(path = %path.display(), "ignoring file without a numeric frame id"),
        }
    }
    Ok(frames)
}

impl FrameSource for DirectoryFrameSource {
    fn exists(&self, frame_id: FrameId) -> Result<bool, AnalysisError> {
        Ok(self.path_of(frame_id)?.is_some())
    }

    fn load_image(&self, frame_id: FrameId) -> Result<Vec<u8>, AnalysisError> {
        let path = self
            .path_of(frame_id)?
            .ok_or(AnalysisError::FrameNotFound(frame_id))?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.refresh()?;
                Err(AnalysisError::FrameNotFound(frame_id))
            }
            Err(err) => Err(AnalysisError::frame_source(err)),
        }
    }

    fn select(&self, filter: &FrameFilter, limit: usize) -> Result<Vec<FrameId>, AnalysisError> {
        if filter.movie_id.is_some() || !filter.tags.is_empty() || filter.cast_member_id.is_some()
        {
            return Ok(Vec::new());
        }
        // Batch selection sees files added since the last lookup.
        self.refresh()?;
        let guard = self
            .index
            .read()
            .map_err(|_| AnalysisError::frame_source("poisoned lock"))?;
        Ok(guard
            .keys()
            .copied()
            .filter(|id| filter.status.is_none_or(|s| self.status(*id) == s))
            .take(limit)
            .collect())
    }

    fn mark_needs_analysis(&self, frame_id: FrameId) -> Result<(), AnalysisError> {
        self.set_status(frame_id, FrameStatus::NeedsAnalysis)
    }

    fn mark_analyzed(&self, frame_id: FrameId) -> Result<(), AnalysisError> {
        self.set_status(frame_id, FrameStatus::Analyzed)
    }

    fn mark_failed(&self, frame_id: FrameId, _reason: &str) -> Result<(), AnalysisError> {
        self.set_status(frame_id, FrameStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_select_applies_filter_and_limit() {
        let source = InMemoryFrameSource::new();
        source.insert_entry(1, FrameEntry::new(vec![1]).with_movie(10).with_tags(["night"]));
        source.insert_entry(2, FrameEntry::new(vec![2]).with_movie(10));
        source.insert_entry(3, FrameEntry::new(vec![3]).with_movie(11).with_tags(["night"]));
        source.mark_needs_analysis(2).unwrap();

        let all = source.select(&FrameFilter::default(), 10).unwrap();
        assert_eq!(all, vec![1, 2, 3]);
        assert_eq!(source.select(&FrameFilter::default(), 2).unwrap(), vec![1, 2]);

        let movie = FrameFilter {
            movie_id: Some(10),
            ..FrameFilter::default()
        };
        assert_eq!(source.select(&movie, 10).unwrap(), vec![1, 2]);

        let tagged = FrameFilter {
            tags: vec!["night".into()],
            ..FrameFilter::default()
        };
        assert_eq!(source.select(&tagged, 10).unwrap(), vec![1, 3]);

        let stale = FrameFilter {
            status: Some(FrameStatus::NeedsAnalysis),
            ..FrameFilter::default()
        };
        assert_eq!(source.select(&stale, 10).unwrap(), vec![2]);
    }

    #[test]
    fn in_memory_select_by_cast_member() {
        let source = InMemoryFrameSource::new();
        source.insert_entry(1, FrameEntry::new(vec![1]).with_cast([100, 101]));
        source.insert_entry(2, FrameEntry::new(vec![2]).with_cast([101]));
        source.insert_entry(3, FrameEntry::new(vec![3]));

        let cast = |id| FrameFilter {
            cast_member_id: Some(id),
            ..FrameFilter::default()
        };
        assert_eq!(source.select(&cast(101), 10).unwrap(), vec![1, 2]);
        assert_eq!(source.select(&cast(100), 10).unwrap(), vec![1]);
        assert!(source.select(&cast(999), 10).unwrap().is_empty());
    }

    #[test]
    fn in_memory_status_transitions() {
        let source = InMemoryFrameSource::new();
        source.insert(4, vec![0]);
        assert_eq!(source.status(4), Some(FrameStatus::Imported));
        source.mark_failed(4, "bad bytes").unwrap();
        assert_eq!(source.entry(4).unwrap().failure.as_deref(), Some("bad bytes"));
        source.mark_analyzed(4).unwrap();
        assert_eq!(source.status(4), Some(FrameStatus::Analyzed));
        assert!(source.entry(4).unwrap().failure.is_none());
        assert_eq!(
            source.mark_needs_analysis(5).unwrap_err(),
            AnalysisError::FrameNotFound(5)
        );
    }

    #[test]
    fn directory_source_reads_numeric_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("7.png"), b"seven").unwrap();
        fs::write(dir.path().join("3.JPG"), b"three").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip").unwrap();
        fs::write(dir.path().join("cover.png"), b"skip").unwrap();

        let source = DirectoryFrameSource::open(dir.path()).unwrap();
        assert_eq!(source.select(&FrameFilter::default(), 10).unwrap(), vec![3, 7]);
        assert_eq!(source.load_image(7).unwrap(), b"seven".to_vec());
        assert!(source.exists(7).unwrap());
        assert!(!source.exists(8).unwrap());
        assert_eq!(source.load_image(8).unwrap_err(), AnalysisError::FrameNotFound(8));

        source.mark_needs_analysis(7).unwrap();
        let stale = FrameFilter {
            status: Some(FrameStatus::NeedsAnalysis),
            ..FrameFilter::default()
        };
        assert_eq!(source.select(&stale, 10).unwrap(), vec![7]);
    }

    #[test]
    fn directory_index_follows_added_and_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1.png"), b"one").unwrap();
        let source = DirectoryFrameSource::open(dir.path()).unwrap();

        fs::write(dir.path().join("2.webp"), b"two").unwrap();
        assert!(source.exists(2).unwrap());
        assert_eq!(source.load_image(2).unwrap(), b"two".to_vec());

        fs::remove_file(dir.path().join("1.png")).unwrap();
        assert_eq!(source.load_image(1).unwrap_err(), AnalysisError::FrameNotFound(1));
        assert!(!source.exists(1).unwrap());
        assert_eq!(source.select(&FrameFilter::default(), 10).unwrap(), vec![2]);

        let cast = FrameFilter {
            cast_member_id: Some(4),
            ..FrameFilter::default()
        };
        assert!(source.select(&cast, 10).unwrap().is_empty());
    }
}
