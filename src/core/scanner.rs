use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::debug;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::Config;
use crate::core::paths::{classify, stem_lower, FileKind};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid exclude pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// One logical media unit: a primary plus the satellites that must travel
/// with it.
#[derive(Debug, Clone)]
pub struct MediaGroup {
    pub primary: PathBuf,
    pub kind: FileKind,
    pub live_video: Option<PathBuf>,
    pub sidecars: Vec<PathBuf>,
}

impl MediaGroup {
    fn standalone(primary: PathBuf, kind: FileKind) -> Self {
        Self {
            primary,
            kind,
            live_video: None,
            sidecars: Vec::new(),
        }
    }

    /// Primary first, then satellites, in placement order.
    pub fn files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = vec![&self.primary];
        if let Some(video) = &self.live_video {
            files.push(video);
        }
        files.extend(self.sidecars.iter().map(PathBuf::as_path));
        files
    }

    pub fn satellites(&self) -> Vec<&Path> {
        let mut satellites: Vec<&Path> = Vec::new();
        if let Some(video) = &self.live_video {
            satellites.push(video);
        }
        satellites.extend(self.sidecars.iter().map(PathBuf::as_path));
        satellites
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub groups: Vec<MediaGroup>,
    pub orphan_sidecars: Vec<PathBuf>,
    pub unrecognized: Vec<PathBuf>,
}

/// Walks a tree once and reconstructs logical media groups from the flat
/// file listing.
pub struct MediaScanner {
    exclude: Vec<Pattern>,
    skip_roots: Vec<PathBuf>,
}

impl MediaScanner {
    pub fn new(config: &Config) -> Result<Self, ScanError> {
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| ScanError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            exclude,
            skip_roots: vec![
                config.dest.clone(),
                config.dup_dir.clone(),
                config.orphan_aae_dir.clone(),
                config.second_check_dir.clone(),
                config.data_dir.clone(),
            ],
        })
    }

    /// All regular files under `root` in deterministic (sorted) order,
    /// skipping hidden entries, symlinks, excluded globs, and the tool's
    /// own output directories.
    pub fn collect_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
            });
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if self
                .skip_roots
                .iter()
                .any(|r| r != root && path.starts_with(r))
            {
                continue;
            }
            let text = path.to_string_lossy();
            if self.exclude.iter().any(|p| p.matches(&text)) {
                debug!("excluded by pattern: {}", path.display());
                continue;
            }
            files.push(path.to_path_buf());
        }
        files
    }

    /// Scans the source tree and binds primaries to their satellites.
    ///
    /// Pairing rules, per directory and lowercased stem: exactly one still
    /// plus exactly one video form a Live Photo (still is primary);
    /// ambiguous stems degrade every candidate to an independent group; a
    /// sidecar binds to the first group sharing its stem, or becomes an
    /// orphan.
    pub fn scan(&self, root: &Path) -> ScanOutcome {
        #[derive(Default)]
        struct DirBucket {
            images: BTreeMap<String, Vec<PathBuf>>,
            videos: BTreeMap<String, Vec<PathBuf>>,
            sidecars: Vec<PathBuf>,
        }

        let mut dirs: BTreeMap<PathBuf, DirBucket> = BTreeMap::new();
        let mut outcome = ScanOutcome::default();

        for path in self.collect_files(root) {
            let parent = path.parent().unwrap_or(root).to_path_buf();
            let bucket = dirs.entry(parent).or_default();
            match classify(&path) {
                FileKind::PrimaryImage => bucket
                    .images
                    .entry(stem_lower(&path))
                    .or_default()
                    .push(path),
                FileKind::PrimaryVideo => bucket
                    .videos
                    .entry(stem_lower(&path))
                    .or_default()
                    .push(path),
                FileKind::Sidecar => bucket.sidecars.push(path),
                FileKind::Unknown => outcome.unrecognized.push(path),
            }
        }

        for (_dir, bucket) in dirs {
            let mut dir_groups: Vec<MediaGroup> = Vec::new();
            {
                let mut stems: Vec<&String> =
                    bucket.images.keys().chain(bucket.videos.keys()).collect();
                stems.sort();
                stems.dedup();

                for stem in stems {
                    let images = bucket.images.get(stem).map(Vec::as_slice).unwrap_or(&[]);
                    let videos = bucket.videos.get(stem).map(Vec::as_slice).unwrap_or(&[]);
                    if images.len() == 1 && videos.len() == 1 {
                        dir_groups.push(MediaGroup {
                            primary: images[0].clone(),
                            kind: FileKind::PrimaryImage,
                            live_video: Some(videos[0].clone()),
                            sidecars: Vec::new(),
                        });
                    } else {
                        // ambiguous stems degrade to independent groups
                        for image in images {
                            dir_groups
                                .push(MediaGroup::standalone(image.clone(), FileKind::PrimaryImage));
                        }
                        for video in videos {
                            dir_groups
                                .push(MediaGroup::standalone(video.clone(), FileKind::PrimaryVideo));
                        }
                    }
                }
            }

            for sidecar in bucket.sidecars {
                let stem = stem_lower(&sidecar);
                match dir_groups
                    .iter_mut()
                    .find(|g| stem_lower(&g.primary) == stem)
                {
                    Some(group) => group.sidecars.push(sidecar),
                    None => outcome.orphan_sidecars.push(sidecar),
                }
            }

            outcome.groups.extend(dir_groups);
        }
        outcome
    }
}
