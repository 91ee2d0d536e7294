use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::debug;
use md5::{Digest, Md5};
use thiserror::Error;

/// Still-image formats recognized as group primaries.
pub const IMAGE_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "tif", "tiff", "gif", "bmp", "webp", "dng", "cr2", "nef",
    "arw",
];

/// Movie formats; a video co-located with a same-stem still becomes the
/// motion half of a Live Photo.
pub const VIDEO_EXTS: &[&str] = &["mov", "mp4", "m4v", "avi", "mkv", "3gp"];

/// iOS edit-record sidecars.
pub const SIDECAR_EXTS: &[&str] = &["aae"];

const MAX_SUFFIX_ATTEMPTS: usize = 1000;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no free name for {desired:?} in {dir:?} after 1000 attempts")]
    TargetExists { dir: PathBuf, desired: String },

    #[error("move failed {src:?} -> {dst:?}: {source}")]
    MoveFailed {
        src: PathBuf,
        dst: PathBuf,
        source: io::Error,
    },

    #[error("copy verification mismatch {src:?} -> {dst:?}")]
    CopyMismatch { src: PathBuf, dst: PathBuf },
}

impl PathError {
    /// Error kind recorded in the audit trail.
    pub fn kind(&self) -> &'static str {
        match self {
            PathError::TargetExists { .. } => "target_exists",
            PathError::MoveFailed { .. } | PathError::CopyMismatch { .. } => "move_failed",
            PathError::Io(_) => "io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    PrimaryImage,
    PrimaryVideo,
    Sidecar,
    Unknown,
}

/// Lowercased extension, if any.
pub fn ext_lower(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Classifies a path by case-insensitive extension.
pub fn classify(path: &Path) -> FileKind {
    match ext_lower(path) {
        Some(ext) if IMAGE_EXTS.contains(&ext.as_str()) => FileKind::PrimaryImage,
        Some(ext) if VIDEO_EXTS.contains(&ext.as_str()) => FileKind::PrimaryVideo,
        Some(ext) if SIDECAR_EXTS.contains(&ext.as_str()) => FileKind::Sidecar,
        _ => FileKind::Unknown,
    }
}

/// Lowercased stem used for Live Photo pairing and sidecar binding.
pub fn stem_lower(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn suffixed(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{n}.{ext}"),
        _ => format!("{name}_{n}"),
    }
}

fn join_name(stem: &str, ext: Option<&str>) -> String {
    match ext {
        Some(e) if !e.is_empty() => format!("{stem}.{e}"),
        _ => stem.to_string(),
    }
}

/// Claims a collision-free destination in `dir` by creating a zero-byte
/// placeholder with create-new semantics; the caller moves the real file
/// over it. `name.ext`, `name_1.ext`, ... are tried in order.
pub fn claim_unique(dir: &Path, desired: &str) -> Result<PathBuf, PathError> {
    fs::create_dir_all(dir)?;
    for n in 0..MAX_SUFFIX_ATTEMPTS {
        let candidate = dir.join(suffixed(desired, n));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(PathError::Io(e)),
        }
    }
    Err(PathError::TargetExists {
        dir: dir.to_path_buf(),
        desired: desired.to_string(),
    })
}

/// Picks the name a claim would have picked without touching the
/// filesystem. Dry runs only.
pub fn peek_unique(dir: &Path, desired: &str) -> Result<PathBuf, PathError> {
    for n in 0..MAX_SUFFIX_ATTEMPTS {
        let candidate = dir.join(suffixed(desired, n));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(PathError::TargetExists {
        dir: dir.to_path_buf(),
        desired: desired.to_string(),
    })
}

/// Placement plan for one media group: a shared stem with the primary and
/// every satellite name reserved together.
#[derive(Debug)]
pub struct GroupPlan {
    pub stem: String,
    pub primary: PathBuf,
    pub satellites: Vec<PathBuf>,
}

impl GroupPlan {
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut all = vec![self.primary.clone()];
        all.extend(self.satellites.iter().cloned());
        all
    }
}

/// Reserves a stem in `dir` that is free for the primary extension and all
/// satellite extensions at once. With `claim` set, zero-byte placeholders
/// hold the names until the moves land; without it (dry run) only
/// existence is consulted.
pub fn reserve_group(
    dir: &Path,
    stem: &str,
    primary_ext: Option<&str>,
    satellite_exts: &[String],
    claim: bool,
) -> Result<GroupPlan, PathError> {
    if claim {
        fs::create_dir_all(dir)?;
    }
    'next_stem: for n in 0..MAX_SUFFIX_ATTEMPTS {
        let candidate = if n == 0 {
            stem.to_string()
        } else {
            format!("{stem}_{n}")
        };
        let primary = dir.join(join_name(&candidate, primary_ext));
        let satellites: Vec<PathBuf> = satellite_exts
            .iter()
            .map(|ext| dir.join(join_name(&candidate, Some(ext))))
            .collect();
        let mut wanted = vec![primary.clone()];
        wanted.extend(satellites.iter().cloned());

        if claim {
            let mut claimed: Vec<PathBuf> = Vec::new();
            for path in &wanted {
                match OpenOptions::new().write(true).create_new(true).open(path) {
                    Ok(_) => claimed.push(path.clone()),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        release_claims(&claimed);
                        continue 'next_stem;
                    }
                    Err(e) => {
                        release_claims(&claimed);
                        return Err(PathError::Io(e));
                    }
                }
            }
        } else if wanted.iter().any(|p| p.exists()) {
            continue;
        }

        return Ok(GroupPlan {
            stem: candidate,
            primary,
            satellites,
        });
    }
    Err(PathError::TargetExists {
        dir: dir.to_path_buf(),
        desired: stem.to_string(),
    })
}

/// Removes placeholder files left by an abandoned reservation.
pub fn release_claims(claimed: &[PathBuf]) {
    for path in claimed {
        let _ = fs::remove_file(path);
    }
}

/// Moves `src` to `dst`, falling back to copy-verify-delete when the
/// rename crosses filesystems. `dst` may be a previously claimed
/// placeholder.
pub fn safe_move(src: &Path, dst: &Path) -> Result<(), PathError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => copy_verify_delete(src, dst),
        Err(source) => Err(PathError::MoveFailed {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source,
        }),
    }
}

fn copy_verify_delete(src: &Path, dst: &Path) -> Result<(), PathError> {
    debug!(
        "cross-device move, copying {} -> {}",
        src.display(),
        dst.display()
    );
    fs::copy(src, dst)?;
    if file_md5(src)? != file_md5(dst)? {
        let _ = fs::remove_file(dst);
        return Err(PathError::CopyMismatch {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
    }
    fs::remove_file(src)?;
    Ok(())
}

fn file_md5(path: &Path) -> Result<String, PathError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Path of `path` relative to `base`; falls back to the bare file name
/// when `path` is not under `base`.
pub fn relative_to(base: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default())
}
