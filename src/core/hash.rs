use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const READ_CHUNK: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error reading {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("hash worker pool: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    Full,
    Tail,
}

impl HashMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HashMethod::Full => "full",
            HashMethod::Tail => "tail",
        }
    }
}

impl fmt::Display for HashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-phase content identity: MD5 over the whole file for small files,
/// over the final `tail_threshold` bytes for large ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub digest: String,
    pub method: HashMethod,
}

/// Content fingerprinting on a dedicated worker pool.
pub struct Hasher {
    tail_threshold: u64,
    pool: rayon::ThreadPool,
}

impl Hasher {
    pub fn new(threshold_mb: u64, workers: usize) -> Result<Self, HashError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("hash-{i}"))
            .build()
            .map_err(|e| HashError::Pool(e.to_string()))?;
        Ok(Self {
            tail_threshold: threshold_mb * 1024 * 1024,
            pool,
        })
    }

    pub fn tail_threshold(&self) -> u64 {
        self.tail_threshold
    }

    /// Cheap-phase fingerprint: full MD5 up to the threshold, tail sample
    /// beyond it.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint, HashError> {
        let size = fs::metadata(path).map_err(|e| io_err(path, e))?.len();
        let mut file = File::open(path).map_err(|e| io_err(path, e))?;
        if size <= self.tail_threshold {
            let digest = digest_stream(path, &mut file, None)?;
            Ok(Fingerprint {
                size,
                digest,
                method: HashMethod::Full,
            })
        } else {
            file.seek(SeekFrom::End(-(self.tail_threshold as i64)))
                .map_err(|e| io_err(path, e))?;
            let digest = digest_stream(path, &mut file, Some(self.tail_threshold))?;
            Ok(Fingerprint {
                size,
                digest,
                method: HashMethod::Tail,
            })
        }
    }

    /// Full-content fingerprint regardless of size (tail promotion).
    pub fn full_fingerprint(&self, path: &Path) -> Result<Fingerprint, HashError> {
        let size = fs::metadata(path).map_err(|e| io_err(path, e))?.len();
        let mut file = File::open(path).map_err(|e| io_err(path, e))?;
        let digest = digest_stream(path, &mut file, None)?;
        Ok(Fingerprint {
            size,
            digest,
            method: HashMethod::Full,
        })
    }

    /// Fingerprints a batch on the worker pool. Results come back in
    /// submission order so downstream tie-breaks stay reproducible.
    pub fn fingerprint_batch(&self, paths: &[PathBuf]) -> Vec<Result<Fingerprint, HashError>> {
        self.pool
            .install(|| paths.par_iter().map(|p| self.fingerprint(p)).collect())
    }
}

fn io_err(path: &Path, source: io::Error) -> HashError {
    HashError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn digest_stream(path: &Path, file: &mut File, limit: Option<u64>) -> Result<String, HashError> {
    let mut hasher = Md5::new();
    let mut remaining = limit;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(r) => buf.len().min(r as usize),
            None => buf.len(),
        };
        let read = file.read(&mut buf[..want]).map_err(|e| io_err(path, e))?;
        if read == 0 {
            break;
        }
        if let Some(r) = remaining.as_mut() {
            *r -= read as u64;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn hasher_mb(threshold_mb: u64) -> Hasher {
        Hasher::new(threshold_mb, 2).unwrap()
    }

    #[test]
    fn test_full_fingerprint_known_digest() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("abc.bin");
        fs::write(&path, b"abc").unwrap();

        let fp = hasher_mb(10).fingerprint(&path).unwrap();
        assert_eq!(fp.method, HashMethod::Full);
        assert_eq!(fp.size, 3);
        assert_eq!(fp.digest, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        fs::write(&path, vec![7u8; 4096]).unwrap();

        let hasher = hasher_mb(10);
        let a = hasher.fingerprint(&path).unwrap();
        let b = hasher.fingerprint(&path).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_large_file_uses_tail_sample() {
        let tmp = TempDir::new().unwrap();
        let hasher = hasher_mb(1);
        let tail = hasher.tail_threshold() as usize;

        // same final megabyte, different heads
        let mut first = vec![b'A'; 16];
        first.extend(vec![0u8; tail]);
        let mut second = vec![b'B'; 16];
        second.extend(vec![0u8; tail]);

        let path_a = tmp.path().join("a.bin");
        let path_b = tmp.path().join("b.bin");
        fs::write(&path_a, &first).unwrap();
        fs::write(&path_b, &second).unwrap();

        let fp_a = hasher.fingerprint(&path_a).unwrap();
        let fp_b = hasher.fingerprint(&path_b).unwrap();
        assert_eq!(fp_a.method, HashMethod::Tail);
        assert_eq!(fp_a.digest, fp_b.digest);
        assert_eq!(fp_a.size, fp_b.size);

        // promotion resolves them
        let full_a = hasher.full_fingerprint(&path_a).unwrap();
        let full_b = hasher.full_fingerprint(&path_b).unwrap();
        assert_eq!(full_a.method, HashMethod::Full);
        assert_ne!(full_a.digest, full_b.digest);
    }

    #[test]
    fn test_threshold_boundary_is_full() {
        let tmp = TempDir::new().unwrap();
        let hasher = hasher_mb(1);
        let path = tmp.path().join("edge.bin");
        fs::write(&path, vec![1u8; hasher.tail_threshold() as usize]).unwrap();

        let fp = hasher.fingerprint(&path).unwrap();
        assert_eq!(fp.method, HashMethod::Full);
    }

    #[test]
    fn test_batch_preserves_submission_order() {
        let tmp = TempDir::new().unwrap();
        let hasher = hasher_mb(10);
        let mut paths = Vec::new();
        for i in 0..20 {
            let path = tmp.path().join(format!("f{i}.bin"));
            fs::write(&path, format!("content {i}")).unwrap();
            paths.push(path);
        }

        let results = hasher.fingerprint_batch(&paths);
        assert_eq!(results.len(), paths.len());
        for (path, result) in paths.iter().zip(&results) {
            let direct = hasher.fingerprint(path).unwrap();
            assert_eq!(result.as_ref().unwrap(), &direct);
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let hasher = hasher_mb(10);
        let err = hasher.fingerprint(Path::new("/no/such/file.jpg"));
        assert!(matches!(err, Err(HashError::Io { .. })));
    }
}
