use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0:?} (run `photox init` to create one)")]
    Missing(PathBuf),

    #[error("failed to read config: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Resolved runtime configuration. Loaded once, every path absolute, and
/// passed through the pipeline explicitly; no component reads the
/// environment after this point.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub data_dir: PathBuf,
    pub dup_dir: PathBuf,
    pub orphan_aae_dir: PathBuf,
    pub second_check_dir: PathBuf,
    pub db_path: PathBuf,
    pub exiftool_chunk_size: usize,
    pub hash_workers: usize,
    pub hash_threshold_mb: u64,
    pub verify_tail_collision: bool,
    pub exclude_patterns: Vec<String>,
    pub dry_run: bool,
    pub include_dest: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    paths: RawPaths,
    #[serde(default)]
    performance: RawPerformance,
    #[serde(default)]
    dedup: RawDedup,
    #[serde(default)]
    scan: RawScan,
    #[serde(default)]
    options: RawOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPaths {
    source: Option<PathBuf>,
    dest: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    dup_dir: Option<PathBuf>,
    orphan_aae_dir: Option<PathBuf>,
    second_check_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPerformance {
    #[serde(default = "default_chunk_size")]
    exiftool_chunk_size: usize,
    #[serde(default = "default_hash_workers")]
    hash_workers: usize,
    #[serde(default = "default_hash_threshold")]
    hash_threshold_mb: u64,
}

impl Default for RawPerformance {
    fn default() -> Self {
        Self {
            exiftool_chunk_size: default_chunk_size(),
            hash_workers: default_hash_workers(),
            hash_threshold_mb: default_hash_threshold(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}

fn default_hash_workers() -> usize {
    4
}

fn default_hash_threshold() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDedup {
    #[serde(default = "default_true")]
    verify_tail_collision: bool,
}

impl Default for RawDedup {
    fn default() -> Self {
        Self {
            verify_tail_collision: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScan {
    #[serde(default)]
    exclude_patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    include_dest: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let raw: RawConfig = toml::from_str(&fs::read_to_string(path)?)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let source = raw
            .paths
            .source
            .ok_or_else(|| ConfigError::Invalid("paths.source is required".into()))?;
        let dest = raw
            .paths
            .dest
            .ok_or_else(|| ConfigError::Invalid("paths.dest is required".into()))?;
        let source = absolutize(&source)?;
        let dest = absolutize(&dest)?;

        let data_dir = match raw.paths.data_dir {
            Some(p) => absolutize(&p)?,
            None => dest.join(".photox"),
        };
        let dup_dir = match raw.paths.dup_dir {
            Some(p) => absolutize(&p)?,
            None => dest.join("duplicates"),
        };
        let orphan_aae_dir = match raw.paths.orphan_aae_dir {
            Some(p) => absolutize(&p)?,
            None => dest.join("orphan_aae"),
        };
        let second_check_dir = match raw.paths.second_check_dir {
            Some(p) => absolutize(&p)?,
            None => dest.join("second_check"),
        };
        let db_path = match raw.paths.db_path {
            Some(p) => absolutize(&p)?,
            None => data_dir.join("photo_md5.sqlite3"),
        };

        Ok(Self {
            source,
            dest,
            data_dir,
            dup_dir,
            orphan_aae_dir,
            second_check_dir,
            db_path,
            exiftool_chunk_size: raw.performance.exiftool_chunk_size,
            hash_workers: raw.performance.hash_workers,
            hash_threshold_mb: raw.performance.hash_threshold_mb,
            verify_tail_collision: raw.dedup.verify_tail_collision,
            exclude_patterns: raw.scan.exclude_patterns,
            dry_run: raw.options.dry_run,
            include_dest: raw.options.include_dest,
        })
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn history_file(&self) -> PathBuf {
        self.data_dir.join("run_history.json")
    }

    pub fn set_source(&mut self, source: &Path) -> Result<(), ConfigError> {
        self.source = absolutize(source)?;
        Ok(())
    }

    /// Checks that must pass before a run starts.
    pub fn validate(&self, check_source: bool) -> Result<(), ConfigError> {
        if check_source {
            if !self.source.exists() {
                return Err(ConfigError::Invalid(format!(
                    "source directory does not exist: {}",
                    self.source.display()
                )));
            }
            if !self.source.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "source path is not a directory: {}",
                    self.source.display()
                )));
            }
        }
        if self.exiftool_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "performance.exiftool_chunk_size must be at least 1".into(),
            ));
        }
        if self.hash_workers == 0 {
            return Err(ConfigError::Invalid(
                "performance.hash_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Test fixture: a config rooted at `root` with default knobs.
    #[cfg(test)]
    pub fn for_tree(root: &Path) -> Self {
        let dest = root.join("dest");
        Self {
            source: root.join("source"),
            data_dir: dest.join(".photox"),
            dup_dir: dest.join("duplicates"),
            orphan_aae_dir: dest.join("orphan_aae"),
            second_check_dir: dest.join("second_check"),
            db_path: dest.join(".photox").join("photo_md5.sqlite3"),
            dest,
            exiftool_chunk_size: 800,
            hash_workers: 2,
            hash_threshold_mb: 10,
            verify_tail_collision: true,
            exclude_patterns: Vec::new(),
            dry_run: false,
            include_dest: false,
        }
    }
}

/// Expands a leading `~` and anchors relative paths at the current
/// directory. Targets may not exist yet, so nothing is canonicalized.
fn absolutize(path: &Path) -> Result<PathBuf, ConfigError> {
    let expanded = if let Ok(stripped) = path.strip_prefix("~") {
        match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => {
                return Err(ConfigError::Invalid(
                    "cannot expand ~: no home directory".into(),
                ))
            }
        }
    } else {
        path.to_path_buf()
    };
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(env::current_dir()?.join(expanded))
    }
}

/// Commented starter config written by `photox init`.
pub const EXAMPLE_CONFIG: &str = r#"# photox configuration

[paths]
# Directory scanned for new media.
source = "~/Pictures/inbox"
# Archive root; YYYY/MM partitions are created beneath it.
dest = "~/Pictures/archive"
# Review directories and tool state default to locations under dest:
# data_dir = "~/Pictures/archive/.photox"
# dup_dir = "~/Pictures/archive/duplicates"
# orphan_aae_dir = "~/Pictures/archive/orphan_aae"
# second_check_dir = "~/Pictures/archive/second_check"
# db_path = "~/Pictures/archive/.photox/photo_md5.sqlite3"

[performance]
# Files probed per exiftool invocation.
exiftool_chunk_size = 800
# Parallel hashing workers.
hash_workers = 4
# Files larger than this are fingerprinted by their final N MiB only.
hash_threshold_mb = 10

[dedup]
# Re-hash both sides in full before trusting a tail-sample match.
verify_tail_collision = true

[scan]
# Glob patterns skipped during the source walk.
exclude_patterns = []

[options]
dry_run = false
include_dest = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photox.toml");
        fs::write(
            &path,
            "[paths]\nsource = \"/data/in\"\ndest = \"/data/archive\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.source, PathBuf::from("/data/in"));
        assert_eq!(config.dest, PathBuf::from("/data/archive"));
        assert_eq!(config.data_dir, PathBuf::from("/data/archive/.photox"));
        assert_eq!(config.dup_dir, PathBuf::from("/data/archive/duplicates"));
        assert_eq!(
            config.db_path,
            PathBuf::from("/data/archive/.photox/photo_md5.sqlite3")
        );
        assert_eq!(config.exiftool_chunk_size, 800);
        assert_eq!(config.hash_workers, 4);
        assert_eq!(config.hash_threshold_mb, 10);
        assert!(config.verify_tail_collision);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_missing_source_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photox.toml");
        fs::write(&path, "[paths]\ndest = \"/data/archive\"\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = Config::load(Path::new("/no/such/photox.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photox.toml");
        fs::write(
            &path,
            "[paths]\nsource = \"/a\"\ndest = \"/b\"\ntypo_key = 1\n",
        )
        .unwrap();

        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_example_config_parses() {
        let raw: RawConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        assert!(raw.paths.source.is_some());
        assert!(raw.paths.dest.is_some());
    }

    #[test]
    fn test_validate_rejects_zero_knobs() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_tree(tmp.path());
        fs::create_dir_all(&config.source).unwrap();
        config.validate(true).unwrap();

        config.hash_workers = 0;
        assert!(config.validate(true).is_err());
    }
}
