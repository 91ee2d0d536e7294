use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use photox::config::Config;
use photox::core::exif::CaptureProbe;
use photox::core::organizer::Organizer;
use photox::index::IndexStore;
use photox::report::RunCounts;

/// Deterministic probe standing in for the exiftool subprocess.
struct FixedProbe {
    times: HashMap<PathBuf, NaiveDateTime>,
}

impl FixedProbe {
    fn empty() -> Self {
        Self {
            times: HashMap::new(),
        }
    }

    fn with(entries: &[(&Path, NaiveDateTime)]) -> Self {
        Self {
            times: entries
                .iter()
                .map(|(p, dt)| (p.to_path_buf(), *dt))
                .collect(),
        }
    }
}

impl CaptureProbe for FixedProbe {
    fn batch_capture_times(&self, paths: &[PathBuf]) -> HashMap<PathBuf, Option<NaiveDateTime>> {
        paths
            .iter()
            .map(|p| (p.clone(), self.times.get(p).copied()))
            .collect()
    }
}

fn march_2024() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 15)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

fn test_config(root: &Path) -> Config {
    let dest = root.join("dest");
    Config {
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

fn run(config: Config, probe: FixedProbe) -> RunCounts {
    Organizer::new(config, Box::new(probe), Arc::new(AtomicBool::new(false)))
        .unwrap()
        .run()
        .unwrap()
}

fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn live_photo_group_lands_together() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let heic = write(&config.source, "IMG_0001.HEIC", b"still image bytes");
    write(&config.source, "IMG_0001.MOV", b"motion clip bytes");
    write(&config.source, "IMG_0001.AAE", b"<edit record/>");

    let counts = run(config.clone(), FixedProbe::with(&[(&heic, march_2024())]));

    assert_eq!(counts.moved, 3);
    assert_eq!(counts.duplicate, 0);
    assert_eq!(counts.error, 0);

    let month = config.dest.join("2024").join("03");
    assert!(month.join("IMG_0001.HEIC").exists());
    assert!(month.join("IMG_0001.MOV").exists());
    assert!(month.join("IMG_0001.AAE").exists());

    // every source file left exactly once
    assert_eq!(fs::read_dir(&config.source).unwrap().count(), 0);

    let index = IndexStore::open(&config.db_path).unwrap();
    assert_eq!(index.len().unwrap(), 1);
}

#[test]
fn duplicate_group_is_quarantined_with_structure() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let original = write(&config.source, "IMG_0001.HEIC", b"same content");
    run(
        config.clone(),
        FixedProbe::with(&[(&original, march_2024())]),
    );

    // a second inbox holds the same content plus its motion clip
    let mut second = config.clone();
    second.source = tmp.path().join("inbox2");
    let copy_dir = second.source.join("copy");
    let copy = write(&copy_dir, "IMG_0001.HEIC", b"same content");
    write(&copy_dir, "IMG_0001.MOV", b"motion clip bytes");

    let counts = run(second.clone(), FixedProbe::with(&[(&copy, march_2024())]));

    assert_eq!(counts.moved, 0);
    assert_eq!(counts.duplicate, 2);
    assert!(second.dup_dir.join("copy").join("IMG_0001.HEIC").exists());
    assert!(second.dup_dir.join("copy").join("IMG_0001.MOV").exists());
    // the archived original is untouched and the index unchanged
    assert!(config.dest.join("2024/03/IMG_0001.HEIC").exists());
    let index = IndexStore::open(&config.db_path).unwrap();
    assert_eq!(index.len().unwrap(), 1);
}

#[test]
fn name_collision_gets_numeric_suffix() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let first = write(&config.source, "IMG_0001.HEIC", b"first content");
    run(config.clone(), FixedProbe::with(&[(&first, march_2024())]));

    let mut second = config.clone();
    second.source = tmp.path().join("inbox2");
    let other = write(&second.source, "IMG_0001.HEIC", b"different content");
    let counts = run(second, FixedProbe::with(&[(&other, march_2024())]));

    assert_eq!(counts.moved, 1);
    assert_eq!(counts.duplicate, 0);
    let month = config.dest.join("2024").join("03");
    assert!(month.join("IMG_0001.HEIC").exists());
    assert!(month.join("IMG_0001_1.HEIC").exists());

    let index = IndexStore::open(&config.db_path).unwrap();
    assert_eq!(index.len().unwrap(), 2);
}

#[test]
fn orphan_sidecar_is_quarantined() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write(&config.source, "IMG_9999.AAE", b"<edit record/>");

    let counts = run(config.clone(), FixedProbe::empty());

    assert_eq!(counts.orphan_aae, 1);
    assert_eq!(counts.moved, 0);
    assert!(config.orphan_aae_dir.join("IMG_9999.AAE").exists());

    let index = IndexStore::open(&config.db_path).unwrap();
    assert_eq!(index.len().unwrap(), 0);
}

#[test]
fn unreadable_capture_time_routes_to_review() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    write(&config.source, "garbage.jpg", b"no exif here");
    write(&config.source, "notes.txt", b"unknown extension");

    let counts = run(config.clone(), FixedProbe::empty());

    assert_eq!(counts.unrecognized, 2);
    assert_eq!(counts.moved, 0);
    assert!(config.second_check_dir.join("garbage.jpg").exists());
    assert!(config.second_check_dir.join("notes.txt").exists());
}

#[test]
fn build_index_quarantines_intra_archive_duplicates() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.include_dest = true;

    let month = config.dest.join("2024").join("03");
    write(&month, "A.JPG", b"identical bytes");
    write(&month, "B.JPG", b"identical bytes");

    let counts = run(config.clone(), FixedProbe::empty());

    assert_eq!(counts.dest_duplicate, 1);
    // first by lexical order stays canonical
    assert!(month.join("A.JPG").exists());
    assert!(!month.join("B.JPG").exists());
    assert!(config
        .dup_dir
        .join("2024")
        .join("03")
        .join("B.JPG")
        .exists());

    let index = IndexStore::open(&config.db_path).unwrap();
    assert_eq!(index.len().unwrap(), 1);
}

#[test]
fn dry_run_reports_without_touching_anything() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.dry_run = true;
    let heic = write(&config.source, "IMG_0001.HEIC", b"still image bytes");
    write(&config.source, "IMG_0001.MOV", b"motion clip bytes");
    write(&config.source, "IMG_0001.AAE", b"<edit record/>");

    let counts = run(config.clone(), FixedProbe::with(&[(&heic, march_2024())]));

    // full report, untouched tree
    assert_eq!(counts.moved, 3);
    assert_eq!(fs::read_dir(&config.source).unwrap().count(), 3);
    assert!(!config.dest.join("2024").exists());

    let index = IndexStore::open(&config.db_path).unwrap();
    assert_eq!(index.len().unwrap(), 0);
}

#[test]
fn dry_run_detects_same_run_duplicates() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.dry_run = true;
    let a = write(&config.source, "a.jpg", b"identical bytes");
    let b = write(&config.source, "b.jpg", b"identical bytes");

    let counts = run(
        config.clone(),
        FixedProbe::with(&[(&a, march_2024()), (&b, march_2024())]),
    );

    // first wins, the second is reported as a duplicate
    assert_eq!(counts.moved, 1);
    assert_eq!(counts.duplicate, 1);
    assert!(a.exists());
    assert!(b.exists());
}

#[test]
fn second_run_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let heic = write(&config.source, "IMG_0001.HEIC", b"still image bytes");
    write(&config.source, "IMG_0001.MOV", b"motion clip bytes");

    let first = run(config.clone(), FixedProbe::with(&[(&heic, march_2024())]));
    assert_eq!(first.moved, 2);

    let second = run(config.clone(), FixedProbe::empty());
    assert_eq!(second.moved, 0);
    assert_eq!(second.duplicate, 0);
    assert_eq!(second.error, 0);
}

#[test]
fn tail_collision_is_promoted_before_deciding() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.hash_threshold_mb = 1;

    let tail = vec![0u8; 1024 * 1024];
    let mut content_a = vec![b'A'; 16];
    content_a.extend_from_slice(&tail);
    let mut content_b = vec![b'B'; 16];
    content_b.extend_from_slice(&tail);

    // same size, same tail sample, different heads
    let a = write(&config.source, "big_a.jpg", &content_a);
    let counts = run(config.clone(), FixedProbe::with(&[(&a, march_2024())]));
    assert_eq!(counts.moved, 1);

    let mut second = config.clone();
    second.source = tmp.path().join("inbox2");
    let b = write(&second.source, "big_b.jpg", &content_b);
    let counts = run(second, FixedProbe::with(&[(&b, march_2024())]));
    assert_eq!(counts.moved, 1, "distinct content must not be a duplicate");
    assert_eq!(counts.duplicate, 0);
    assert!(config.dest.join("2024/03/big_b.jpg").exists());

    // a true copy of the first file is still caught
    let mut third = config.clone();
    third.source = tmp.path().join("inbox3");
    let c = write(&third.source, "big_a_copy.jpg", &content_a);
    let counts = run(third.clone(), FixedProbe::with(&[(&c, march_2024())]));
    assert_eq!(counts.moved, 0);
    assert_eq!(counts.duplicate, 1);
    assert!(third.dup_dir.join("big_a_copy.jpg").exists());

    // a copy of the second file hits the first file's tail entry, and the
    // promoted fingerprint must resolve it to the second file
    let mut fourth = config.clone();
    fourth.source = tmp.path().join("inbox4");
    let d = write(&fourth.source, "big_b_copy.jpg", &content_b);
    let counts = run(fourth.clone(), FixedProbe::with(&[(&d, march_2024())]));
    assert_eq!(counts.moved, 0);
    assert_eq!(counts.duplicate, 1);
    assert!(fourth.dup_dir.join("big_b_copy.jpg").exists());
}

#[test]
fn run_history_accumulates() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let heic = write(&config.source, "IMG_0001.HEIC", b"still image bytes");

    run(config.clone(), FixedProbe::with(&[(&heic, march_2024())]));
    run(config.clone(), FixedProbe::empty());

    let history = photox::report::read_history(&config.history_file());
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].counts.moved, 1);
    assert_eq!(history[1].counts.moved, 0);
    assert_ne!(history[0].run_id, history[1].run_id);
}
