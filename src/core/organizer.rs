use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::core::exif::CaptureProbe;
use crate::core::hash::{Fingerprint, HashError, Hasher, HashMethod};
use crate::core::paths::{self, PathError};
use crate::core::scanner::{MediaGroup, MediaScanner, ScanError};
use crate::index::{IndexError, IndexStore};
use crate::report::{self, ReportError, ReportSink, RunCounts, RunRecord, RunSummary};

/// Failures that abort the run. Everything that can be scoped to one group
/// becomes an error row instead and the pipeline continues.
#[derive(Debug, Error)]
pub enum OrganizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Hash(#[from] HashError),
}

enum Verdict {
    Fresh { fingerprint: Fingerprint },
    Duplicate { existing: PathBuf },
    Failed { kind: &'static str, detail: String },
}

/// The orchestrator: walks grouper output in order, resolves capture times
/// and fingerprints, decides one disposition per group, and performs the
/// placements. All index writes and report rows flow through here on the
/// main control flow.
pub struct Organizer {
    config: Config,
    run_id: String,
    started_at: DateTime<Utc>,
    index: IndexStore,
    hasher: Hasher,
    scanner: MediaScanner,
    probe: Box<dyn CaptureProbe>,
    sink: ReportSink,
    cancel: Arc<AtomicBool>,
    dry_run_seen: HashMap<Fingerprint, String>,
}

fn new_run_id() -> String {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let token = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &token[..6])
}

fn progress_bar(len: u64, label: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{msg:<10} [{bar:40}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(label.to_string());
    bar
}

impl Organizer {
    pub fn new(
        config: Config,
        probe: Box<dyn CaptureProbe>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, OrganizeError> {
        fs::create_dir_all(&config.data_dir)?;
        let run_id = new_run_id();
        let index = IndexStore::open(&config.db_path)?;
        let hasher = Hasher::new(config.hash_threshold_mb, config.hash_workers)?;
        let scanner = MediaScanner::new(&config)?;
        let sink = ReportSink::open(&config.reports_dir(), &run_id, config.dry_run)?;
        Ok(Self {
            config,
            run_id,
            started_at: Utc::now(),
            index,
            hasher,
            scanner,
            probe,
            sink,
            cancel,
            dry_run_seen: HashMap::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Runs the pipeline to completion (or until cancelled) and returns the
    /// disposition counts.
    pub fn run(mut self) -> Result<RunCounts, OrganizeError> {
        info!(
            "run {} starting (source={}, dest={}, dry_run={})",
            self.run_id,
            self.config.source.display(),
            self.config.dest.display(),
            self.config.dry_run
        );

        if !self.config.dry_run {
            fs::create_dir_all(&self.config.dest)?;
        }

        if self.config.include_dest {
            self.build_dest_index()?;
            if self.cancelled() {
                return self.finish();
            }
        }

        if !self.config.source.is_dir() {
            info!(
                "source {} not present; only the archive index was rebuilt",
                self.config.source.display()
            );
            return self.finish();
        }

        info!("scanning {}", self.config.source.display());
        let outcome = self.scanner.scan(&self.config.source);
        info!(
            "scan: {} groups ({} live photos, {} bound sidecars), {} orphan sidecars, {} unrecognized",
            outcome.groups.len(),
            outcome.groups.iter().filter(|g| g.live_video.is_some()).count(),
            outcome.groups.iter().map(|g| g.sidecars.len()).sum::<usize>(),
            outcome.orphan_sidecars.len(),
            outcome.unrecognized.len(),
        );

        let primaries: Vec<PathBuf> = outcome.groups.iter().map(|g| g.primary.clone()).collect();
        let capture_times = if primaries.is_empty() {
            HashMap::new()
        } else {
            info!("probing capture times for {} primaries", primaries.len());
            self.probe.batch_capture_times(&primaries)
        };

        let fingerprints = self.fingerprint_primaries(&primaries);

        let bar = progress_bar(outcome.groups.len() as u64, "organizing");
        for (group, fp) in outcome.groups.iter().zip(fingerprints) {
            if self.cancelled() {
                warn!("interrupt received; stopping after the in-flight group");
                break;
            }
            let capture = capture_times.get(&group.primary).copied().flatten();
            self.process_group(group, capture, fp)?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        if !outcome.orphan_sidecars.is_empty() && !self.cancelled() {
            self.process_orphans(&outcome.orphan_sidecars)?;
        }
        if !outcome.unrecognized.is_empty() && !self.cancelled() {
            self.process_unknown(&outcome.unrecognized)?;
        }

        self.finish()
    }

    fn fingerprint_primaries(&self, primaries: &[PathBuf]) -> Vec<Result<Fingerprint, HashError>> {
        if primaries.is_empty() {
            return Vec::new();
        }
        info!(
            "fingerprinting {} primaries ({} workers)",
            primaries.len(),
            self.config.hash_workers
        );
        let bar = progress_bar(primaries.len() as u64, "hashing");
        let mut out = Vec::with_capacity(primaries.len());
        for chunk in primaries.chunks(self.config.exiftool_chunk_size) {
            out.extend(self.hasher.fingerprint_batch(chunk));
            bar.inc(chunk.len() as u64);
        }
        bar.finish_and_clear();
        out
    }

    fn process_group(
        &mut self,
        group: &MediaGroup,
        capture: Option<NaiveDateTime>,
        fp: Result<Fingerprint, HashError>,
    ) -> Result<(), OrganizeError> {
        let Some(capture) = capture else {
            return self.quarantine_unrecognized_group(group);
        };

        let fp = match fp {
            Ok(fp) => fp,
            Err(err) => {
                let detail = err.to_string();
                for file in group.files() {
                    self.sink.record_error(file, "hash_read_failed", &detail)?;
                }
                return Ok(());
            }
        };

        match self.check_duplicate(&group.primary, fp)? {
            Verdict::Duplicate { existing } => self.quarantine_duplicate_group(group, &existing),
            Verdict::Fresh { fingerprint } => self.archive_group(group, capture, fingerprint),
            Verdict::Failed { kind, detail } => {
                for file in group.files() {
                    self.sink.record_error(file, kind, &detail)?;
                }
                Ok(())
            }
        }
    }

    fn check_duplicate(
        &mut self,
        primary: &Path,
        fp: Fingerprint,
    ) -> Result<Verdict, OrganizeError> {
        if self.config.dry_run {
            if let Some(existing) = self.dry_run_seen.get(&fp) {
                return Ok(Verdict::Duplicate {
                    existing: PathBuf::from(existing),
                });
            }
        }
        let Some(existing_rel) = self.index.lookup(&fp)? else {
            return Ok(Verdict::Fresh { fingerprint: fp });
        };
        let existing_abs = self.config.dest.join(&existing_rel);
        match fp.method {
            HashMethod::Full => Ok(Verdict::Duplicate {
                existing: existing_abs,
            }),
            HashMethod::Tail if !self.config.verify_tail_collision => Ok(Verdict::Duplicate {
                existing: existing_abs,
            }),
            HashMethod::Tail => self.promote_and_compare(primary, &existing_rel, existing_abs),
        }
    }

    /// Two same-size tail samples collided; promote both sides to
    /// full-content fingerprints before deciding. This is the only branch
    /// where a file is read twice.
    fn promote_and_compare(
        &mut self,
        primary: &Path,
        existing_rel: &str,
        existing_abs: PathBuf,
    ) -> Result<Verdict, OrganizeError> {
        let incoming = match self.hasher.full_fingerprint(primary) {
            Ok(fp) => fp,
            Err(err) => {
                return Ok(Verdict::Failed {
                    kind: "hash_read_failed",
                    detail: err.to_string(),
                })
            }
        };
        let archived = match self.hasher.full_fingerprint(&existing_abs) {
            Ok(fp) => fp,
            Err(err) => {
                warn!(
                    "cannot promote archived {}: {err}; treating the tail hit as stale",
                    existing_abs.display()
                );
                return Ok(Verdict::Fresh {
                    fingerprint: incoming,
                });
            }
        };
        if !self.config.dry_run {
            match self.index.insert(&archived, existing_rel) {
                Ok(()) => {}
                Err(IndexError::DuplicateKey { existing }) => {
                    debug!("promoted fingerprint already maps to {existing}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if incoming.size == archived.size && incoming.digest == archived.digest {
            return Ok(Verdict::Duplicate {
                existing: existing_abs,
            });
        }
        // the tail collided with different content; the promoted
        // fingerprint may still match another full entry
        if let Some(other_rel) = self.index.lookup(&incoming)? {
            return Ok(Verdict::Duplicate {
                existing: self.config.dest.join(other_rel),
            });
        }
        Ok(Verdict::Fresh {
            fingerprint: incoming,
        })
    }

    /// Moves a file into `dir` under its own name, renaming on collision.
    /// Dry runs only compute the destination.
    fn move_into(&self, file: &Path, dir: &Path) -> Result<PathBuf, PathError> {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.config.dry_run {
            return paths::peek_unique(dir, &name);
        }
        let dst = paths::claim_unique(dir, &name)?;
        match paths::safe_move(file, &dst) {
            Ok(()) => Ok(dst),
            Err(err) => {
                let _ = fs::remove_file(&dst);
                Err(err)
            }
        }
    }

    /// Moves a file into a quarantine, preserving its structure relative to
    /// `base`.
    fn relocate(&self, file: &Path, quarantine_root: &Path, base: &Path) -> Result<PathBuf, PathError> {
        let rel_parent = paths::relative_to(base, file)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        self.move_into(file, &quarantine_root.join(rel_parent))
    }

    fn quarantine_unrecognized_group(&mut self, group: &MediaGroup) -> Result<(), OrganizeError> {
        for file in group.files() {
            let moved = self.relocate(file, &self.config.second_check_dir, &self.config.source);
            match moved {
                Ok(dst) => self.sink.record_unrecognized(file, &dst)?,
                Err(err) => self.sink.record_error(file, err.kind(), &err.to_string())?,
            }
        }
        Ok(())
    }

    fn quarantine_duplicate_group(
        &mut self,
        group: &MediaGroup,
        existing: &Path,
    ) -> Result<(), OrganizeError> {
        let existing_str = existing.display().to_string();
        for file in group.files() {
            let moved = self.relocate(file, &self.config.dup_dir, &self.config.source);
            match moved {
                Ok(dst) => self.sink.record_duplicate(file, &dst, &existing_str)?,
                Err(err) => self.sink.record_error(file, err.kind(), &err.to_string())?,
            }
        }
        Ok(())
    }

    fn archive_group(
        &mut self,
        group: &MediaGroup,
        capture: NaiveDateTime,
        fingerprint: Fingerprint,
    ) -> Result<(), OrganizeError> {
        let target_dir = self
            .config
            .dest
            .join(format!("{:04}", capture.year()))
            .join(format!("{:02}", capture.month()));

        let stem = group
            .primary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string());
        let primary_ext = group
            .primary
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        let satellite_srcs = group.satellites();
        let satellite_exts: Vec<String> = satellite_srcs
            .iter()
            .map(|p| {
                p.extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();

        let plan = match paths::reserve_group(
            &target_dir,
            &stem,
            primary_ext.as_deref(),
            &satellite_exts,
            !self.config.dry_run,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                let detail = err.to_string();
                let kind = err.kind();
                for file in group.files() {
                    self.sink.record_error(file, kind, &detail)?;
                }
                return Ok(());
            }
        };

        if self.config.dry_run {
            self.dry_run_seen
                .insert(fingerprint, plan.primary.display().to_string());
            self.sink
                .record_moved(&group.primary, &plan.primary, &group.primary)?;
            for (src, dst) in satellite_srcs.iter().copied().zip(&plan.satellites) {
                self.sink.record_moved(src, dst, &group.primary)?;
            }
            return Ok(());
        }

        if let Err(err) = paths::safe_move(&group.primary, &plan.primary) {
            paths::release_claims(&plan.all_paths());
            let detail = err.to_string();
            let kind = err.kind();
            for file in group.files() {
                self.sink.record_error(file, kind, &detail)?;
            }
            return Ok(());
        }

        let mut moved: Vec<(&Path, &PathBuf)> = vec![(group.primary.as_path(), &plan.primary)];
        let mut failed: Vec<(&Path, PathError)> = Vec::new();
        for (src, dst) in satellite_srcs.iter().copied().zip(&plan.satellites) {
            match paths::safe_move(src, dst) {
                Ok(()) => moved.push((src, dst)),
                Err(err) => {
                    let _ = fs::remove_file(dst);
                    failed.push((src, err));
                }
            }
        }

        let rel = paths::relative_to(&self.config.dest, &plan.primary);
        match self.index.insert(&fingerprint, &rel.to_string_lossy()) {
            Ok(()) => {}
            Err(IndexError::DuplicateKey { existing }) => {
                warn!(
                    "index conflict: {} already maps to {existing}; keeping the existing mapping",
                    rel.display()
                );
                let existing_abs = self.config.dest.join(&existing);
                self.sink
                    .record_dest_duplicate(&plan.primary, &existing_abs.display().to_string())?;
            }
            Err(err) => return Err(err.into()),
        }

        for (src, dst) in &moved {
            self.sink.record_moved(src, dst, &group.primary)?;
        }
        for (src, err) in &failed {
            self.sink.record_error(src, err.kind(), &err.to_string())?;
        }
        Ok(())
    }

    /// Scans the archive itself and restores the index: stale entries are
    /// purged, unknown files are fingerprinted and inserted, and
    /// within-archive duplicates are quarantined. The walk is lexical, so
    /// the first copy of any content stays canonical.
    fn build_dest_index(&mut self) -> Result<(), OrganizeError> {
        let dest = self.config.dest.clone();
        if !dest.is_dir() {
            info!("archive {} does not exist yet; nothing to index", dest.display());
            return Ok(());
        }

        let purged = self.index.purge_stale(&dest)?;
        if purged > 0 {
            info!("purged {purged} stale index entries");
        }

        let files = self.scanner.collect_files(&dest);
        info!("indexing archive: {} files", files.len());
        let bar = progress_bar(files.len() as u64, "indexing");
        for chunk in files.chunks(self.config.exiftool_chunk_size) {
            if self.cancelled() {
                break;
            }
            let results = self.hasher.fingerprint_batch(chunk);
            for (path, result) in chunk.iter().zip(results) {
                let fp = match result {
                    Ok(fp) => fp,
                    Err(err) => {
                        self.sink
                            .record_error(path, "hash_read_failed", &err.to_string())?;
                        continue;
                    }
                };
                let rel = paths::relative_to(&dest, path).to_string_lossy().into_owned();
                match self.index.lookup(&fp)? {
                    Some(existing) if existing == rel => {}
                    Some(existing) if dest.join(&existing).exists() => {
                        let existing_abs = dest.join(&existing);
                        let verdict =
                            if fp.method == HashMethod::Tail && self.config.verify_tail_collision {
                                self.promote_and_compare(path, &existing, existing_abs)?
                            } else {
                                Verdict::Duplicate {
                                    existing: existing_abs,
                                }
                            };
                        match verdict {
                            // already canonical under its promoted fingerprint
                            Verdict::Duplicate { existing } if existing == *path => {}
                            Verdict::Duplicate { existing } => {
                                let moved = self.relocate(path, &self.config.dup_dir, &dest);
                                match moved {
                                    Ok(_) => self.sink.record_dest_duplicate(
                                        path,
                                        &existing.display().to_string(),
                                    )?,
                                    Err(err) => self.sink.record_error(
                                        path,
                                        err.kind(),
                                        &err.to_string(),
                                    )?,
                                }
                            }
                            Verdict::Fresh { fingerprint } => {
                                if !self.config.dry_run {
                                    self.index.insert(&fingerprint, &rel)?;
                                }
                            }
                            Verdict::Failed { kind, detail } => {
                                self.sink.record_error(path, kind, &detail)?;
                            }
                        }
                    }
                    Some(_) => {
                        // mapping went stale mid-run; re-point it
                        if !self.config.dry_run {
                            self.index.remove(&fp)?;
                            self.index.insert(&fp, &rel)?;
                        }
                    }
                    None => {
                        if !self.config.dry_run {
                            self.index.insert(&fp, &rel)?;
                        }
                    }
                }
            }
            bar.inc(chunk.len() as u64);
        }
        bar.finish_and_clear();
        Ok(())
    }

    fn process_orphans(&mut self, orphans: &[PathBuf]) -> Result<(), OrganizeError> {
        info!("processing {} orphan sidecars", orphans.len());
        let times = self.probe.batch_capture_times(orphans);
        for sidecar in orphans {
            if self.cancelled() {
                break;
            }
            let bucket = match times.get(sidecar).copied().flatten() {
                Some(dt) => self
                    .config
                    .orphan_aae_dir
                    .join(format!("{:04}", dt.year()))
                    .join(format!("{:02}", dt.month())),
                None => self.config.orphan_aae_dir.clone(),
            };
            match self.move_into(sidecar, &bucket) {
                Ok(dst) => self.sink.record_orphan(sidecar, &dst)?,
                Err(err) => self
                    .sink
                    .record_error(sidecar, err.kind(), &err.to_string())?,
            }
        }
        Ok(())
    }

    fn process_unknown(&mut self, files: &[PathBuf]) -> Result<(), OrganizeError> {
        info!("routing {} unrecognized files for review", files.len());
        for file in files {
            if self.cancelled() {
                break;
            }
            let moved = self.relocate(file, &self.config.second_check_dir, &self.config.source);
            match moved {
                Ok(dst) => self.sink.record_unrecognized(file, &dst)?,
                Err(err) => self.sink.record_error(file, err.kind(), &err.to_string())?,
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<RunCounts, OrganizeError> {
        let finished_at = Utc::now();
        let counts = self.sink.counts().clone();
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.to_rfc3339(),
            finished_at: finished_at.to_rfc3339(),
            duration_sec: (finished_at - self.started_at).num_seconds(),
            dry_run: self.config.dry_run,
            include_dest: self.config.include_dest,
            source: self.config.source.display().to_string(),
            dest: self.config.dest.display().to_string(),
            counts: counts.clone(),
        };
        self.sink.finish(&summary)?;

        let record = RunRecord {
            run_id: self.run_id.clone(),
            started_at: summary.started_at.clone(),
            finished_at: summary.finished_at.clone(),
            duration_sec: summary.duration_sec,
            dry_run: self.config.dry_run,
            include_dest: self.config.include_dest,
            counts: counts.clone(),
            report_dir: self.sink.dir().display().to_string(),
        };
        report::append_history(&self.config.history_file(), record)?;

        info!(
            "run {} finished: moved={} duplicate={} dest_duplicate={} orphan_aae={} unrecognized={} error={}",
            self.run_id,
            counts.moved,
            counts.duplicate,
            counts.dest_duplicate,
            counts.orphan_aae,
            counts.unrecognized,
            counts.error
        );
        Ok(counts)
    }
}
