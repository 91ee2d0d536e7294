use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub moved: u64,
    pub duplicate: u64,
    pub dest_duplicate: u64,
    pub error: u64,
    pub orphan_aae: u64,
    pub unrecognized: u64,
}

/// One entry of the persistent run ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_sec: i64,
    pub dry_run: bool,
    pub include_dest: bool,
    pub counts: RunCounts,
    pub report_dir: String,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_sec: i64,
    pub dry_run: bool,
    pub include_dest: bool,
    pub source: String,
    pub dest: String,
    pub counts: RunCounts,
}

const PREFIX: &[&str] = &["run_id", "timestamp", "src_path"];

/// Run-scoped audit streams: one CSV per disposition, flushed on every
/// record so a crash preserves the partial trail. `summary.json` lands at
/// run end.
pub struct ReportSink {
    run_id: String,
    dir: PathBuf,
    moved: Writer<File>,
    duplicate: Writer<File>,
    dest_duplicate: Writer<File>,
    error: Writer<File>,
    orphan_aae: Writer<File>,
    unrecognized: Writer<File>,
    counts: RunCounts,
}

fn open_csv(dir: &Path, name: &str, extra: &[&str]) -> Result<Writer<File>, ReportError> {
    let file = File::create(dir.join(name))?;
    let mut writer = Writer::from_writer(file);
    let mut header: Vec<&str> = PREFIX.to_vec();
    header.extend_from_slice(extra);
    writer.write_record(&header)?;
    writer.flush()?;
    Ok(writer)
}

impl ReportSink {
    pub fn open(reports_dir: &Path, run_id: &str, dry_run: bool) -> Result<Self, ReportError> {
        let dir_name = if dry_run {
            format!("run-{run_id}_dryrun")
        } else {
            format!("run-{run_id}")
        };
        let dir = reports_dir.join(dir_name);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            moved: open_csv(&dir, "moved.csv", &["dst_path", "group"])?,
            duplicate: open_csv(&dir, "duplicate.csv", &["dst_path", "existing_path"])?,
            dest_duplicate: open_csv(&dir, "dest_duplicate.csv", &["existing_path"])?,
            error: open_csv(&dir, "error.csv", &["error_kind", "error_detail"])?,
            orphan_aae: open_csv(&dir, "orphan_aae.csv", &["dst_path"])?,
            unrecognized: open_csv(&dir, "unrecognized.csv", &["dst_path"])?,
            dir,
            counts: RunCounts::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn counts(&self) -> &RunCounts {
        &self.counts
    }

    fn row(&self, src: &Path, extra: &[String]) -> Vec<String> {
        let mut row = vec![
            self.run_id.clone(),
            Utc::now().to_rfc3339(),
            src.display().to_string(),
        ];
        row.extend_from_slice(extra);
        row
    }

    pub fn record_moved(&mut self, src: &Path, dst: &Path, group: &Path) -> Result<(), ReportError> {
        let row = self.row(
            src,
            &[dst.display().to_string(), group.display().to_string()],
        );
        self.moved.write_record(&row)?;
        self.moved.flush()?;
        self.counts.moved += 1;
        Ok(())
    }

    pub fn record_duplicate(
        &mut self,
        src: &Path,
        dst: &Path,
        existing: &str,
    ) -> Result<(), ReportError> {
        let row = self.row(src, &[dst.display().to_string(), existing.to_string()]);
        self.duplicate.write_record(&row)?;
        self.duplicate.flush()?;
        self.counts.duplicate += 1;
        Ok(())
    }

    pub fn record_dest_duplicate(&mut self, src: &Path, existing: &str) -> Result<(), ReportError> {
        let row = self.row(src, &[existing.to_string()]);
        self.dest_duplicate.write_record(&row)?;
        self.dest_duplicate.flush()?;
        self.counts.dest_duplicate += 1;
        Ok(())
    }

    pub fn record_orphan(&mut self, src: &Path, dst: &Path) -> Result<(), ReportError> {
        let row = self.row(src, &[dst.display().to_string()]);
        self.orphan_aae.write_record(&row)?;
        self.orphan_aae.flush()?;
        self.counts.orphan_aae += 1;
        Ok(())
    }

    pub fn record_unrecognized(&mut self, src: &Path, dst: &Path) -> Result<(), ReportError> {
        let row = self.row(src, &[dst.display().to_string()]);
        self.unrecognized.write_record(&row)?;
        self.unrecognized.flush()?;
        self.counts.unrecognized += 1;
        Ok(())
    }

    pub fn record_error(&mut self, src: &Path, kind: &str, detail: &str) -> Result<(), ReportError> {
        let row = self.row(src, &[kind.to_string(), detail.to_string()]);
        self.error.write_record(&row)?;
        self.error.flush()?;
        self.counts.error += 1;
        Ok(())
    }

    /// Writes `summary.json`; the CSV streams are already on disk.
    pub fn finish(&mut self, summary: &RunSummary) -> Result<(), ReportError> {
        self.moved.flush()?;
        self.duplicate.flush()?;
        self.dest_duplicate.flush()?;
        self.error.flush()?;
        self.orphan_aae.flush()?;
        self.unrecognized.flush()?;
        fs::write(
            self.dir.join("summary.json"),
            serde_json::to_string_pretty(summary)?,
        )?;
        Ok(())
    }
}

/// Rewrites the run ledger with `record` appended. An unreadable ledger is
/// restarted rather than aborting the run.
pub fn append_history(history_file: &Path, record: RunRecord) -> Result<(), ReportError> {
    let mut history: Vec<RunRecord> = match fs::read_to_string(history_file) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    history.push(record);
    if let Some(parent) = history_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(history_file, serde_json::to_string_pretty(&history)?)?;
    Ok(())
}

pub fn read_history(history_file: &Path) -> Vec<RunRecord> {
    fs::read_to_string(history_file)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
