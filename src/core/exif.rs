use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, Datelike, Local, NaiveDateTime};
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

/// Timestamp fields tried in order; the first usable one wins.
const DATETIME_FIELDS: &[&str] = &[
    "DateTimeOriginal",
    "CreateDate",
    "MediaCreateDate",
    "FileModifyDate",
];

/// Capture times before this year are treated as bogus so that epoch-zero
/// modify dates cannot classify a file.
const MIN_VALID_YEAR: i32 = 1971;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("exiftool not found in PATH")]
    ExiftoolMissing,

    #[error("failed to spawn exiftool: {0}")]
    Spawn(io::Error),

    #[error("exiftool batch produced no output (exit status {status:?})")]
    EmptyOutput { status: Option<i32> },

    #[error("unparseable exiftool output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Source of authoritative capture times.
///
/// The production implementation shells out to exiftool; an in-process
/// parser can be substituted as long as it keeps the fallback ordering and
/// batching behavior.
pub trait CaptureProbe {
    fn batch_capture_times(&self, paths: &[PathBuf]) -> HashMap<PathBuf, Option<NaiveDateTime>>;
}

/// Batched exiftool prober. One subprocess per chunk; a failing chunk is
/// re-probed one file at a time so a single bad file cannot take down the
/// whole batch.
pub struct ExifToolProbe {
    binary: PathBuf,
    chunk_size: usize,
}

impl ExifToolProbe {
    pub fn new(chunk_size: usize) -> Result<Self, ProbeError> {
        let binary = which::which("exiftool").map_err(|_| ProbeError::ExiftoolMissing)?;
        Ok(Self {
            binary,
            chunk_size: chunk_size.max(1),
        })
    }

    fn probe_chunk(
        &self,
        paths: &[PathBuf],
    ) -> Result<HashMap<PathBuf, Option<NaiveDateTime>>, ProbeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-json").arg("-n");
        for field in DATETIME_FIELDS {
            cmd.arg(format!("-{field}"));
        }
        cmd.args(paths);

        let output = cmd.output().map_err(ProbeError::Spawn)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // exiftool exits non-zero when some files are unreadable but still
        // prints records for the rest; only a silent run is a batch failure
        if stdout.trim().is_empty() {
            return Err(ProbeError::EmptyOutput {
                status: output.status.code(),
            });
        }
        parse_batch_output(&stdout, paths)
    }
}

impl CaptureProbe for ExifToolProbe {
    fn batch_capture_times(&self, paths: &[PathBuf]) -> HashMap<PathBuf, Option<NaiveDateTime>> {
        let mut out: HashMap<PathBuf, Option<NaiveDateTime>> =
            paths.iter().map(|p| (p.clone(), None)).collect();
        for chunk in paths.chunks(self.chunk_size) {
            match self.probe_chunk(chunk) {
                Ok(times) => out.extend(times),
                Err(err) => {
                    warn!(
                        "exiftool batch of {} files failed ({err}); re-probing singly",
                        chunk.len()
                    );
                    for path in chunk {
                        match self.probe_chunk(std::slice::from_ref(path)) {
                            Ok(times) => out.extend(times),
                            Err(err) => debug!("probe failed for {}: {err}", path.display()),
                        }
                    }
                }
            }
        }
        out
    }
}

/// Maps one exiftool JSON document back onto the probed paths.
fn parse_batch_output(
    raw: &str,
    paths: &[PathBuf],
) -> Result<HashMap<PathBuf, Option<NaiveDateTime>>, ProbeError> {
    let records: Vec<Value> = serde_json::from_str(raw)?;

    let mut lookup: HashMap<String, PathBuf> = HashMap::new();
    for path in paths {
        lookup.insert(path.to_string_lossy().into_owned(), path.clone());
        if let Ok(resolved) = path.canonicalize() {
            lookup.insert(resolved.to_string_lossy().into_owned(), path.clone());
        }
    }

    let mut out: HashMap<PathBuf, Option<NaiveDateTime>> =
        paths.iter().map(|p| (p.clone(), None)).collect();
    for record in records {
        let Some(source) = record.get("SourceFile").and_then(Value::as_str) else {
            continue;
        };
        let Some(path) = lookup.get(source) else {
            continue;
        };
        let mut resolved = None;
        for field in DATETIME_FIELDS {
            if let Some(value) = record.get(*field) {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if let Some(dt) = parse_exif_datetime(&text) {
                    resolved = Some(dt);
                    break;
                }
            }
        }
        out.insert(path.clone(), resolved);
    }
    Ok(out)
}

/// Parses the timestamp shapes exiftool emits: `2017:02:05 12:34:56`,
/// dash-separated dates, `T` separators, `Z` or `+08:00`/`+0800` offsets,
/// and fractional seconds. Offset-aware values are converted to local time.
pub fn parse_exif_datetime(raw: &str) -> Option<NaiveDateTime> {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return None;
    }

    // YYYY:MM:DD -> YYYY-MM-DD
    let bytes = s.as_bytes();
    if bytes.len() >= 10 && bytes[4] == b':' && bytes[7] == b':' {
        let (date, rest) = s.split_at(10);
        s = format!("{}{}", date.replace(':', "-"), rest);
    }
    if s.ends_with('Z') {
        s = format!("{}+00:00", &s[..s.len() - 1]);
    }

    const AWARE: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"];
    const NAIVE: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    let parsed = AWARE
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(&s, fmt).ok())
        .map(|dt| dt.with_timezone(&Local).naive_local())
        .or_else(|| {
            NAIVE
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
        });

    parsed.filter(|dt| dt.date().year() >= MIN_VALID_YEAR)
}
