//! Digest report: ranked `new` matches as markdown plus a parquet snapshot
//! of every match, indexed by a sha256 manifest.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jobfinder_core::MatchStatus;
use jobfinder_storage::{sha256_hex, MatchFilter};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;

use crate::Stores;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReportRow {
    match_id: String,
    criteria_id: String,
    criteria_name: String,
    canonical_id: String,
    title: String,
    company: String,
    source: String,
    url: String,
    match_score: u8,
    status: MatchStatus,
    salary_min: Option<i64>,
    salary_max: Option<i64>,
    is_remote: bool,
    posted_at: Option<String>,
    created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportSummary {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub total_matches: usize,
    pub new_matches: usize,
}

async fn collect_rows(stores: &Stores) -> Vec<ReportRow> {
    let criteria_names = stores
        .criteria
        .list()
        .await
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect::<HashMap<_, _>>();
    let postings = stores
        .postings
        .all()
        .await
        .into_iter()
        .map(|p| (p.canonical_id, p))
        .collect::<HashMap<_, _>>();

    stores
        .matches
        .list(&MatchFilter::default())
        .await
        .into_iter()
        .filter_map(|m| {
            let posting = postings.get(&m.canonical_id)?;
            Some(ReportRow {
                match_id: m.id.to_string(),
                criteria_id: m.criteria_id.to_string(),
                criteria_name: criteria_names
                    .get(&m.criteria_id)
                    .cloned()
                    .unwrap_or_default(),
                canonical_id: m.canonical_id.to_string(),
                title: posting.title.clone(),
                company: posting.company.clone(),
                source: posting.source.clone(),
                url: posting.url.clone(),
                match_score: m.match_score,
                status: m.status,
                salary_min: posting.salary_min,
                salary_max: posting.salary_max,
                is_remote: posting.is_remote,
                posted_at: posting.posted_at.map(|t| t.to_rfc3339()),
                created_at: m.created_at.to_rfc3339(),
            })
        })
        .collect()
}

fn salary_text(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("${lo}-${hi}"),
        (Some(lo), None) => format!("from ${lo}"),
        (None, Some(hi)) => format!("up to ${hi}"),
        (None, None) => "salary n/a".to_string(),
    }
}

fn render_digest(rows: &[ReportRow], runs: &[jobfinder_core::ScrapeRun], now: DateTime<Utc>) -> String {
    let fresh = rows
        .iter()
        .filter(|r| r.status == MatchStatus::New)
        .collect::<Vec<_>>();
    let mut lines = vec![
        "# JobFinder Digest".to_string(),
        String::new(),
        format!("- Generated: {}", now.to_rfc3339()),
        format!("- Matches tracked: {}", rows.len()),
        format!("- New matches: {}", fresh.len()),
        String::new(),
        "## New matches".to_string(),
    ];
    if fresh.is_empty() {
        lines.push("No new matches.".to_string());
    }
    for row in &fresh {
        lines.push(format!(
            "- **{}** {} at {} ({}, {}{}) [{}] {}",
            row.match_score,
            row.title,
            row.company,
            salary_text(row.salary_min, row.salary_max),
            row.source,
            if row.is_remote { ", remote" } else { "" },
            row.criteria_name,
            row.url
        ));
    }
    lines.push(String::new());
    lines.push("## Recent scrape runs".to_string());
    if runs.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for run in runs {
        let outcome = match (&run.error, run.finished_at) {
            (Some(err), _) => format!("failed: {err}"),
            (None, Some(_)) => "ok".to_string(),
            (None, None) => "running".to_string(),
        };
        lines.push(format!(
            "- {} {}: found {}, new {} ({outcome})",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.source,
            run.jobs_found,
            run.jobs_new
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8_column<'a>(rows: &'a [ReportRow], f: impl Fn(&'a ReportRow) -> &'a str) -> StringArray {
    StringArray::from(rows.iter().map(|r| Some(f(r))).collect::<Vec<_>>())
}

fn write_matches_parquet(path: &Path, rows: &[ReportRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("match_id", DataType::Utf8, false),
        ArrowField::new("criteria_id", DataType::Utf8, false),
        ArrowField::new("criteria_name", DataType::Utf8, false),
        ArrowField::new("canonical_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("match_score", DataType::UInt32, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("salary_min", DataType::Int64, true),
        ArrowField::new("salary_max", DataType::Int64, true),
        ArrowField::new("is_remote", DataType::Boolean, false),
        ArrowField::new("posted_at", DataType::Utf8, true),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8_column(rows, |r| &r.match_id)),
            Arc::new(utf8_column(rows, |r| &r.criteria_id)),
            Arc::new(utf8_column(rows, |r| &r.criteria_name)),
            Arc::new(utf8_column(rows, |r| &r.canonical_id)),
            Arc::new(utf8_column(rows, |r| &r.title)),
            Arc::new(utf8_column(rows, |r| &r.company)),
            Arc::new(utf8_column(rows, |r| &r.source)),
            Arc::new(utf8_column(rows, |r| &r.url)),
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| u32::from(r.match_score)).collect::<Vec<_>>(),
            )),
            Arc::new(utf8_column(rows, |r| r.status.as_str())),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.salary_min).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.salary_max).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                rows.iter().map(|r| r.is_remote).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.posted_at.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(utf8_column(rows, |r| &r.created_at)),
        ],
    )
    .context("building matches record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Write `<reports_root>/<stamp>/{digest.md, matches.parquet, manifest.json}`.
pub async fn write_digest_report(
    stores: &Stores,
    reports_root: &Path,
    now: DateTime<Utc>,
) -> Result<ReportSummary> {
    let dir = reports_root.join(now.format("%Y%m%dT%H%M%SZ").to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let rows = collect_rows(stores).await;
    let runs = stores.runs.list(10).await;
    let new_matches = rows.iter().filter(|r| r.status == MatchStatus::New).count();

    let digest_path = dir.join("digest.md");
    fs::write(&digest_path, render_digest(&rows, &runs, now))
        .await
        .with_context(|| format!("writing {}", digest_path.display()))?;

    let parquet_path = dir.join("matches.parquet");
    write_matches_parquet(&parquet_path, &rows)?;

    let manifest = ReportManifest {
        schema_version: 1,
        generated_at: now,
        files: vec![
            manifest_entry("digest", &dir, &digest_path)?,
            manifest_entry("matches", &dir, &parquet_path)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ReportSummary {
        dir,
        manifest_path,
        total_matches: rows.len(),
        new_matches,
    })
}
