use std::collections::HashSet;
use std::path::{Path, PathBuf};

use catalog::{AssetRegistry, CatalogError, NewAsset};
use chrono::{DateTime, NaiveDate, Utc};
use common::{AssetType, RemoteKind, Scope, TimeBounds};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::download::file_name_of;
use crate::error::Result;

/// Outcome of registering a set of discovered files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub added: Vec<i32>,
    pub duplicates: usize,
    pub unrecognized: Vec<String>,
}

fn is_rinex_obs(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() >= 4 && {
        let tail = &b[b.len() - 4..];
        tail[0] == b'.'
            && tail[1].is_ascii_digit()
            && tail[2].is_ascii_digit()
            && (tail[3] == b'o' || tail[3] == b'O')
    }
}

/// Asset type implied by a file name, first matching rule wins.
pub fn classify_file_name(name: &str) -> Option<AssetType> {
    let lower = name.to_ascii_lowercase();
    let rules: [(bool, AssetType); 15] = [
        (is_rinex_obs(name), AssetType::Rinex),
        (name.contains("sonardyne"), AssetType::Sonardyne),
        (
            lower.contains("novatel") && lower.contains("pin"),
            AssetType::NovatelPin,
        ),
        (lower.contains("novatel"), AssetType::Novatel),
        (name.ends_with(".res"), AssetType::KinResiduals),
        (name.contains("kin"), AssetType::Kin),
        (name.contains("NOV000"), AssetType::Novatel000),
        (name.contains("NOV770"), AssetType::Novatel770),
        (name.contains("DFOP00.raw"), AssetType::Dfop00),
        (name.contains("lever_arms"), AssetType::LeverArm),
        (name.contains("master"), AssetType::Master),
        (name.ends_with(".pin"), AssetType::QcPin),
        (name.contains("CTD"), AssetType::Ctd),
        (name.contains("svpavg"), AssetType::Seabird),
        (name.contains("bcoffload"), AssetType::BcOffload),
    ];
    rules.into_iter().find(|(hit, _)| *hit).map(|(_, t)| t)
}

/// Every regular file under `dir`, recursively, sorted by path. Symlinks to
/// files are returned as found.
pub async fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let mut file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                // Linked files count; linked directories are not descended.
                match fs::metadata(entry.path()).await {
                    Ok(meta) if meta.is_file() => file_type = meta.file_type(),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(path = %entry.path().display(), "Dangling link: {}", e);
                        continue;
                    }
                }
            }
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Parse a RINEX header epoch line: `yyyy mm dd hh mm ss.sssssss GPS ...`.
fn parse_rinex_epoch(line: &str) -> Option<DateTime<Utc>> {
    let head = line.split("GPS").next()?;
    let mut parts = head.split_whitespace();
    let mut next_u32 = || parts.next()?.parse::<u32>().ok();
    let (year, month, day, hour, minute) =
        (next_u32()?, next_u32()?, next_u32()?, next_u32()?, next_u32()?);
    let second: f64 = head.split_whitespace().nth(5)?.parse().ok()?;
    NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_opt(hour, minute, second as u32)
        .map(|t| t.and_utc())
}

/// Observation span from a RINEX header, when both first and last epochs are given.
pub async fn rinex_time_bounds(path: &Path) -> Result<Option<TimeBounds>> {
    let file = fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut first = None;

    while let Some(line) = lines.next_line().await? {
        if line.contains("TIME OF FIRST OBS") {
            first = parse_rinex_epoch(&line);
        } else if line.contains("TIME OF LAST OBS") {
            let last = parse_rinex_epoch(&line);
            return Ok(first.zip(last).map(|(a, b)| TimeBounds::new(a, b)));
        } else if line.contains("END OF HEADER") {
            break;
        }
    }
    Ok(None)
}

/// Register local files under `scope`.
///
/// Empty or missing files and names no rule recognises are skipped. A file
/// already registered at the same path counts as a duplicate.
pub async fn ingest_local(
    registry: &AssetRegistry,
    scope: &Scope,
    paths: &[PathBuf],
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let mut known: HashSet<PathBuf> = registry
        .query(scope, None)
        .await?
        .into_iter()
        .filter_map(|r| r.local_path)
        .collect();

    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(asset_type) = classify_file_name(&name) else {
            debug!(path = %path.display(), "File type not recognised");
            report.unrecognized.push(path.display().to_string());
            continue;
        };

        match fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => {
                warn!(path = %path.display(), "File is empty, not ingesting");
                continue;
            }
            Err(e) => {
                warn!(path = %path.display(), "Cannot stat file: {}", e);
                continue;
            }
        }

        if known.contains(path) {
            report.duplicates += 1;
            continue;
        }

        let bounds = if asset_type == AssetType::Rinex {
            rinex_time_bounds(path).await.unwrap_or_else(|e| {
                warn!(path = %path.display(), "Cannot read RINEX header: {}", e);
                None
            })
        } else {
            None
        };

        let entry = NewAsset::local(scope.clone(), asset_type, path).with_bounds(bounds);
        let id = registry.insert(entry).await?;
        known.insert(path.clone());
        report.added.push(id);
    }

    info!(
        %scope,
        added = report.added.len(),
        duplicates = report.duplicates,
        unrecognized = report.unrecognized.len(),
        "Local files ingested"
    );
    Ok(report)
}

/// Register remote objects under `scope` without fetching them.
pub async fn ingest_remote(
    registry: &AssetRegistry,
    scope: &Scope,
    remote_paths: &[String],
    kind: RemoteKind,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for remote in remote_paths {
        let Some(asset_type) = file_name_of(remote).and_then(classify_file_name) else {
            warn!(remote_path = %remote, "File type not recognised");
            report.unrecognized.push(remote.clone());
            continue;
        };

        match registry
            .insert(NewAsset::remote(scope.clone(), asset_type, remote, kind))
            .await
        {
            Ok(id) => report.added.push(id),
            Err(CatalogError::Duplicate { .. }) => report.duplicates += 1,
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        %scope,
        %kind,
        added = report.added.len(),
        duplicates = report.duplicates,
        unrecognized = report.unrecognized.len(),
        "Remote files ingested"
    );
    Ok(report)
}
