use std::path::Path;

use anyhow::{Context, Result};
use rpl_core::{scan_bytes, ContentHit};
use walkdir::WalkDir;

/// Walk an exported payload directory and report every deny-list hit.
///
/// Hit paths are relative to `root`.
pub fn scan_payload_dir(root: &Path, markers: &[String]) -> Result<Vec<ContentHit>> {
    let mut hits = Vec::new();
    let mut files = 0usize;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk payload {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        files += 1;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let bytes = std::fs::read(entry.path()).with_context(|| format!("read {}", entry.path().display()))?;
        hits.extend(scan_bytes(&rel.display().to_string(), &bytes, markers));
    }
    tracing::debug!(root = %root.display(), files, hits = hits.len(), "payload scanned");
    Ok(hits)
}
