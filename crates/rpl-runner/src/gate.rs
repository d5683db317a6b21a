use anyhow::Context;
use chrono::{DateTime, Utc};
use rpl_artifacts::{scan_payload_dir, GateSummary};
use rpl_core::{Component, ContentHit, FailureKind, PipelineState, StageFailure, StageResult};

use crate::config::Config;
use crate::stage::StageContext;
use crate::traits::ContainerRuntime;

/// Payload scan for deny-listed byte strings.
pub struct ContentGate<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub cfg: &'a Config,
}

impl<'a> ContentGate<'a> {
    /// Hits in one image's payload, or `None` when the component has no payload to scan.
    pub fn scan_image(&self, component: &Component, image_ref: &str) -> anyhow::Result<Option<Vec<ContentHit>>> {
        let Some(payload_path) = self.cfg.component(component).and_then(|c| c.payload_path.as_deref()) else {
            return Ok(None);
        };
        let dir = tempfile::tempdir().context("create payload export dir")?;
        self.runtime
            .export_payload(image_ref, payload_path, dir.path())
            .with_context(|| format!("export payload of {image_ref}"))?;
        let hits = scan_payload_dir(dir.path(), &self.cfg.gate.deny)?;
        Ok(Some(hits))
    }

    /// Scan every image; never fails on hits, only on scan errors.
    pub fn scan(&self, images: &[(Component, String)], now: DateTime<Utc>) -> anyhow::Result<GateSummary> {
        let mut summary = GateSummary {
            passed: true,
            scanned: vec![],
            not_scanned: vec![],
            hits: vec![],
            finished_at: now,
        };
        if self.cfg.gate.deny.is_empty() {
            tracing::warn!("gate.deny is empty; content gate has nothing to look for");
        }
        for (component, image_ref) in images {
            match self.scan_image(component, image_ref)? {
                None => {
                    tracing::info!(component = %component, "no payload path, not scanned");
                    summary.not_scanned.push(component.to_string());
                }
                Some(hits) => {
                    summary.scanned.push(component.to_string());
                    for h in hits {
                        tracing::error!(component = %component, file = %h.file, marker = %h.marker, "forbidden content");
                        summary.hits.push(format!("{component}:{} contains {:?} at byte {}", h.file, h.marker, h.offset));
                    }
                }
            }
        }
        summary.passed = summary.hits.is_empty();
        Ok(summary)
    }

    /// `scan` with hits turned into a `ContentGateViolation`.
    pub fn check(&self, stage: PipelineState, images: &[(Component, String)], now: DateTime<Utc>) -> StageResult<GateSummary> {
        let summary = self.scan(images, now).stage_err(stage, FailureKind::ContentGateViolation)?;
        if !summary.passed {
            return Err(violation(stage, &summary));
        }
        Ok(summary)
    }

    /// Weaker admission check for an artifact without provenance metadata.
    /// An artifact with neither provenance nor a scannable payload is refused.
    pub fn admit_degraded(&self, stage: PipelineState, component: &Component, image_ref: &str) -> StageResult<()> {
        match self
            .scan_image(component, image_ref)
            .stage_err(stage, FailureKind::ContentGateViolation)?
        {
            None => Err(StageFailure::new(
                stage,
                FailureKind::ProvenanceMismatch,
                format!("{image_ref} has no provenance metadata and no payload to scan"),
            )),
            Some(hits) if hits.is_empty() => {
                tracing::warn!(component = %component, image = %image_ref, "admitted in degraded mode after content scan");
                Ok(())
            }
            Some(hits) => Err(StageFailure::new(
                stage,
                FailureKind::ContentGateViolation,
                hits.iter()
                    .map(|h| format!("{component}:{} contains {:?}", h.file, h.marker))
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

pub fn violation(stage: PipelineState, summary: &GateSummary) -> StageFailure {
    StageFailure::new(stage, FailureKind::ContentGateViolation, summary.hits.join("; "))
}
