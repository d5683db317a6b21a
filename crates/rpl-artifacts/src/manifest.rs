use chrono::{DateTime, Utc};
use rpl_core::{Artifact, ProvenanceRecord, ReleaseVersion, TieredRun};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvidenceRole {
    Build,
    Provenance,
    Tests,
    ContentGate,
    Publish,
    Backup,
    Deploy,
    Health,
    Rollback,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: String,
    pub detail: Option<String>,
    pub artifacts: Vec<String>,
}

/// Per-run evidence written next to the worklog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceManifest {
    pub run_id: String,
    pub command: String,
    pub release: Option<String>,
    pub environment: Option<String>,
    pub started_at: DateTime<Utc>,
    pub final_state: Option<String>,
    pub stages: Vec<StageRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestSummary {
    pub suite_hash: String,
    pub passed: bool,
    pub highest_tier: u8,
    pub ultimately_failed: Vec<String>,
    pub run: TieredRun,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateSummary {
    pub passed: bool,
    pub scanned: Vec<String>,
    pub not_scanned: Vec<String>,
    pub hits: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// Everything the pipeline knows about one release, persisted between the
/// separate `build`, `test` and `push` invocations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub version: ReleaseVersion,
    pub provenance: ProvenanceRecord,
    pub artifacts: Vec<Artifact>,
    pub verified: bool,
    /// Artifacts that had no embedded provenance and were admitted through the
    /// content scan instead.
    #[serde(default)]
    pub degraded: Vec<String>,
    pub tests: Option<TestSummary>,
    pub gate: Option<GateSummary>,
    #[serde(default)]
    pub published: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl ReleaseManifest {
    pub fn new(version: ReleaseVersion, provenance: ProvenanceRecord, artifacts: Vec<Artifact>) -> Self {
        Self {
            version,
            provenance,
            artifacts,
            verified: false,
            degraded: vec![],
            tests: None,
            gate: None,
            published: vec![],
            published_at: None,
        }
    }

    pub fn tests_passed(&self) -> bool {
        self.tests.as_ref().map(|t| t.passed).unwrap_or(false)
    }

    pub fn gate_passed(&self) -> bool {
        self.gate.as_ref().map(|g| g.passed).unwrap_or(false)
    }

    /// Publisher precondition: verified, tested and content-gated.
    pub fn ready_to_publish(&self) -> bool {
        self.verified && self.tests_passed() && self.gate_passed()
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some() && !self.published.is_empty()
    }
}
