use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provenance stamped into every artifact at build time.
///
/// Serialized as `{"git_commit", "build_date" (RFC3339), "source_hash"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub git_commit: String,
    pub build_date: DateTime<Utc>,
    pub source_hash: String,
}

/// What the checkout says an artifact must have been built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedProvenance {
    pub git_commit: String,
    pub source_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMismatch {
    pub field: &'static str,
    pub expected: String,
    pub found: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvenanceVerdict {
    Verified,
    /// No embedded metadata at all (older artifact format). Callers must run
    /// the content scan instead and log the degraded mode.
    Degraded,
    Mismatch(Vec<FieldMismatch>),
}

impl ProvenanceVerdict {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, ProvenanceVerdict::Mismatch(_))
    }

    pub fn describe(&self) -> String {
        match self {
            ProvenanceVerdict::Verified => "verified".to_string(),
            ProvenanceVerdict::Degraded => "no provenance metadata (degraded)".to_string(),
            ProvenanceVerdict::Mismatch(fields) => fields
                .iter()
                .map(|m| format!("{}: expected {} found {}", m.field, m.expected, m.found))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Compare embedded provenance with the expected source state.
///
/// Exact string equality on both fields; there is no prefix or case folding, so
/// a commit mismatch can never be accepted.
pub fn verify_provenance(embedded: Option<&ProvenanceRecord>, expected: &ExpectedProvenance) -> ProvenanceVerdict {
    let Some(record) = embedded else {
        return ProvenanceVerdict::Degraded;
    };

    let mut mismatches = Vec::new();
    if record.git_commit != expected.git_commit {
        mismatches.push(FieldMismatch {
            field: "git_commit",
            expected: expected.git_commit.clone(),
            found: record.git_commit.clone(),
        });
    }
    if record.source_hash != expected.source_hash {
        mismatches.push(FieldMismatch {
            field: "source_hash",
            expected: expected.source_hash.clone(),
            found: record.source_hash.clone(),
        });
    }

    if mismatches.is_empty() {
        ProvenanceVerdict::Verified
    } else {
        ProvenanceVerdict::Mismatch(mismatches)
    }
}
