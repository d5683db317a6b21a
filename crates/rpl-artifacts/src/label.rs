use anyhow::{Context, Result};
use rpl_core::ProvenanceRecord;

/// Image label carrying the provenance JSON document.
pub const PROVENANCE_LABEL: &str = "org.rpl.provenance";

pub fn encode_provenance(record: &ProvenanceRecord) -> Result<String> {
    serde_json::to_string(record).context("serialize provenance")
}

/// `Ok(None)` when the label is absent or blank (older artifact format).
/// A label that is present but unparsable is an error, never "absent".
pub fn decode_provenance(label: Option<&str>) -> Result<Option<ProvenanceRecord>> {
    match label.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => {
            let record: ProvenanceRecord =
                serde_json::from_str(raw).with_context(|| format!("parse {PROVENANCE_LABEL} label"))?;
            Ok(Some(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn absent_or_blank_label_is_none() {
        assert!(decode_provenance(None).unwrap().is_none());
        assert!(decode_provenance(Some("  ")).unwrap().is_none());
    }

    #[test]
    fn garbage_label_is_an_error() {
        assert!(decode_provenance(Some("{not json")).is_err());
    }

    #[test]
    fn encoded_label_decodes() {
        let r = ProvenanceRecord {
            git_commit: "abc".into(),
            build_date: Utc::now(),
            source_hash: "ff".into(),
        };
        let label = encode_provenance(&r).unwrap();
        assert!(label.contains("\"git_commit\":\"abc\""));
        assert_eq!(decode_provenance(Some(&label)).unwrap().unwrap().source_hash, "ff");
    }
}
