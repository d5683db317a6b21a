use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BackupId, Component, DeploymentId, DeploymentKind, ProvenanceRecord, ReleaseVersion};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub component: Component,
    pub version: ReleaseVersion,
    pub provenance: ProvenanceRecord,
    /// Local image reference the artifact can be inspected through.
    pub content_ref: String,
}

/// `<registry_namespace>/<project>:<component>-<tag>`
pub fn artifact_coordinates(namespace: &str, project: &str, component: &Component, tag: &str) -> String {
    let ns = namespace.trim_end_matches('/');
    if ns.is_empty() {
        format!("{project}:{component}-{tag}")
    } else {
        format!("{ns}/{project}:{component}-{tag}")
    }
}

/// Split `<namespace>/<project>:<component>-<tag>` back into component and tag.
///
/// Component names may themselves contain `-v`, so every candidate split is
/// tried and the first suffix that parses as a release tag wins.
pub fn parse_coordinates(coordinates: &str) -> Option<(Component, ReleaseVersion)> {
    let name = coordinates.rsplit('/').next()?;
    let (_, rest) = name.split_once(':')?;
    for (i, _) in rest.match_indices("-v") {
        if let Ok(version) = ReleaseVersion::parse(&rest[i + 1..]) {
            let component = Component::parse(&rest[..i]).ok()?;
            return Some((component, version));
        }
    }
    None
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub environment: String,
    pub version: String,
    /// Registry coordinates of every artifact that was started.
    pub artifacts: Vec<String>,
    pub deployed_at: DateTime<Utc>,
    pub previous_version: Option<String>,
    pub kind: DeploymentKind,
    pub migrations_ran: bool,
    pub backup_id: Option<BackupId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: BackupId,
    pub environment: String,
    pub taken_at: DateTime<Utc>,
    pub store_ref: String,
}

/// Record a rollback should re-activate, given an environment's ledger in
/// append order. The newest record is the active one; its target is the latest
/// earlier record that activated `previous_version`.
pub fn rollback_target(history: &[DeploymentRecord]) -> Option<&DeploymentRecord> {
    let (active, earlier) = history.split_last()?;
    let wanted = active.previous_version.as_deref()?;
    earlier.iter().rev().find(|r| r.version == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(version: &str, previous: Option<&str>, kind: DeploymentKind) -> DeploymentRecord {
        DeploymentRecord {
            id: DeploymentId::new(),
            environment: "production".into(),
            version: version.into(),
            artifacts: vec![format!("ns/app:backend-{version}")],
            deployed_at: Utc::now(),
            previous_version: previous.map(String::from),
            kind,
            migrations_ran: false,
            backup_id: None,
        }
    }

    #[test]
    fn coordinates_format() {
        assert_eq!(
            artifact_coordinates("registry.local/team/", "shop", &Component::Backend, "vabc123-20260205-163600"),
            "registry.local/team/shop:backend-vabc123-20260205-163600"
        );
        assert_eq!(artifact_coordinates("", "shop", &Component::Frontend, "v1"), "shop:frontend-v1");
    }

    #[test]
    fn coordinates_parse_back() {
        let coords = artifact_coordinates("reg/team", "shop", &Component::Named("api-v2".into()), "vabc123-20260205-163600");
        let (component, version) = parse_coordinates(&coords).unwrap();
        assert_eq!(component, Component::Named("api-v2".into()));
        assert_eq!(version.tag, "vabc123-20260205-163600");
        assert!(parse_coordinates("reg/shop:backend-latest").is_none());
        assert!(parse_coordinates("no-colon").is_none());
    }

    #[test]
    fn rollback_target_is_superseded_record() {
        let history = vec![
            rec("v1", None, DeploymentKind::Deploy),
            rec("v2", Some("v1"), DeploymentKind::Deploy),
            rec("v3", Some("v2"), DeploymentKind::Deploy),
        ];
        assert_eq!(rollback_target(&history).unwrap().version, "v2");
    }

    #[test]
    fn successive_rollbacks_walk_back_history() {
        let mut history = vec![
            rec("v1", None, DeploymentKind::Deploy),
            rec("v2", Some("v1"), DeploymentKind::Deploy),
            rec("v3", Some("v2"), DeploymentKind::Deploy),
        ];
        let target = rollback_target(&history).unwrap().clone();
        // a rollback record inherits the lineage of the record it re-activates
        history.push(rec(&target.version, target.previous_version.as_deref(), DeploymentKind::Rollback));
        assert_eq!(rollback_target(&history).unwrap().version, "v1");
    }

    #[test]
    fn no_target_without_history() {
        assert!(rollback_target(&[]).is_none());
        assert!(rollback_target(&[rec("v1", None, DeploymentKind::Deploy)]).is_none());
    }
}
