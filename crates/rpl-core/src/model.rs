use serde::{Deserialize, Serialize};

/// A deployable component of the application.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Component {
    Frontend,
    Backend,
    Named(String),
}

impl Component {
    pub fn as_str(&self) -> &str {
        match self {
            Component::Frontend => "frontend",
            Component::Backend => "backend",
            Component::Named(name) => name,
        }
    }

    /// Component names end up inside image tags, so only `[a-z0-9_-]` is accepted.
    pub fn parse(s: &str) -> Result<Self, crate::CoreError> {
        let name = s.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(crate::CoreError::InvalidComponent(s.to_string()));
        }
        Ok(match name {
            "frontend" => Component::Frontend,
            "backend" => Component::Backend,
            other => Component::Named(other.to_string()),
        })
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Component {
    type Error = crate::CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Component::parse(&value)
    }
}

impl From<Component> for String {
    fn from(c: Component) -> Self {
        c.as_str().to_string()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    Unit,
    Integration,
    Functional,
    Visual,
}

impl TestCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestCategory::Unit => "unit",
            TestCategory::Integration => "integration",
            TestCategory::Functional => "functional",
            TestCategory::Visual => "visual",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentKind::Deploy => "deploy",
            DeploymentKind::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "rollback" => DeploymentKind::Rollback,
            _ => DeploymentKind::Deploy,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailure,
    ProvenanceMismatch,
    ContentGateViolation,
    TestFailure,
    PublishFailure,
    BackupFailure,
    DeployFailure,
    HealthCheckFailure,
    MigrationFailure,
    RollbackFailure,
    Precondition,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BuildFailure => "build_failure",
            FailureKind::ProvenanceMismatch => "provenance_mismatch",
            FailureKind::ContentGateViolation => "content_gate_violation",
            FailureKind::TestFailure => "test_failure",
            FailureKind::PublishFailure => "publish_failure",
            FailureKind::BackupFailure => "backup_failure",
            FailureKind::DeployFailure => "deploy_failure",
            FailureKind::HealthCheckFailure => "health_check_failure",
            FailureKind::MigrationFailure => "migration_failure",
            FailureKind::RollbackFailure => "rollback_failure",
            FailureKind::Precondition => "precondition",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Failures that hand control to the RollbackManager, provided the live
    /// environment was already touched.
    pub fn triggers_rollback(&self) -> bool {
        matches!(self, FailureKind::DeployFailure | FailureKind::HealthCheckFailure)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pass,
    Fail,
    Warn,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pass => "pass",
            StageStatus::Fail => "fail",
            StageStatus::Warn => "warn",
            StageStatus::Skipped => "skipped",
        }
    }
}
