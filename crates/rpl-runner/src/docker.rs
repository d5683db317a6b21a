use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rpl_core::Component;

use crate::traits::{ArtifactRegistry, BuildRequest, ContainerRuntime};
use crate::util::run_cmd;

pub const PROJECT_LABEL: &str = "org.rpl.project";
pub const COMPONENT_LABEL: &str = "org.rpl.component";

/// `ContainerRuntime` and `ArtifactRegistry` backed by the `docker` CLI.
#[derive(Clone, Debug)]
pub struct DockerRuntime {
    pub workdir: PathBuf,
    pub project: String,
    /// Extra `docker run` arguments per component.
    pub run_args: BTreeMap<Component, Vec<String>>,
}

impl DockerRuntime {
    pub fn new(workdir: PathBuf, project: impl Into<String>) -> Self {
        Self {
            workdir,
            project: project.into(),
            run_args: BTreeMap::new(),
        }
    }

    pub fn with_run_args(mut self, component: Component, args: Vec<String>) -> Self {
        self.run_args.insert(component, args);
        self
    }

    fn docker(&self, args: &[&str]) -> Result<String> {
        run_cmd(&self.workdir, "docker", args)
    }

    pub fn container_name(&self, component: &Component) -> String {
        format!("{}-{}", self.project, component)
    }
}

/// `docker build` argument list for a request.
pub fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = vec!["build".to_string(), "-t".to_string(), request.image_ref.clone()];
    if request.no_cache {
        args.push("--no-cache".to_string());
    }
    for (k, v) in &request.labels {
        args.push("--label".to_string());
        args.push(format!("{k}={v}"));
    }
    if let Some(dockerfile) = &request.dockerfile {
        args.push("-f".to_string());
        args.push(dockerfile.display().to_string());
    }
    args.push(request.context.display().to_string());
    args
}

/// Parse `docker ps` lines of the form `<component>\t<image>`.
pub fn parse_running(raw: &str) -> Result<BTreeMap<Component, String>> {
    let mut out = BTreeMap::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let (component, image) = line
            .split_once('\t')
            .ok_or_else(|| anyhow!("unexpected docker ps line: {line:?}"))?;
        let component = Component::parse(component).map_err(|e| anyhow!(e))?;
        out.insert(component, image.trim().to_string());
    }
    Ok(out)
}

impl ContainerRuntime for DockerRuntime {
    fn build(&self, request: &BuildRequest) -> Result<()> {
        let args = build_args(request);
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.docker(&refs)
            .with_context(|| format!("docker build {}", request.component))?;
        Ok(())
    }

    fn read_label(&self, image_ref: &str, key: &str) -> Result<Option<String>> {
        let format = format!("{{{{ index .Config.Labels \"{key}\" }}}}");
        let out = self.docker(&["image", "inspect", "--format", &format, image_ref])?;
        if out.is_empty() || out == "<no value>" {
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn export_payload(&self, image_ref: &str, payload_path: &str, dest: &Path) -> Result<()> {
        let id = self.docker(&["create", image_ref])?;
        let src = format!("{}:{}/.", id, payload_path.trim_end_matches('/'));
        let copied = self.docker(&["cp", &src, &dest.display().to_string()]);
        let removed = self.docker(&["rm", "-f", &id]);
        copied.with_context(|| format!("export {payload_path} from {image_ref}"))?;
        if let Err(e) = removed {
            tracing::warn!(container = %id, error = %e, "could not remove export container");
        }
        Ok(())
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.docker(&["tag", source, target])?;
        Ok(())
    }

    fn stop(&self, component: &Component) -> Result<()> {
        let name = self.container_name(component);
        let filter = format!("name=^/{name}$");
        let existing = self.docker(&["ps", "-a", "-q", "--filter", &filter])?;
        if existing.is_empty() {
            return Ok(());
        }
        self.docker(&["rm", "-f", &name])?;
        Ok(())
    }

    fn start(&self, component: &Component, image_ref: &str) -> Result<()> {
        let name = self.container_name(component);
        let project_label = format!("{PROJECT_LABEL}={}", self.project);
        let component_label = format!("{COMPONENT_LABEL}={component}");
        let mut args: Vec<&str> = vec![
            "run",
            "-d",
            "--name",
            &name,
            "--label",
            &project_label,
            "--label",
            &component_label,
        ];
        if let Some(extra) = self.run_args.get(component) {
            args.extend(extra.iter().map(|s| s.as_str()));
        }
        args.push(image_ref);
        self.docker(&args)?;
        Ok(())
    }

    fn running_images(&self) -> Result<BTreeMap<Component, String>> {
        let filter = format!("label={PROJECT_LABEL}={}", self.project);
        let format = format!("{{{{.Label \"{COMPONENT_LABEL}\"}}}}\t{{{{.Image}}}}");
        let out = self.docker(&["ps", "--filter", &filter, "--format", &format])?;
        parse_running(&out)
    }

    fn container_healthy(&self, component: &Component) -> Result<bool> {
        let name = self.container_name(component);
        let status = self.docker(&[
            "inspect",
            "--format",
            "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}",
            &name,
        ])?;
        Ok(matches!(status.as_str(), "healthy" | "running"))
    }
}

impl ArtifactRegistry for DockerRuntime {
    fn push(&self, coordinates: &str) -> Result<()> {
        self.docker(&["push", coordinates])?;
        Ok(())
    }

    fn pull(&self, coordinates: &str) -> Result<()> {
        self.docker(&["pull", coordinates])?;
        Ok(())
    }
}
