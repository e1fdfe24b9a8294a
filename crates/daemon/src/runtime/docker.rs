//! Docker CLI runtime
//!
//! Drives the `docker` binary through `tokio::process`, using swarm services
//! so a node can run replicated. Structured output is requested with
//! `--format '{{json .}}'` and parsed line by line.

use super::{
    ContainerRuntime, ImageFilter, ImageSummary, PortMapping, RuntimeError, RuntimeResult,
    Workload, WorkloadSpec,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Container runtime backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, kind: &'static str, name: &str, args: &[String]) -> RuntimeResult<String> {
        debug!("{} {}", self.binary, args.join(" "));

        let output = AsyncCommand::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Failed(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(kind, name, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn list_service_rows(&self) -> RuntimeResult<Vec<ServiceLsJson>> {
        let stdout = self
            .run("workload", "", &args(&["service", "ls", "--format", "{{json .}}"]))
            .await?;
        parse_json_lines(&stdout)
    }

    async fn inspect_services(&self, ids: &[String]) -> RuntimeResult<Vec<ServiceInspectJson>> {
        let mut cmd = args(&["service", "inspect"]);
        cmd.extend(ids.iter().cloned());
        let name = ids.first().cloned().unwrap_or_default();
        let stdout = self.run("workload", &name, &cmd).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| RuntimeError::Failed(format!("invalid service inspect output: {}", e)))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(&self, context: &Path, tag: &str) -> RuntimeResult<()> {
        let cmd = vec![
            "build".to_string(),
            "--force-rm".to_string(),
            "--no-cache".to_string(),
            "-t".to_string(),
            tag.to_string(),
            context.display().to_string(),
        ];
        self.run("image", tag, &cmd).await?;
        Ok(())
    }

    async fn list_images(&self, filter: &ImageFilter) -> RuntimeResult<Vec<ImageSummary>> {
        let mut cmd = args(&["images", "--format", "{{json .}}"]);
        if let Some(dangling) = filter.dangling {
            cmd.push("--filter".to_string());
            cmd.push(format!("dangling={}", dangling));
        }
        if let Some(reference) = &filter.reference {
            cmd.push("--filter".to_string());
            cmd.push(format!("reference={}", reference));
        }

        let stdout = self.run("image", "", &cmd).await?;
        let rows: Vec<DockerImageJson> = parse_json_lines(&stdout)?;
        Ok(rows.into_iter().map(ImageSummary::from).collect())
    }

    async fn remove_image(&self, id: &str) -> RuntimeResult<()> {
        self.run("image", id, &args(&["rmi", id])).await?;
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> RuntimeResult<Workload> {
        self.run("workload", &spec.name, &create_args(spec)).await?;
        self.get_workload(&spec.name).await
    }

    async fn start_workload(&self, name: &str, replicas: u32) -> RuntimeResult<()> {
        let target = format!("{}={}", name, replicas);
        self.run("workload", name, &args(&["service", "scale", "--detach", target.as_str()]))
            .await?;
        Ok(())
    }

    async fn stop_workload(&self, name: &str) -> RuntimeResult<()> {
        self.start_workload(name, 0).await
    }

    async fn remove_workload(&self, name: &str) -> RuntimeResult<()> {
        self.run("workload", name, &args(&["service", "rm", name])).await?;
        Ok(())
    }

    async fn get_workload(&self, name: &str) -> RuntimeResult<Workload> {
        let inspected = self.inspect_services(&[name.to_string()]).await?;
        let service = inspected.into_iter().next().ok_or_else(|| RuntimeError::NotFound {
            kind: "workload",
            name: name.to_string(),
        })?;

        let running = self
            .list_service_rows()
            .await?
            .into_iter()
            .find(|row| row.name == service.spec.name)
            .and_then(|row| parse_replicas(&row.replicas))
            .map(|(running, _)| running)
            .unwrap_or(0);

        Ok(service.into_workload(running))
    }

    async fn list_workloads(&self) -> RuntimeResult<Vec<Workload>> {
        let rows = self.list_service_rows().await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let running: HashMap<String, u32> = rows
            .iter()
            .map(|row| {
                let count = parse_replicas(&row.replicas).map(|(r, _)| r).unwrap_or(0);
                (row.id.clone(), count)
            })
            .collect();
        let ids: Vec<String> = rows.into_iter().map(|row| row.id).collect();

        let inspected = self.inspect_services(&ids).await?;
        Ok(inspected
            .into_iter()
            .map(|service| {
                let count = running
                    .iter()
                    .find(|(id, _)| service.id.starts_with(id.as_str()))
                    .map(|(_, count)| *count)
                    .unwrap_or(0);
                service.into_workload(count)
            })
            .collect())
    }

    async fn workload_logs(&self, name: &str, tail: Option<usize>) -> RuntimeResult<String> {
        let mut cmd = args(&["service", "logs", "--no-task-ids"]);
        if let Some(tail) = tail {
            cmd.push("--tail".to_string());
            cmd.push(tail.to_string());
        }
        cmd.push(name.to_string());
        self.run("workload", name, &cmd).await
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Build `docker service create` arguments
fn create_args(spec: &WorkloadSpec) -> Vec<String> {
    let mut cmd = args(&["service", "create", "--detach", "--quiet"]);
    cmd.extend(["--name".to_string(), spec.name.clone()]);
    cmd.extend(["--replicas".to_string(), spec.replicas.to_string()]);
    cmd.extend(["--network".to_string(), spec.network.clone()]);
    for (key, value) in &spec.env {
        cmd.extend(["--env".to_string(), format!("{}={}", key, value)]);
    }
    for port in &spec.ports {
        cmd.extend([
            "--publish".to_string(),
            format!("published={},target={}", port.published, port.target),
        ]);
    }
    for (key, value) in &spec.labels {
        cmd.extend(["--label".to_string(), format!("{}={}", key, value)]);
    }
    cmd.push(spec.image.clone());
    cmd
}

/// Map docker stderr onto a runtime error
fn classify(kind: &'static str, name: &str, stderr: &str) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("already exists") {
        RuntimeError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    } else if lower.contains("not found") || lower.contains("no such") {
        RuntimeError::NotFound {
            kind,
            name: name.to_string(),
        }
    } else {
        RuntimeError::Failed(stderr.trim().to_string())
    }
}

fn parse_json_lines<T: for<'de> Deserialize<'de>>(stdout: &str) -> RuntimeResult<Vec<T>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| RuntimeError::Failed(format!("invalid docker output: {}", e)))
        })
        .collect()
}

/// Parse `running/desired` from `docker service ls`, e.g. `1/3 (max 1 per node)`
fn parse_replicas(s: &str) -> Option<(u32, u32)> {
    let token = s.split_whitespace().next()?;
    let (running, desired) = token.split_once('/')?;
    Some((running.parse().ok()?, desired.parse().ok()?))
}

// Internal JSON parsing structs (docker output)
#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct DockerImageJson {
    ID: Option<String>,
    Repository: Option<String>,
    Tag: Option<String>,
}

impl From<DockerImageJson> for ImageSummary {
    fn from(img: DockerImageJson) -> Self {
        Self {
            id: img.ID.unwrap_or_default(),
            repository: img.Repository.unwrap_or_else(|| "<none>".to_string()),
            tag: img.Tag.unwrap_or_else(|| "<none>".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceLsJson {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Replicas", default)]
    replicas: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInspectJson {
    #[serde(rename = "ID")]
    id: String,
    spec: ServiceSpecJson,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceSpecJson {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    task_template: TaskTemplateJson,
    #[serde(default)]
    mode: ModeJson,
    #[serde(default)]
    networks: Vec<NetworkAttachmentJson>,
    #[serde(default)]
    endpoint_spec: EndpointSpecJson,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskTemplateJson {
    container_spec: ContainerSpecJson,
    #[serde(default)]
    networks: Vec<NetworkAttachmentJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSpecJson {
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ModeJson {
    replicated: Option<ReplicatedJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReplicatedJson {
    #[serde(default)]
    replicas: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkAttachmentJson {
    target: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointSpecJson {
    #[serde(default)]
    ports: Vec<PortConfigJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortConfigJson {
    published_port: Option<u16>,
    target_port: u16,
}

impl ServiceInspectJson {
    fn into_workload(self, running: u32) -> Workload {
        let spec = self.spec;
        // Images are reported pinned, e.g. `img:1@sha256:...`
        let image = spec
            .task_template
            .container_spec
            .image
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();

        let networks = spec
            .task_template
            .networks
            .into_iter()
            .chain(spec.networks)
            .map(|n| n.target)
            .collect();

        let ports = spec
            .endpoint_spec
            .ports
            .into_iter()
            .map(|p| PortMapping {
                published: p.published_port.unwrap_or(p.target_port),
                target: p.target_port,
            })
            .collect();

        Workload {
            id: self.id,
            name: spec.name,
            image,
            env: spec.task_template.container_spec.env,
            networks,
            labels: spec.labels,
            ports,
            replicas: spec.mode.replicated.map(|r| r.replicas).unwrap_or(1),
            running,
        }
    }
}
