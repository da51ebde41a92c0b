//! # Docker CLI Client
//!
//! [`ContainerApi`] over the `docker` executable. Every call is one short-lived
//! child process, except `logs`, which keeps `docker logs` attached and re-frames its
//! stdout/stderr into the multiplexed format the log transcoder decodes.

use super::{
    ContainerApi, ContainerError, ContainerInspect, ContainerSummary, CreateContainerRequest,
    LogByteStream, LogOptions,
};
use crate::logs::{encode_frame, STDERR_STREAM, STDOUT_STREAM};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::SinkExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

const NOT_FOUND_MARKERS: &[&str] = &[
    "No such container",
    "No such object",
    "No such image",
    "not found",
];

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDocument {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn render(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run one docker command to completion and return trimmed stdout
    async fn exec(&self, args: Vec<String>) -> Result<String, ContainerError> {
        debug!(command = %self.render(&args), "Invoking container runtime");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(ContainerError::Launch)?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(ContainerError::NotFound(stderr));
        }
        Err(ContainerError::CommandFailed {
            command: self.render(&args),
            exit_code: output.status.code(),
            stderr,
        })
    }

    fn create_args(request: &CreateContainerRequest) -> Vec<String> {
        let mut args = vec!["create".to_string()];
        if let Some(name) = &request.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        for (key, value) in &request.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &request.ports {
            args.push("--publish".to_string());
            args.push(port.to_string());
        }
        for (key, value) in &request.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(request.image.clone());
        if let Some(command) = &request.command {
            args.extend(command.iter().cloned());
        }
        args
    }

    fn parse_inspect(raw: &str) -> Result<ContainerInspect, ContainerError> {
        let doc: InspectDocument = serde_json::from_str(raw)
            .map_err(|e| ContainerError::InvalidResponse(format!("inspect: {e}")))?;
        Ok(ContainerInspect {
            id: doc.id,
            name: doc.name.trim_start_matches('/').to_string(),
            running: doc.state.running,
            labels: doc.config.labels.unwrap_or_default(),
        })
    }

    fn parse_summaries(raw: &str) -> Vec<ContainerSummary> {
        raw.lines()
            .filter_map(|line| {
                let (id, name) = line.split_once('\t')?;
                Some(ContainerSummary {
                    id: id.trim().to_string(),
                    name: name.trim().to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ContainerApi for DockerCli {
    async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        self.exec(vec!["pull".into(), "--quiet".into(), image.into()])
            .await
            .map(|_| ())
    }

    async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<String, ContainerError> {
        let id = self.exec(Self::create_args(request)).await?;
        if id.is_empty() {
            return Err(ContainerError::InvalidResponse(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.exec(vec!["start".into(), id.into()]).await.map(|_| ())
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        self.exec(vec!["stop".into(), id.into()]).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        self.exec(vec!["rm".into(), "--volumes".into(), id.into()])
            .await
            .map(|_| ())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspect, ContainerError> {
        let raw = self
            .exec(vec![
                "inspect".into(),
                "--type".into(),
                "container".into(),
                "--format".into(),
                "{{json .}}".into(),
                id.into(),
            ])
            .await?;
        Self::parse_inspect(&raw)
    }

    async fn logs(&self, id: &str, options: &LogOptions) -> Result<LogByteStream, ContainerError> {
        // Surface a missing container as NotFound instead of an empty stream
        self.inspect(id).await?;

        let mut args = vec!["logs".to_string()];
        if options.follow {
            args.push("--follow".to_string());
        }
        if options.timestamps {
            args.push("--timestamps".to_string());
        }
        if let Some(tail) = options.tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        args.push(id.to_string());

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ContainerError::Launch)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ContainerError::InvalidResponse("docker logs stdout unavailable".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ContainerError::InvalidResponse("docker logs stderr unavailable".to_string())
        })?;

        let (mut tx, rx) = mpsc::channel(64);
        let container = id.to_string();

        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);

            while out_open || err_open {
                let frame = tokio::select! {
                    line = out_lines.next_line(), if out_open => match line {
                        Ok(Some(line)) => Some(encode_frame(STDOUT_STREAM, format!("{line}\n").as_bytes())),
                        _ => { out_open = false; None }
                    },
                    line = err_lines.next_line(), if err_open => match line {
                        Ok(Some(line)) => Some(encode_frame(STDERR_STREAM, format!("{line}\n").as_bytes())),
                        _ => { err_open = false; None }
                    },
                };

                if let Some(frame) = frame {
                    if tx.send(Ok(frame)).await.is_err() {
                        // Consumer stopped; dropping the child kills `docker logs`
                        debug!(container = %container, "Log consumer disconnected");
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(container = %container, status = %status, "docker logs exited unsuccessfully");
                }
                Err(e) => warn!(container = %container, error = %e, "Failed to reap docker logs"),
                _ => {}
            }
        });

        Ok(Box::pin(rx))
    }

    async fn list_managed(&self, label: &str) -> Result<Vec<ContainerSummary>, ContainerError> {
        let raw = self
            .exec(vec![
                "ps".into(),
                "--all".into(),
                "--filter".into(),
                format!("label={label}=true"),
                "--format".into(),
                "{{.ID}}\t{{.Names}}".into(),
            ])
            .await?;
        Ok(Self::parse_summaries(&raw))
    }
}
