//! Runs evaluation jobs as local containers through the `docker` CLI.
//!
//! Each job gets a host output directory mounted at [`OUTPUT_MOUNT`]. The
//! workload reports progress by printing `EVALHUB_PROGRESS <message>` lines on
//! stdout and leaves its metrics and artifacts in `result.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use evalhub_shared::settings::BackendSettings;
use integration_core::{BackendError, BackendStatus, JobBackend, JobOutput, JobSpec, SubmittedJob};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub const OUTPUT_MOUNT: &str = "/evalhub/output";
const RESULT_FILE: &str = "result.json";
const PROGRESS_PREFIX: &str = "EVALHUB_PROGRESS ";
/// `docker run` itself failed: daemon error, bad flags, image pull failure.
const DOCKER_RUN_ERROR: i32 = 125;
/// 128 + SIGKILL.
const KILLED: i32 = 137;
const STDERR_TAIL: usize = 2048;

pub struct DockerBackend {
    settings: BackendSettings,
}

impl DockerBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn output_dir(&self, spec: &JobSpec) -> PathBuf {
        PathBuf::from(&self.settings.work_dir).join(spec.run_id.to_string())
    }
}

#[async_trait]
impl JobBackend for DockerBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<SubmittedJob, BackendError> {
        let out_dir = self.output_dir(spec);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .with_context(|| format!("creating output dir {}", out_dir.display()))?;
        tokio::fs::write(
            out_dir.join("job.json"),
            serde_json::to_vec_pretty(spec).context("encoding job spec")?,
        )
        .await
        .context("writing job spec")?;
        let mount_dir = tokio::fs::canonicalize(&out_dir)
            .await
            .with_context(|| format!("resolving output dir {}", out_dir.display()))?;

        let args = run_args(spec, &mount_dir, self.settings.network.as_deref())
            .map_err(BackendError::Rejected)?;

        tracing::info!(job = %spec.name, image = %spec.image, "starting docker job");
        let child = Command::new(&self.settings.docker_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                BackendError::Unavailable(format!(
                    "failed to spawn {}: {err}",
                    self.settings.docker_binary
                ))
            })?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(watch_container(child, out_dir, tx));

        Ok(SubmittedJob {
            job_name: spec.name.clone(),
            statuses: rx,
        })
    }

    async fn terminate(&self, job_name: &str) -> anyhow::Result<()> {
        let output = Command::new(&self.settings.docker_binary)
            .arg("kill")
            .arg(job_name)
            .output()
            .await
            .with_context(|| format!("failed to run {} kill", self.settings.docker_binary))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(anyhow!("docker kill {job_name} failed: {}", stderr.trim()))
        }
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

async fn watch_container(mut child: Child, out_dir: PathBuf, tx: mpsc::Sender<BackendStatus>) {
    // A closed receiver only means nobody is monitoring any more; the child
    // still has to be reaped.
    let _ = tx.send(BackendStatus::Scheduled).await;
    let _ = tx.send(BackendStatus::Running).await;

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.strip_prefix(PROGRESS_PREFIX) {
                Some(message) => {
                    let _ = tx
                        .send(BackendStatus::Progress {
                            message: message.trim().to_string(),
                        })
                        .await;
                }
                None => tracing::debug!(target: "evalhub::job", "{line}"),
            }
        }
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(err) => {
            let _ = tx
                .send(BackendStatus::Lost {
                    reason: format!("failed to wait for docker client: {err}"),
                })
                .await;
            return;
        }
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    let final_status = match status.code() {
        Some(0) => match read_output(&out_dir).await {
            Ok(output) => BackendStatus::Exited {
                exit_code: 0,
                output,
            },
            Err(reason) => BackendStatus::Failed { reason },
        },
        Some(DOCKER_RUN_ERROR) => BackendStatus::Rejected {
            reason: tail(&stderr),
        },
        Some(KILLED) => BackendStatus::Lost {
            reason: "container was killed (exit status 137)".into(),
        },
        Some(code) => {
            tracing::debug!(exit_code = code, stderr = %tail(&stderr), "container exited");
            BackendStatus::Exited {
                exit_code: code,
                output: JobOutput::default(),
            }
        }
        None => BackendStatus::Lost {
            reason: "docker client terminated by signal".into(),
        },
    };
    let _ = tx.send(final_status).await;
}

async fn read_output(out_dir: &Path) -> Result<JobOutput, String> {
    let path = out_dir.join(RESULT_FILE);
    match tokio::fs::read(&path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|err| format!("malformed {}: {err}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(JobOutput::default()),
        Err(err) => Err(format!("unable to read {}: {err}", path.display())),
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(STDERR_TAIL);
    let start = (start..trimmed.len())
        .find(|idx| trimmed.is_char_boundary(*idx))
        .unwrap_or(trimmed.len());
    trimmed[start..].to_string()
}

/// Arguments for `docker run` that realise `spec` with its output directory
/// mounted from `mount_dir`.
pub fn run_args(
    spec: &JobSpec,
    mount_dir: &Path,
    network: Option<&str>,
) -> Result<Vec<String>, String> {
    let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "--name".into(), spec.name.clone()];

    if let Some(network) = network {
        args.push("--network".into());
        args.push(network.into());
    }

    let resources = &spec.resources;
    if let Some(limit) = non_empty(&resources.cpu_limit) {
        args.push("--cpus".into());
        args.push(format_cpus(cpu_millis(limit)?));
    }
    if let Some(request) = non_empty(&resources.cpu_request) {
        // docker's default weight of 1024 corresponds to one full CPU
        let shares = (cpu_millis(request)? * 1024 / 1000).max(2);
        args.push("--cpu-shares".into());
        args.push(shares.to_string());
    }
    if let Some(limit) = non_empty(&resources.memory_limit) {
        args.push("--memory".into());
        args.push(memory_bytes(limit)?.to_string());
    }
    if let Some(request) = non_empty(&resources.memory_request) {
        args.push("--memory-reservation".into());
        args.push(memory_bytes(request)?.to_string());
    }

    args.push("-v".into());
    args.push(format!("{}:{}", mount_dir.display(), OUTPUT_MOUNT));

    for var in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", var.name, var.value));
    }
    args.push("-e".into());
    args.push(format!("EVALHUB_OUTPUT_DIR={OUTPUT_MOUNT}"));

    if let Some(entrypoint) = non_empty(&spec.entrypoint) {
        args.push("--entrypoint".into());
        args.push(entrypoint.into());
    }
    args.push(spec.image.clone());
    Ok(args)
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Parses a CPU quantity (`"250m"`, `"1"`, `"1.5"`) into millicores.
pub fn cpu_millis(quantity: &str) -> Result<u64, String> {
    let invalid = || format!("invalid cpu quantity {quantity:?}");
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse::<u64>().map_err(|_| invalid());
    }
    let cores: f64 = quantity.parse().map_err(|_| invalid())?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid());
    }
    Ok((cores * 1000.0).round() as u64)
}

fn format_cpus(millis: u64) -> String {
    format!("{}", millis as f64 / 1000.0)
}

/// Parses a memory quantity (`"512Mi"`, `"2Gi"`, `"1G"`, `"1048576"`) into bytes.
pub fn memory_bytes(quantity: &str) -> Result<u64, String> {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let invalid = || format!("invalid memory quantity {quantity:?}");
    let quantity = quantity.trim();

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            if !value.is_finite() || value < 0.0 {
                return Err(invalid());
            }
            return Ok((value * *multiplier as f64).round() as u64);
        }
    }
    quantity.parse::<u64>().map_err(|_| invalid())
}
