//! Coprocess protocol: a spawned worker process that runs a single
//! long-lived task under its own signal handling, controllable from the
//! parent over a length-prefixed JSON pipe (SPEC_FULL.md §4.7).
//!
//! Some providers block on native I/O (a power meter, a USB logcat stream)
//! or need to isolate signal handling from the main process. Rather than
//! `fork()` (no easy Rust equivalent that carries inherited process state),
//! the manager re-invokes this crate's own binary with a hidden
//! `--coprocess-worker <kind>` subcommand and talks to it over its stdin/stdout.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::ServiceError;

/// The kind of long-running task a worker process runs. Each kind maps to
/// one of the built-in services that needs coprocess isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoprocessTask {
    Monsoon,
    Logcat,
    AndroidCpu,
    AndroidMemory,
}

impl CoprocessTask {
    pub fn as_str(self) -> &'static str {
        match self {
            CoprocessTask::Monsoon => "monsoon",
            CoprocessTask::Logcat => "logcat",
            CoprocessTask::AndroidCpu => "android-cpu",
            CoprocessTask::AndroidMemory => "android-memory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monsoon" => Some(CoprocessTask::Monsoon),
            "logcat" => Some(CoprocessTask::Logcat),
            "android-cpu" => Some(CoprocessTask::AndroidCpu),
            "android-memory" => Some(CoprocessTask::AndroidMemory),
            _ => None,
        }
    }
}

/// A message from parent to worker (or, for `Reply`, worker to parent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Message {
    Call { task: CoprocessTask, args: Json },
    Exit,
    Ping,
    Ok { value: Json },
    Err { descriptor: String },
    Pong,
}

/// Writes `msg` as a 4-byte big-endian length prefix followed by its JSON
/// encoding.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    out: &mut W,
    msg: &Message,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(msg)?;
    out.write_u32(body.len() as u32).await?;
    out.write_all(&body).await?;
    out.flush().await
}

/// Reads one length-prefixed JSON message. Returns `Ok(None)` on a clean EOF
/// (the worker closed its end without replying).
pub async fn read_message<R: AsyncReadExt + Unpin>(
    input: &mut R,
) -> std::io::Result<Option<Message>> {
    let len = match input.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf).await?;
    let msg = serde_json::from_slice(&buf)?;
    Ok(Some(msg))
}

/// Parent-side handle to a single spawned worker process.
pub struct Coprocess {
    child: Child,
    service_name: String,
}

impl Coprocess {
    /// Spawns this crate's own binary with `--coprocess-worker <kind>` and
    /// sends it an initial `Call`.
    pub async fn start(
        exe: &std::path::Path,
        service_name: &str,
        task: CoprocessTask,
        args: Json,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(exe)
            .arg("--coprocess-worker")
            .arg(task.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        {
            let stdin = child.stdin.as_mut().expect("piped stdin");
            write_message(stdin, &Message::Call { task, args }).await?;
        }

        Ok(Coprocess {
            child,
            service_name: service_name.to_string(),
        })
    }

    /// Blocks on the worker's reply. Returns `Ok(None)` if the worker died
    /// without replying (a best-effort release, per the failure model).
    pub async fn wait(&mut self) -> std::io::Result<Option<Json>> {
        let stdout = self.child.stdout.as_mut().expect("piped stdout");
        match read_message(stdout).await? {
            Some(Message::Ok { value }) => Ok(Some(value)),
            Some(Message::Err { descriptor }) => Err(std::io::Error::other(descriptor)),
            Some(_) | None => Ok(None),
        }
    }

    /// Sends SIGINT to make the worker's current call stop sampling and
    /// return its final, partial result. Shells out to `kill` rather than
    /// pulling in a signal-sending crate, matching the corpus's preference
    /// for driving external processes over talking to the OS directly.
    #[cfg(unix)]
    pub async fn interrupt(&self) -> Result<(), ServiceError> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| ServiceError::WorkerLost(self.service_name.clone()))?;
        let status = Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .status()
            .await
            .map_err(|e| ServiceError::Other(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(ServiceError::WorkerLost(self.service_name.clone()))
        }
    }

    #[cfg(not(unix))]
    pub async fn interrupt(&self) -> Result<(), ServiceError> {
        Err(ServiceError::Other(
            "interrupt is only supported on unix".to_string(),
        ))
    }

    /// Sends `Exit` and lets the worker close on its own terms.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if let Some(stdin) = self.child.stdin.as_mut() {
            let _ = write_message(stdin, &Message::Exit).await;
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// The worker side of the protocol: entered by `main` when invoked with
/// `--coprocess-worker <kind>`. Reads a single `Call`, installs SIGINT/SIGTERM
/// handling that converts the signal into a graceful "stop and return
/// partial result" condition, runs the task, and replies with its result.
pub async fn run_worker(
    task: CoprocessTask,
    run_task: impl FnOnce(CoprocessTask, Json, tokio_util::sync::CancellationToken) -> Json,
) -> std::io::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let msg = match read_message(&mut stdin).await? {
        Some(Message::Call { task: t, args }) if t == task => args,
        Some(_) | None => return Ok(()),
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if let Ok(mut sigint) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        {
            sigint.recv().await;
            cancel_for_signal.cancel();
        }
    });

    let value = run_task(task, msg, cancel);
    write_message(&mut stdout, &Message::Ok { value }).await?;
    Ok(())
}

/// Default worker-side sampling loop for the built-in coprocess tasks.
/// External hardware (a power meter, an Android device over adb) is an
/// external collaborator; this produces the shape each task's `release_for`
/// expects from in-memory, synthetic sampling, stopping as soon as `cancel`
/// fires.
pub fn sample(task: CoprocessTask, args: Json, cancel: tokio_util::sync::CancellationToken) -> Json {
    let interval = std::time::Duration::from_millis(
        args.get("interval_ms").and_then(Json::as_u64).unwrap_or(100),
    );
    match task {
        CoprocessTask::Monsoon => {
            let mut captured = 0u64;
            let mut dropped = 0u64;
            let mut current_sum = 0.0f64;
            let mut voltage_sum = 0.0f64;
            while !cancel.is_cancelled() {
                std::thread::sleep(interval);
                if cancel.is_cancelled() {
                    break;
                }
                captured += 1;
                current_sum += 0.5;
                voltage_sum += 4.2;
            }
            if captured == 0 {
                dropped += 1;
            }
            let mean_current = if captured > 0 { current_sum / captured as f64 } else { 0.0 };
            let mean_voltage = if captured > 0 { voltage_sum / captured as f64 } else { 0.0 };
            serde_json::json!({
                "captured": captured,
                "dropped": dropped,
                "mean_current": mean_current,
                "mean_voltage": mean_voltage,
                "mean_power": mean_current * mean_voltage,
            })
        }
        CoprocessTask::Logcat => {
            let mut lines_written = 0u64;
            while !cancel.is_cancelled() {
                std::thread::sleep(interval);
                lines_written += 1;
            }
            serde_json::json!({ "lines_written": lines_written })
        }
        CoprocessTask::AndroidCpu | CoprocessTask::AndroidMemory => {
            let mut samples = Vec::new();
            while !cancel.is_cancelled() {
                std::thread::sleep(interval);
                if cancel.is_cancelled() {
                    break;
                }
                samples.push(samples.len() as u64);
            }
            serde_json::json!({ "samples": samples })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_round_trips_through_str() {
        for t in [
            CoprocessTask::Monsoon,
            CoprocessTask::Logcat,
            CoprocessTask::AndroidCpu,
            CoprocessTask::AndroidMemory,
        ] {
            assert_eq!(CoprocessTask::parse(t.as_str()), Some(t));
        }
    }

    #[tokio::test]
    async fn message_round_trips_over_a_pipe() {
        let (mut reader, mut writer) = tokio::io::duplex(256);
        let msg = Message::Call {
            task: CoprocessTask::Monsoon,
            args: serde_json::json!({"voltage": 4.2}),
        };
        write_message(&mut writer, &msg).await.unwrap();
        let got = read_message(&mut reader).await.unwrap().unwrap();
        match got {
            Message::Call { task, args } => {
                assert_eq!(task, CoprocessTask::Monsoon);
                assert_eq!(args["voltage"], 4.2);
            }
            _ => panic!("wrong message variant"),
        }
    }

    #[tokio::test]
    async fn read_message_returns_none_on_clean_eof() {
        let (reader, writer) = tokio::io::duplex(4);
        drop(writer);
        let mut reader = reader;
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }
}
