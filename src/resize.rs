//! Resize Worker Pool. See spec §4.6.
//!
//! A bounded pool of long-lived subprocess workers (the crate's own
//! `resize-worker` binary). Each worker handles one job at a time and is
//! killed and respawned after a fixed number of jobs, to contain memory
//! growth from the underlying image engine without tearing down the whole
//! pool.

use crate::fingerprint::TransformOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Debug, Serialize)]
struct Job {
    path: PathBuf,
    still: bool,
    width: Option<u32>,
    height: Option<u32>,
}

/// Raw wire shape: the helper binary emits `{"ok":true,"new_length":N}` or
/// `{"ok":false,"error":"..."}`; `bool` doesn't serde-tag cleanly so this
/// mirrors it by hand.
#[derive(Debug, Deserialize)]
struct RawResult {
    ok: bool,
    new_length: Option<u64>,
    error: Option<String>,
}

type JobRequest = (Job, oneshot::Sender<std::io::Result<u64>>);

#[derive(Clone)]
pub struct ResizePool {
    tx: mpsc::UnboundedSender<JobRequest>,
}

impl ResizePool {
    pub fn spawn(worker_binary: PathBuf, pool_size: usize, recycle_count: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<JobRequest>();
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..pool_size.max(1) {
            let rx = rx.clone();
            let worker_binary = worker_binary.clone();
            tokio::spawn(async move {
                run_worker(worker_id, worker_binary, rx, recycle_count).await;
            });
        }

        ResizePool { tx }
    }

    /// Dispatches a resize job to the pool and awaits its completion,
    /// without blocking the calling task on the subprocess itself.
    pub async fn resize(&self, path: &Path, options: &TransformOptions) -> std::io::Result<u64> {
        let (tx, rx) = oneshot::channel();
        let job = Job {
            path: path.to_path_buf(),
            still: options.still,
            width: options.width,
            height: options.height,
        };
        self.tx.send((job, tx)).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "resize pool has shut down")
        })?;
        rx.await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "resize worker dropped the job")
        })?
    }
}

async fn run_worker(
    worker_id: usize,
    worker_binary: PathBuf,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<JobRequest>>>,
    recycle_count: u32,
) {
    let mut child: Option<Child> = None;
    let mut jobs_handled: u32 = 0;

    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some((job, respond_to)) = next else { break };

        if child.is_none() {
            child = spawn_child(&worker_binary).ok();
        }

        let result = match child.as_mut() {
            Some(c) => run_job(c, &job).await,
            None => Err(std::io::Error::other("failed to spawn resize worker process")),
        };

        if result.is_err() {
            // A broken pipe / crashed child must be replaced before the
            // next job, regardless of the recycle counter.
            if let Some(mut c) = child.take() {
                let _ = c.kill().await;
            }
        }

        jobs_handled += 1;
        if jobs_handled >= recycle_count.max(1) {
            tracing::debug!(worker_id, jobs_handled, "recycling resize worker");
            if let Some(mut c) = child.take() {
                let _ = c.kill().await;
            }
            jobs_handled = 0;
        }

        let _ = respond_to.send(result);
    }

    if let Some(mut c) = child.take() {
        let _ = c.kill().await;
    }
}

fn spawn_child(worker_binary: &Path) -> std::io::Result<Child> {
    Command::new(worker_binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn run_job(child: &mut Child, job: &Job) -> std::io::Result<u64> {
    let stdin = child
        .stdin
        .as_mut()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin"))?;
    let mut line = serde_json::to_string(job)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;

    let stdout = child
        .stdout
        .as_mut()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdout"))?;
    let mut reader = BufReader::new(stdout);
    let mut response = String::new();
    let bytes_read = reader.read_line(&mut response).await?;
    if bytes_read == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "worker closed stdout"));
    }

    let raw: RawResult = serde_json::from_str(response.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if raw.ok {
        raw.new_length
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "missing new_length"))
    } else {
        Err(std::io::Error::other(raw.error.unwrap_or_else(|| "resize failed".to_string())))
    }
}
