//! External driver processes speaking the wire protocol on stdin/stdout.

use std::process::Stdio;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use indibus_protocol::{DriverKind, FrameReader, FrameWriter, MAX_FRAME_SIZE, StreamDecoder};

use super::{DeviceBackend, DeviceLink, pump_incoming, pump_outgoing};
use crate::error::{ServerError, ServerResult};

/// Backend running a driver executable.
///
/// The child's stderr is forwarded to the log. The child is killed on
/// [`destroy`](DeviceBackend::destroy); if it exits on its own the link
/// closes and the broker deregisters it.
pub struct ProcessBackend {
    path: String,
    args: Vec<String>,
    max_frame_size: usize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl ProcessBackend {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            max_frame_size: MAX_FRAME_SIZE,
            shutdown: Mutex::new(None),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }
}

impl DeviceBackend for ProcessBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Process
    }

    fn identifiers(&self) -> Vec<String> {
        vec![self.path.clone()]
    }

    fn start(&self) -> BoxFuture<'_, ServerResult<DeviceLink>> {
        Box::pin(async move {
            let mut child = Command::new(&self.path)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ServerError::device_start(&self.path, e))?;

            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(ServerError::device_start(&self.path, "missing stdio pipes"));
            };
            info!(path = %self.path, pid = ?child.id(), "Driver process started");

            let (stop_tx, mut stop_rx) = watch::channel(false);
            match self.shutdown.lock() {
                Ok(mut slot) => *slot = Some(stop_tx),
                Err(_) => return Err(ServerError::device_start(&self.path, "backend state poisoned")),
            }

            let (link, incoming_tx, outgoing_rx) = DeviceLink::pair();
            let reader = FrameReader::with_decoder(
                stdout,
                StreamDecoder::with_max_frame_size(self.max_frame_size),
            );

            let path = self.path.clone();
            tokio::spawn(async move { pump_incoming(reader, incoming_tx, &path).await });
            let path = self.path.clone();
            tokio::spawn(async move { pump_outgoing(FrameWriter::new(stdin), outgoing_rx, &path).await });

            if let Some(stderr) = child.stderr.take() {
                let path = self.path.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(driver = %path, "{line}");
                    }
                });
            }

            let path = self.path.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => info!(path = %path, %status, "Driver process exited"),
                        Err(e) => warn!(path = %path, error = %e, "Failed to wait for driver process"),
                    },
                    _ = stop_rx.changed() => {
                        if let Err(e) = child.kill().await {
                            warn!(path = %path, error = %e, "Failed to kill driver process");
                        } else {
                            info!(path = %path, "Driver process killed");
                        }
                    }
                }
            });

            Ok(link)
        })
    }

    fn destroy(&self) {
        if let Ok(mut slot) = self.shutdown.lock()
            && let Some(tx) = slot.take()
        {
            let _ = tx.send(true);
        }
    }
}
