//! NDJSON worker protocol.
//!
//! One JSON frame per line over the worker's stdin (host to worker) and
//! stdout (worker to host). The host opens with [`HostFrame::Init`]; after
//! that the worker sends [`WorkerFrame::Pull`] whenever it can take one more
//! message and the host answers each pull with exactly one
//! [`HostFrame::Task`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::handler::WorkerContext;
use crate::queue::{ResultMessage, TaskMessage};

/// Buffer size of the frame channels on either side of a pipe.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Frames sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Init { context: WorkerContext },
    Task { message: TaskMessage },
}

/// Frames sent from a worker to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    Pull,
    Result { message: ResultMessage },
}

/// Errors from encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode frame {line:?}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Frame channel closed")]
    Closed,
}

/// Encode a frame as a single line (without the trailing newline).
pub fn encode_line<F: Serialize>(frame: &F) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(ProtocolError::Encode)
}

pub fn decode_line<F: DeserializeOwned>(line: &str) -> Result<F, ProtocolError> {
    serde_json::from_str(line).map_err(|source| ProtocolError::Decode {
        line: line.to_string(),
        source,
    })
}

/// Spawn a task that writes every frame sent on the returned channel as one
/// line. The task ends when all senders are dropped or the pipe breaks.
pub fn spawn_frame_writer<W, F>(writer: W, label: String) -> (mpsc::Sender<F>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<F>(FRAME_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = rx.recv().await {
            let line = match encode_line(&frame) {
                Ok(line) => line,
                Err(e) => {
                    error!(pipe = %label, error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                debug!(pipe = %label, error = %e, "Failed to write frame");
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                debug!(pipe = %label, error = %e, "Failed to write newline");
                break;
            }
            if let Err(e) = writer.flush().await {
                debug!(pipe = %label, error = %e, "Failed to flush frame");
                break;
            }
        }
        debug!(pipe = %label, "Frame writer finished");
    });
    (tx, handle)
}

/// Spawn a task that decodes one frame per line and forwards it on the
/// returned channel. Malformed lines are logged and skipped; EOF ends the
/// stream.
pub fn spawn_frame_reader<R, F>(reader: R, label: String) -> (mpsc::Receiver<F>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<F>(FRAME_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line::<F>(&line) {
                        Ok(frame) => {
                            if tx.send(frame).await.is_err() {
                                debug!(pipe = %label, "Frame receiver dropped");
                                break;
                            }
                        }
                        Err(e) => warn!(pipe = %label, error = %e, "Skipping malformed frame"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(pipe = %label, error = %e, "Failed to read frame");
                    break;
                }
            }
        }
        debug!(pipe = %label, "Frame reader finished");
    });
    (rx, handle)
}
