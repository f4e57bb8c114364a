// src/core/persistence/aof.rs

//! Implements the append-only log: a durable, replayable journal of every
//! accepted write, stored as a plain concatenation of RESP-encoded command
//! arrays with no extra framing.
//!
//! A dedicated writer task owns the file handle. The dispatch path sends each
//! write together with a oneshot ack channel and waits for the ack before the
//! client sees `+OK`; under the `always` policy the ack is only sent after
//! fsync, which is what makes the durability guarantee hold.

use crate::core::JasperError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Decoder;
use tracing::{error, info, warn};

/// The capacity of the AOF work channel. Large enough that slow disk I/O
/// does not immediately stall the dispatch path.
const AOF_CHANNEL_CAPACITY: usize = 65536;

/// How the append-only log is synced to stable storage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AppendFsync {
    /// fsync after every append; the append is durable before it is acked.
    Always,
    /// A background 1 Hz tick fsyncs the file; durable within ~1.5 s.
    #[default]
    #[serde(rename = "every-second", alias = "everysec")]
    EverySec,
    /// Never fsync explicitly; the OS decides.
    No,
}

/// One unit of work for the AOF writer: the command frame plus the ack the
/// dispatch path is waiting on.
#[derive(Debug)]
pub struct AofWork {
    pub frame: RespFrame,
    pub ack: oneshot::Sender<Result<(), JasperError>>,
}

/// The sending half handed to the dispatch path.
#[derive(Debug, Clone)]
pub struct AofHandle {
    tx: mpsc::Sender<AofWork>,
}

impl AofHandle {
    /// Appends a command to the log and waits until it has been written
    /// (and, under `always`, fsynced).
    pub async fn append(&self, frame: RespFrame) -> Result<(), JasperError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(AofWork {
                frame,
                ack: ack_tx,
            })
            .await
            .map_err(|_| JasperError::AofError("AOF writer has stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| JasperError::AofError("AOF writer dropped the ack".into()))?
    }
}

/// The background task that owns the AOF file.
pub struct AofWriterTask {
    writer: BufWriter<TokioFile>,
    policy: AppendFsync,
    rx: mpsc::Receiver<AofWork>,
}

impl AofWriterTask {
    /// Opens (or creates) the log at `path` and returns the task together
    /// with the handle the dispatch path appends through.
    pub async fn open(path: &str, policy: AppendFsync) -> Result<(Self, AofHandle), JasperError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, rx) = mpsc::channel(AOF_CHANNEL_CAPACITY);
        Ok((
            Self {
                writer: BufWriter::new(file),
                policy,
                rx,
            },
            AofHandle { tx },
        ))
    }

    /// The main run loop for the AOF writer task.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("AOF writer task started. Fsync policy: {:?}", self.policy);
        let mut fsync_tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("AOF writer task shutting down. Performing final drain and sync.");
                    self.drain_and_sync().await;
                    return;
                }
                _ = fsync_tick.tick(), if self.policy == AppendFsync::EverySec => {
                    if let Err(e) = self.sync_to_disk().await {
                        error!("Periodic AOF fsync failed: {}", e);
                    }
                }
                maybe_work = self.rx.recv() => {
                    match maybe_work {
                        Some(work) => self.handle_work(work).await,
                        None => {
                            info!("AOF channel closed, writer task shutting down.");
                            self.drain_and_sync().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_work(&mut self, work: AofWork) {
        let result = self.write_frame(&work.frame).await;
        // The dispatch side may have timed out and gone away; that is fine.
        let _ = work.ack.send(result);
    }

    async fn write_frame(&mut self, frame: &RespFrame) -> Result<(), JasperError> {
        let encoded = frame.encode_to_vec()?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        if self.policy == AppendFsync::Always {
            self.writer.get_ref().sync_data().await?;
        }
        Ok(())
    }

    /// Drains pending work and performs a final sync before shutdown.
    async fn drain_and_sync(&mut self) {
        self.rx.close();
        while let Some(work) = self.rx.recv().await {
            let result = self.write_frame(&work.frame).await;
            if let Err(ref e) = result {
                warn!("Could not write pending AOF entry during shutdown: {}", e);
            }
            let _ = work.ack.send(result);
        }
        if let Err(e) = self.sync_to_disk().await {
            error!("Failed to sync AOF file on shutdown: {}", e);
        }
    }

    async fn sync_to_disk(&mut self) -> Result<(), JasperError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }
}

/// Replays the log at `path`, feeding each decoded command to `apply`.
///
/// Execution errors are logged and replay continues; a truncated tail (a torn
/// final write) ends replay without failing. Returns the number of commands
/// applied. A missing file is not an error.
pub async fn replay<F>(path: &str, mut apply: F) -> Result<usize, JasperError>
where
    F: AsyncFnMut(Vec<Bytes>) -> Result<(), JasperError>,
{
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("AOF file not found at {}. Nothing to replay.", path);
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut buf = BytesMut::from(&data[..]);
    let mut codec = RespFrameCodec;
    let mut applied = 0usize;

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                let args = match frame.into_args() {
                    Ok(args) => args,
                    Err(e) => {
                        warn!("Skipping malformed AOF entry: {}", e);
                        continue;
                    }
                };
                if let Err(e) = apply(args).await {
                    warn!("AOF replay: command failed and was skipped: {}", e);
                } else {
                    applied += 1;
                }
            }
            Ok(None) => {
                if !buf.is_empty() {
                    warn!(
                        "AOF ends with a truncated entry ({} trailing bytes ignored)",
                        buf.len()
                    );
                }
                break;
            }
            Err(e) => {
                warn!("AOF replay stopped on undecodable data: {}", e);
                break;
            }
        }
    }

    info!("AOF replay complete: {} commands applied", applied);
    Ok(applied)
}
