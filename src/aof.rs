use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::commands;
use crate::resp::{read_value, RespLimits};
use crate::store::Store;

/// Frames buffered between the command handlers and the disk writer.
pub(crate) const AOF_QUEUE_DEPTH: usize = 1024;

/// Cloneable handle the write path uses to enqueue encoded command frames.
#[derive(Clone)]
pub(crate) struct AofSender {
    tx: mpsc::Sender<Vec<u8>>,
    blocking: bool,
}

impl AofSender {
    /// Hand one frame to the writer. In the default non-blocking mode a
    /// full queue drops the frame (latency over durability); the blocking
    /// mode waits for space instead.
    pub(crate) async fn append(&self, frame: Vec<u8>) {
        if self.blocking {
            if self.tx.send(frame).await.is_err() {
                warn!("append-only log writer is gone, frame lost");
                return;
            }
        } else {
            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!("respd_aof_dropped_total").increment(1);
                    warn!("append-only log queue full, dropping frame");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("append-only log writer is gone, frame lost");
                    return;
                }
            }
        }
        metrics::counter!("respd_aof_appends_total").increment(1);
    }
}

/// The append-only log: a dedicated writer task draining a bounded queue
/// into a file opened for append. One unbuffered write per frame, no
/// seeks; fsync happens once, at shutdown.
pub(crate) struct Aof {
    sender: AofSender,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<io::Result<()>>,
}

impl Aof {
    pub(crate) fn open(path: &Path, blocking: bool) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::channel(AOF_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(writer_loop(file, rx, stop_rx));
        info!(path = %path.display(), blocking, "append-only log opened");
        Ok(Self {
            sender: AofSender { tx, blocking },
            stop_tx,
            handle,
        })
    }

    pub(crate) fn sender(&self) -> AofSender {
        self.sender.clone()
    }

    /// Stop the writer: remaining queued frames are written, the file is
    /// fsynced and closed. Completes even when nothing is pending.
    pub(crate) async fn stop(self) {
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(Ok(())) => info!("append-only log flushed and closed"),
            Ok(Err(e)) => error!(error = %e, "append-only log shutdown failed"),
            Err(e) => error!(error = %e, "append-only log writer panicked"),
        }
    }
}

async fn writer_loop(
    mut file: File,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut stop_rx: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => file.write_all(&frame)?,
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }
    // Drain whatever made it into the queue before the stop signal.
    while let Ok(frame) = rx.try_recv() {
        file.write_all(&frame)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Rebuild the keyspace from the log before the listener accepts anyone.
///
/// Each frame is executed through the regular dispatcher, outside any
/// transaction and with no log handle attached, so replayed commands are
/// not appended again. A torn trailing frame is expected after a crash
/// and ends the replay silently. Returns the number of commands applied.
pub(crate) async fn replay(path: &Path, store: &Store) -> io::Result<u64> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut reader = tokio::io::BufReader::new(file);
    let limits = RespLimits::default();

    let mut count = 0u64;
    loop {
        match read_value(&mut reader, limits).await {
            Ok(None) => break,
            Ok(Some(frame)) => {
                let Some(args) = frame.into_args() else {
                    warn!("append-only log holds a non-command frame, stopping replay");
                    break;
                };
                commands::execute(&args, store, None).await;
                count += 1;
            }
            Err(e)
                if e.kind() == io::ErrorKind::UnexpectedEof
                    || e.kind() == io::ErrorKind::InvalidData =>
            {
                warn!(error = %e, replayed = count, "torn tail in append-only log, ignoring");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}
