use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::aof::AofSender;
use crate::commands::{dispatch, ConnState};
use crate::resp::{read_value, RespLimits};
use crate::store::Store;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) async fn handle_connection(
    stream: TcpStream,
    store: Store,
    aof: Option<AofSender>,
    limits: RespLimits,
    _permit: OwnedSemaphorePermit,
) {
    let mut conn = ConnState::new(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    // Disable Nagle: send replies immediately rather than waiting to coalesce small writes.
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(64 * 1024, read_half);
    // BufWriter accumulates replies; we flush only when no more pipelined
    // commands are buffered, collapsing N pipelined writes into one syscall.
    let mut writer = BufWriter::with_capacity(64 * 1024, write_half);
    loop {
        match read_value(&mut reader, limits).await {
            Ok(None) => break,
            Ok(Some(frame)) => {
                let (response, quit) = dispatch(frame, &store, &mut conn, aof.as_ref()).await;
                if writer.write_all(&response).await.is_err() {
                    break;
                }
                if quit {
                    let _ = writer.flush().await;
                    break;
                }
                if reader.buffer().is_empty() && writer.flush().await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // Malformed or torn input: close without a reply.
                debug!(client_id = conn.client_id, error = %e, "closing connection");
                break;
            }
        }
    }
    debug!(client_id = conn.client_id, "connection closed");
}
