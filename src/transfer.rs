//! Chunked file upload engine
//!
//! Streams one local file to the board: open the remote file, push
//! fixed-size checksummed chunks with an ack awaited per chunk and a
//! configurable pause between them, then verify the byte count and close.
//! There is no seek in the protocol, so any failed ack aborts the whole
//! transfer and a retry restarts from byte 0.

use crate::error::TransferError;
use crate::events::{emit, EventSender, SyncEvent};
use crate::protocol::{self, timeouts, ChunkAck, Command, CHUNK_SIZE};
use crate::session::Session;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Live progress of one upload. Created at transfer start, updated per
/// acknowledged chunk, discarded at completion or abort.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub filename: String,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub chunk_index: u64,
}

/// Upload `path` to the board as `remote_name` over a live session.
///
/// The caller holds the command gate for the whole call: the write
/// sequence (`M28`, chunks, `M4012`, `M29`) cannot tolerate interleaved
/// commands. On socket loss mid-transfer the remote file is left in an
/// unknown state; the next mirror pass sees the size mismatch and
/// re-queues the upload.
pub async fn upload(
    session: &mut Session,
    path: &Path,
    remote_name: &str,
    chunk_delay: Duration,
    events: &EventSender,
) -> Result<(), TransferError> {
    let local_read = |source| TransferError::LocalRead {
        name: remote_name.to_string(),
        source,
    };
    let total_bytes = std::fs::metadata(path).map_err(local_read)?.len();
    // Chunk offsets are u32 on the wire; a larger file would wrap them
    if total_bytes > u32::MAX as u64 {
        return Err(TransferError::TooLarge {
            name: remote_name.to_string(),
            size: total_bytes,
        });
    }

    let reply = session
        .exchange(&Command::BeginWrite(remote_name.to_string()))
        .await?;
    if protocol::is_error_reply(&reply) {
        // The refusal is followed by a confirmation line; drain it so the
        // session stays usable.
        session
            .read_line(timeouts::COMMAND_MS, "write refusal ok")
            .await?;
        return Err(TransferError::Refused {
            name: remote_name.to_string(),
            reply,
        });
    }

    info!("uploading {remote_name} ({total_bytes} bytes)");
    emit(
        events,
        SyncEvent::Transfer(TransferProgress {
            filename: remote_name.to_string(),
            bytes_sent: 0,
            total_bytes,
            chunk_index: 0,
        }),
    );

    let mut file = tokio::fs::File::open(path).await.map_err(local_read)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset: u64 = 0;
    let mut chunk_index: u64 = 0;

    loop {
        let n = read_chunk(&mut file, &mut buf).await.map_err(local_read)?;
        if n == 0 {
            break;
        }
        let frame = protocol::encode_chunk(offset as u32, &buf[..n]);
        session.send_raw(&frame).await?;
        let ack = session
            .read_line(timeouts::CHUNK_ACK_MS, "chunk ack")
            .await?;
        match protocol::parse_chunk_ack(&ack) {
            ChunkAck::Ok => {
                offset += n as u64;
                chunk_index += 1;
                emit(
                    events,
                    SyncEvent::Transfer(TransferProgress {
                        filename: remote_name.to_string(),
                        bytes_sent: offset,
                        total_bytes,
                        chunk_index,
                    }),
                );
            }
            // No partial-chunk retry: the protocol cannot seek, so a
            // checksum failure fails the file and the caller restarts it.
            ChunkAck::Resend { .. } | ChunkAck::Unknown(_) => {
                return Err(TransferError::ChunkNack {
                    chunk: chunk_index,
                    offset,
                    reply: ack,
                });
            }
        }
        // Pacing so the board's receive buffer keeps up
        tokio::time::sleep(chunk_delay).await;
    }

    let reply = session.exchange(&Command::VerifySize(offset)).await?;
    if reply.split_whitespace().next() != Some("ok") {
        session
            .read_line(timeouts::COMMAND_MS, "size verify ok")
            .await?;
        return Err(TransferError::SizeVerify {
            name: remote_name.to_string(),
            reply,
        });
    }

    let reply = session.exchange(&Command::EndWrite).await?;
    if protocol::is_error_reply(&reply) {
        return Err(TransferError::Refused {
            name: remote_name.to_string(),
            reply,
        });
    }

    debug!("upload of {remote_name} complete, {chunk_index} chunk(s)");
    Ok(())
}

/// Fill `buf` from the file, short only at EOF.
async fn read_chunk(
    file: &mut tokio::fs::File,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
