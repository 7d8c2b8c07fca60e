//! The sender task: drains the outbound frame queue into the socket.
//!
//! Frames are taken in bursts. Each burst is coalesced into a fixed scratch
//! buffer so many small publishes collapse into a single kernel write;
//! frames larger than the scratch are written directly from their pool
//! buffer after the scratch is flushed. FIFO order, as observed at the
//! queue, is preserved in both paths.

use bytes::BytesMut;
use log::{debug, trace};
use std::sync::Arc;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    pool::PooledBuf,
    types::{error::Result, Counters},
    util,
};

/// Why the sender stopped, and the queue handed back for the next cycle
pub(crate) struct SenderExit {
    pub queue: mpsc::Receiver<PooledBuf>,
    pub result: Result<()>,
}

/// Run the sender until cancellation, queue closure, or a write error.
///
/// `preamble` frames are written before anything already sitting in the
/// queue; the supervisor uses this to put `CONNECT` and the resubscribe
/// `SUB`s ahead of traffic that survived a reconnect.
pub(crate) async fn run<W: AsyncWrite + Unpin>(
    mut queue: mpsc::Receiver<PooledBuf>,
    mut writer: W,
    preamble: Vec<PooledBuf>,
    counters: Arc<Counters>,
    token: CancellationToken,
) -> SenderExit {
    let mut scratch = BytesMut::with_capacity(util::SENDER_SCRATCH_CAPACITY);

    for frame in preamble {
        if let Err(e) = process(&mut scratch, &mut writer, frame, &counters).await {
            return SenderExit {
                queue,
                result: Err(e.into()),
            };
        }
    }
    if let Err(e) = flush(&mut scratch, &mut writer).await {
        return SenderExit {
            queue,
            result: Err(e.into()),
        };
    }

    loop {
        let first = tokio::select! {
            _ = token.cancelled() => {
                debug!("sender cancelled");
                return SenderExit {
                    queue,
                    result: Ok(()),
                };
            }
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                // Every queue sender is gone; the client itself is shutting
                // down.
                None => {
                    return SenderExit {
                        queue,
                        result: Ok(()),
                    };
                }
            },
        };

        let mut burst = 1usize;
        counters.sub_sender_queue_bytes(first.len() as u64);
        let mut result = process(&mut scratch, &mut writer, first, &counters).await;
        // Greedily take whatever is immediately available so the whole
        // burst shares one flush.
        while result.is_ok() {
            match queue.try_recv() {
                Ok(frame) => {
                    burst += 1;
                    counters.sub_sender_queue_bytes(frame.len() as u64);
                    result = process(&mut scratch, &mut writer, frame, &counters).await;
                }
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = flush(&mut scratch, &mut writer).await;
        }
        trace!("sender burst of {} frame(s)", burst);

        if let Err(e) = result {
            return SenderExit {
                queue,
                result: Err(e.into()),
            };
        }
    }
}

// Copy a frame into the scratch, flushing first when it does not fit;
// oversize frames go straight from their pool buffer to the socket. The
// frame's storage returns to the pool when it drops at the end of the call.
async fn process<W: AsyncWrite + Unpin>(
    scratch: &mut BytesMut,
    writer: &mut W,
    frame: PooledBuf,
    counters: &Counters,
) -> std::io::Result<()> {
    let len = frame.len();
    if len > scratch.capacity() - scratch.len() {
        flush(scratch, writer).await?;
    }
    if len > scratch.capacity() {
        writer.write_all(&frame).await?;
    } else {
        scratch.extend_from_slice(&frame);
    }
    // Direct writes and coalesced copies count the same way.
    counters.add_transmitted(len as u64);
    Ok(())
}

async fn flush<W: AsyncWrite + Unpin>(
    scratch: &mut BytesMut,
    writer: &mut W,
) -> std::io::Result<()> {
    if scratch.is_empty() {
        return Ok(());
    }
    writer.write_all(scratch).await?;
    scratch.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame, pool::BufferPool, types::Subject};
    use tokio::io::AsyncReadExt;

    // Every frame accepted by the queue reaches the wire whole and in
    // order, whether it went through the scratch or the direct path.
    #[tokio::test]
    async fn frames_are_whole_and_fifo() {
        let pool = BufferPool::new();
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(64);
        let subject: Subject = "sender.test".parse().unwrap();

        let mut expected = Vec::new();
        let mut frame_count = 0u64;
        for i in 0..20usize {
            // Alternate small frames with one bigger than the scratch
            let payload = if i == 10 {
                vec![b'x'; util::SENDER_SCRATCH_CAPACITY + 1]
            } else {
                format!("payload {}", i).into_bytes()
            };
            let frame = frame::publish(&pool, &subject, None, None, &payload).unwrap();
            expected.extend_from_slice(&frame);
            counters.add_sender_queue_bytes(frame.len() as u64);
            frame_count += 1;
            tx.send(frame).await.unwrap();
        }
        drop(tx);

        let (writer, mut reader) = tokio::io::duplex(4 * util::SENDER_SCRATCH_CAPACITY);
        let read = tokio::spawn(async move {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await.unwrap();
            bytes
        });
        let exit = run(
            rx,
            writer,
            Vec::new(),
            Arc::clone(&counters),
            CancellationToken::new(),
        )
        .await;
        assert!(exit.result.is_ok());
        drop(exit);

        let written = read.await.unwrap();
        assert_eq!(written, expected);
        assert_eq!(counters.transmitted_messages(), frame_count);
        assert_eq!(counters.transmitted_bytes(), expected.len() as u64);
        assert_eq!(counters.sender_queue_bytes(), 0);

        let crlf_count = written.windows(2).filter(|w| *w == b"\r\n").count();
        // Two terminators per publish frame (control line and payload)
        assert_eq!(crlf_count as u64, 2 * frame_count);
    }

    #[tokio::test]
    async fn preamble_precedes_queued_frames() {
        let pool = BufferPool::new();
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(8);
        let subject: Subject = "ordering".parse().unwrap();

        let queued = frame::publish(&pool, &subject, None, None, b"queued").unwrap();
        counters.add_sender_queue_bytes(queued.len() as u64);
        tx.send(queued).await.unwrap();
        drop(tx);

        let preamble = vec![frame::connect(&pool, &crate::types::Connect::default())];

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let read = tokio::spawn(async move {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await.unwrap();
            bytes
        });
        let exit = run(rx, writer, preamble, counters, CancellationToken::new()).await;
        assert!(exit.result.is_ok());
        drop(exit);

        let written = read.await.unwrap();
        assert!(written.starts_with(b"CONNECT {"));
        assert!(written.ends_with(b"queued\r\n"));
    }
}
