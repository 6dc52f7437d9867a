use std::sync::Arc;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Notify, mpsc::UnboundedReceiver},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    Error, Result,
    buffer_pool::{Buffer, BufferPool},
    connection::Connection,
    constants::MAX_PAYLOAD,
    spawn_utils::spawn,
    traits::LocalStream,
    utils::FnDropGuard,
};

/// Start the two tasks pumping bytes between the local stream and the connection.
///
/// Both end when the connection is closed. Either of them ending closes the connection.
pub(crate) fn spawn_local_stream_tasks<S: LocalStream>(
    span: &tracing::Span,
    conn: Arc<Connection>,
    stream: S,
    delivered: UnboundedReceiver<Buffer>,
    pool: Arc<BufferPool>,
    scheduler_wakeup: Arc<Notify>,
) {
    let (reader, writer) = tokio::io::split(stream);
    spawn(
        tracing::error_span!(parent: span, "reader"),
        run_reader(conn.clone(), reader, pool.clone(), scheduler_wakeup.clone()),
    );
    spawn(
        tracing::error_span!(parent: span, "writer"),
        run_writer(conn, writer, delivered, pool, scheduler_wakeup),
    );
}

async fn run_reader(
    conn: Arc<Connection>,
    reader: impl AsyncRead + Unpin,
    pool: Arc<BufferPool>,
    scheduler_wakeup: Arc<Notify>,
) -> Result<()> {
    let _close = FnDropGuard::new(|| {
        conn.close("local stream reader finished");
        scheduler_wakeup.notify_one();
    });
    let cancel = conn.cancellation_token().clone();
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = read_loop(&conn, reader, &pool, &scheduler_wakeup) => r,
    }
}

async fn read_loop(
    conn: &Connection,
    mut reader: impl AsyncRead + Unpin,
    pool: &BufferPool,
    scheduler_wakeup: &Notify,
) -> Result<()> {
    let mut chunk = [0u8; MAX_PAYLOAD];
    loop {
        conn.wait_for_unsent_space().await;
        let len = reader.read(&mut chunk).await.map_err(Error::LocalStream)?;
        if len == 0 {
            debug!("local stream EOF");
            return Ok(());
        }
        trace!(len, "read from local stream");
        conn.enqueue_outbound(pool.acquire_from(&chunk[..len])?)?;
        scheduler_wakeup.notify_one();
    }
}

async fn run_writer(
    conn: Arc<Connection>,
    mut writer: impl AsyncWrite + Unpin,
    mut delivered: UnboundedReceiver<Buffer>,
    pool: Arc<BufferPool>,
    scheduler_wakeup: Arc<Notify>,
) -> Result<()> {
    let cancel = conn.cancellation_token().clone();
    let result = write_loop(&mut writer, &mut delivered, &pool, &cancel).await;

    delivered.close();
    while let Ok(buf) = delivered.try_recv() {
        pool.release(buf)?;
    }
    let _ = writer.shutdown().await;

    if let Err(e) = &result {
        conn.close(format_args!("error writing to local stream: {e:#}"));
        scheduler_wakeup.notify_one();
    }
    result
}

// Every buffer taken off the channel goes back to the pool, cancelled mid-write or not.
async fn write_loop(
    writer: &mut (impl AsyncWrite + Unpin),
    delivered: &mut UnboundedReceiver<Buffer>,
    pool: &BufferPool,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let buf = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            buf = delivered.recv() => match buf {
                Some(buf) => buf,
                None => return Ok(()),
            },
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => None,
            r = writer.write_all(buf.get()) => Some(r),
        };
        trace!(len = buf.len(), "wrote to local stream");
        pool.release(buf)?;
        let Some(res) = res else {
            return Ok(());
        };
        res.map_err(Error::LocalStream)?;
        if delivered.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = writer.flush() => r.map_err(Error::LocalStream)?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::Notify,
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        bucket::Bucket,
        buffer_pool::BufferPool,
        connection::{Connection, ConnectionOpts},
        constants::MAX_SEGMENT_SIZE,
        test_util::{ADDR_2, setup_test_logging},
    };

    use super::spawn_local_stream_tasks;

    #[tokio::test]
    async fn test_pumps_both_ways_and_closes_on_eof() {
        setup_test_logging();
        let now = Instant::now();
        let pool = Arc::new(BufferPool::default());
        let (conn, delivered) = Connection::new(
            1,
            Some(ADDR_2),
            ConnectionOpts {
                retransmit: Duration::from_millis(100),
                initial_retransmit: None,
                receive_ceiling: 1_000_000,
            },
            Bucket::new_root(1_000_000, 1_000_000, now),
            pool.clone(),
            CancellationToken::new(),
            now,
        );
        let wakeup = Arc::new(Notify::new());
        let (mut local, tunnel_side) = tokio::io::duplex(4096);
        spawn_local_stream_tasks(
            &tracing::Span::none(),
            conn.clone(),
            tunnel_side,
            delivered,
            pool.clone(),
            wakeup.clone(),
        );

        local.write_all(b"ping").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), wakeup.notified())
            .await
            .unwrap();
        let mut out = [0u8; MAX_SEGMENT_SIZE];
        let mut payloads = Vec::new();
        while let Some(t) = conn.poll_transmit(now, &mut out).unwrap() {
            let s = crate::message::Segment::deserialize(&out[..t.len]).unwrap();
            if s.header.htype == crate::raw::Type::Data {
                payloads.push(s.payload.to_vec());
            }
        }
        assert_eq!(payloads, vec![b"ping".to_vec()]);

        // Inbound data ends up in the local stream.
        let mut segment = [0u8; MAX_SEGMENT_SIZE];
        let len = crate::raw::TunnelHeader {
            connection_id: 1,
            htype: crate::raw::Type::Data,
            ..Default::default()
        }
        .serialize_with_payload(&mut segment, b"pong")
        .unwrap();
        let s = crate::message::Segment::deserialize(&segment[..len]).unwrap();
        conn.on_segment(&s.header, s.payload, ADDR_2, now).unwrap();
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(local);
        tokio::time::timeout(Duration::from_secs(1), conn.cancellation_token().cancelled())
            .await
            .unwrap();
        assert!(!conn.is_alive(now));

        // Writer task drains and releases whatever is left.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_close_during_blocked_write_releases_buffer() {
        setup_test_logging();
        let now = Instant::now();
        let pool = Arc::new(BufferPool::default());
        let (conn, delivered) = Connection::new(
            1,
            Some(ADDR_2),
            ConnectionOpts {
                retransmit: Duration::from_millis(100),
                initial_retransmit: None,
                receive_ceiling: 1_000_000,
            },
            Bucket::new_root(1_000_000, 1_000_000, now),
            pool.clone(),
            CancellationToken::new(),
            now,
        );
        // Nobody reads the local end and it only has room for 4 bytes, so the writer
        // gets stuck halfway through the payload.
        let (_local, tunnel_side) = tokio::io::duplex(4);
        spawn_local_stream_tasks(
            &tracing::Span::none(),
            conn.clone(),
            tunnel_side,
            delivered,
            pool.clone(),
            Arc::new(Notify::new()),
        );

        let mut segment = [0u8; MAX_SEGMENT_SIZE];
        let len = crate::raw::TunnelHeader {
            connection_id: 1,
            htype: crate::raw::Type::Data,
            ..Default::default()
        }
        .serialize_with_payload(&mut segment, b"more than four bytes")
        .unwrap();
        let s = crate::message::Segment::deserialize(&segment[..len]).unwrap();
        conn.on_segment(&s.header, s.payload, ADDR_2, now).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.outstanding(), 1);

        conn.close("test");
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.outstanding() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
