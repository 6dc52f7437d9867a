use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use tokio::sync::{
    Notify,
    mpsc::{UnboundedReceiver, UnboundedSender, error::SendError, unbounded_channel},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    Error, Result,
    bucket::Bucket,
    buffer_pool::{Buffer, BufferPool},
    constants::{
        HEADER_SIZE, HEARTBEAT_INTERVAL, LIVENESS_TIMEOUT, MAX_IN_FLIGHT, MAX_PAYLOAD,
        MAX_UNSENT_CHUNKS, RATE_ANNOUNCE_INTERVAL, SEND_GATE_BYTES,
    },
    error::OptionContext,
    raw::{TunnelHeader, Type, rewrite_ack_nr},
    seq_nr::SeqNr,
};

pub type ConnectionId = u32;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnectionOpts {
    pub retransmit: Duration,
    // None disables double-send.
    pub initial_retransmit: Option<Duration>,
    // What we tell the remote it may send us, bytes per second.
    pub receive_ceiling: u32,
}

struct OutgoingDatagram {
    seq_nr: SeqNr,
    // Fully serialized segment, header included.
    buf: Buffer,
    resend_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransmitKind {
    Control,
    NewData,
    Retransmit,
}

/// A segment that [`Connection::poll_transmit`] wrote out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Transmit {
    pub len: usize,
    pub kind: TransmitKind,
}

/// What happened to an inbound segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Received {
    // In-order data; this many payloads went to the local stream (held ones included).
    Delivered(usize),
    // Early data, stored until the gap closes.
    Held,
    // Already seen, or too old.
    Duplicate,
    Control,
    Closed,
}

impl Received {
    pub fn is_unique_data(&self) -> bool {
        matches!(self, Received::Delivered(_) | Received::Held)
    }
}

struct ConnectionState {
    closed: bool,

    // Unknown until the first datagram from the remote arrives (entry side).
    peer: Option<SocketAddr>,

    // Sequence number the next new data segment gets.
    next_send_seq_nr: SeqNr,
    // The most recent ACK the remote sent us.
    remote_ack: SeqNr,
    // Sequence number we expect next from the remote.
    next_recv_seq_nr: SeqNr,

    // Data that arrived before its turn.
    held: HashMap<SeqNr, Buffer>,

    // Payload read from the local stream, not yet put into segments.
    unsent: VecDeque<Buffer>,
    // Freshly sent segments, to be sent once more after initial_retransmit.
    double_send: VecDeque<OutgoingDatagram>,
    // Sent segments waiting for their ACK.
    retransmit: VecDeque<OutgoingDatagram>,

    alive_until: Instant,
    next_heartbeat_at: Instant,

    rate_ack_pending: bool,
    rate_announce_acked: bool,
    next_rate_announce_at: Instant,
}

impl ConnectionState {
    fn release_all(&mut self, pool: &BufferPool) -> Result<()> {
        let held = std::mem::take(&mut self.held);
        let unsent = std::mem::take(&mut self.unsent);
        let double_send = std::mem::take(&mut self.double_send);
        let retransmit = std::mem::take(&mut self.retransmit);

        let mut result = Ok(());
        let buffers = held
            .into_values()
            .chain(unsent)
            .chain(double_send.into_iter().map(|d| d.buf))
            .chain(retransmit.into_iter().map(|d| d.buf));
        for buf in buffers {
            if let Err(e) = pool.release(buf) {
                result = Err(e);
            }
        }
        result
    }

    fn is_acked(&self, seq_nr: SeqNr) -> bool {
        !seq_nr.is_after(self.remote_ack)
    }
}

/// One tunneled TCP stream: sequencing, retransmission, reordering and rate negotiation.
///
/// The scheduler calls [`Connection::poll_transmit`], the UDP dispatcher calls
/// [`Connection::on_segment`], and the local stream tasks feed and drain it. All state
/// sits behind one lock.
pub(crate) struct Connection {
    id: ConnectionId,
    opts: ConnectionOpts,
    bucket: Arc<Bucket>,
    pool: Arc<BufferPool>,
    state: Mutex<ConnectionState>,

    // In-order payload for the local stream writer.
    delivered: UnboundedSender<Buffer>,
    // Woken when the unsent queue gets drained.
    unsent_space: Notify,

    cancellation_token: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        opts: ConnectionOpts,
        bucket: Arc<Bucket>,
        pool: Arc<BufferPool>,
        cancellation_token: CancellationToken,
        now: Instant,
    ) -> (Arc<Self>, UnboundedReceiver<Buffer>) {
        let (delivered, delivered_rx) = unbounded_channel();
        let conn = Arc::new(Self {
            id,
            opts,
            bucket,
            pool,
            state: Mutex::new(ConnectionState {
                closed: false,
                peer,
                next_send_seq_nr: SeqNr(0),
                remote_ack: SeqNr(0) - 1,
                next_recv_seq_nr: SeqNr(0),
                held: Default::default(),
                unsent: Default::default(),
                double_send: Default::default(),
                retransmit: Default::default(),
                alive_until: now + LIVENESS_TIMEOUT,
                next_heartbeat_at: now,
                rate_ack_pending: false,
                rate_announce_acked: false,
                next_rate_announce_at: now,
            }),
            delivered,
            unsent_space: Notify::new(),
            cancellation_token,
        });
        (conn, delivered_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.state.lock().peer
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn is_alive(&self, now: Instant) -> bool {
        let g = self.state.lock();
        !g.closed && now <= g.alive_until
    }

    /// Tear down: wakes up the local stream tasks and gives all buffers back to the pool.
    pub fn close(&self, reason: impl std::fmt::Display) {
        let mut g = self.state.lock();
        if g.closed {
            return;
        }
        g.closed = true;
        debug!(id = self.id, %reason, "closing connection");
        if let Err(e) = g.release_all(&self.pool) {
            error!(id = self.id, "error releasing buffers: {e:#}");
            debug_assert!(false, "buffer pool protocol violation: {e:#}");
        }
        drop(g);
        self.cancellation_token.cancel();
        self.unsent_space.notify_one();
    }

    /// Queue payload read from the local stream.
    pub fn enqueue_outbound(&self, buf: Buffer) -> Result<()> {
        if buf.len() > MAX_PAYLOAD {
            let len = buf.len();
            self.pool.release(buf)?;
            return Err(Error::BugTooSmallBuffer {
                len,
                capacity: MAX_PAYLOAD,
            });
        }
        let mut g = self.state.lock();
        if g.closed {
            drop(g);
            self.pool.release(buf)?;
            return Err(Error::ConnectionClosed(self.id));
        }
        g.unsent.push_back(buf);
        Ok(())
    }

    /// Resolves once there is space in the unsent queue, or the connection is closed.
    pub async fn wait_for_unsent_space(&self) {
        loop {
            let notified = self.unsent_space.notified();
            let ready = {
                let g = self.state.lock();
                g.closed || g.unsent.len() < MAX_UNSENT_CHUNKS
            };
            if ready {
                return;
            }
            notified.await;
        }
    }

    fn header(&self, htype: Type, seq_nr: SeqNr, state: &ConnectionState) -> TunnelHeader {
        TunnelHeader {
            connection_id: self.id,
            htype,
            payload_len: 0,
            seq_nr,
            ack_nr: state.next_recv_seq_nr - 1,
        }
    }

    /// A heartbeat carrying the current ACK. Used to open a tunnel.
    pub fn serialize_heartbeat(&self, out: &mut [u8]) -> Result<usize> {
        let g = self.state.lock();
        self.header(Type::Heartbeat, SeqNr(0), &g).serialize(out)
    }

    /// Produce the next segment to send into `out`, if there is one.
    pub fn poll_transmit(&self, now: Instant, out: &mut [u8]) -> Result<Option<Transmit>> {
        let mut g = self.state.lock();
        if g.closed {
            return Ok(None);
        }
        if !self.bucket.test(SEND_GATE_BYTES, now) {
            return Ok(None);
        }

        let st = &mut *g;
        let transmit = self.produce(st, now, out)?;
        if let Some(t) = transmit {
            st.next_heartbeat_at = now + HEARTBEAT_INTERVAL;
            rewrite_ack_nr(&mut out[..t.len], st.next_recv_seq_nr - 1);
            trace!(id = self.id, ?t, "produced segment");
        }
        Ok(transmit)
    }

    fn produce(
        &self,
        st: &mut ConnectionState,
        now: Instant,
        out: &mut [u8],
    ) -> Result<Option<Transmit>> {
        if st.rate_ack_pending {
            st.rate_ack_pending = false;
            return self.control(st, Type::RateAck, &[], out).map(Some);
        }

        if !st.rate_announce_acked && now >= st.next_rate_announce_at {
            st.next_rate_announce_at = now + RATE_ANNOUNCE_INTERVAL;
            let ceiling = self.opts.receive_ceiling.to_be_bytes();
            return self.control(st, Type::RateAnnounce, &ceiling, out).map(Some);
        }

        if let Some(t) = self.pop_due(st, now, out, false)? {
            return Ok(Some(t));
        }
        if let Some(t) = self.pop_due(st, now, out, true)? {
            return Ok(Some(t));
        }

        let in_flight = st.next_send_seq_nr.distance_from(st.remote_ack + 1);
        if in_flight < MAX_IN_FLIGHT && !st.unsent.is_empty() {
            return self.new_data_segment(st, now, out).map(Some);
        }

        if now >= st.next_heartbeat_at {
            return self.control(st, Type::Heartbeat, &[], out).map(Some);
        }

        Ok(None)
    }

    fn control(
        &self,
        st: &ConnectionState,
        htype: Type,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<Transmit> {
        let len = self
            .header(htype, SeqNr(0), st)
            .serialize_with_payload(out, payload)?;
        Ok(Transmit {
            len,
            kind: TransmitKind::Control,
        })
    }

    // Pop the first due segment from the retransmit (or double-send) queue that still
    // isn't ACKed, and schedule it for another retransmit. ACKed ones are released.
    fn pop_due(
        &self,
        st: &mut ConnectionState,
        now: Instant,
        out: &mut [u8],
        double_send: bool,
    ) -> Result<Option<Transmit>> {
        loop {
            let queue = if double_send {
                &mut st.double_send
            } else {
                &mut st.retransmit
            };
            match queue.front() {
                Some(front) if front.resend_at <= now => {}
                _ => return Ok(None),
            }
            let mut dg = queue.pop_front().context("queue front vanished")?;

            if st.is_acked(dg.seq_nr) {
                trace!(id = self.id, seq_nr = ?dg.seq_nr, "dropping ACKed segment");
                self.pool.release(dg.buf)?;
                continue;
            }

            let len = copy_out(&dg.buf, out)?;
            dg.resend_at = now + self.opts.retransmit;
            st.retransmit.push_back(dg);
            return Ok(Some(Transmit {
                len,
                kind: TransmitKind::Retransmit,
            }));
        }
    }

    fn new_data_segment(
        &self,
        st: &mut ConnectionState,
        now: Instant,
        out: &mut [u8],
    ) -> Result<Transmit> {
        let mut buf = self.pool.acquire()?;
        buf.advance(HEADER_SIZE);

        while let Some(chunk) = st.unsent.front() {
            if buf.len() - HEADER_SIZE + chunk.len() > MAX_PAYLOAD {
                break;
            }
            let chunk = st.unsent.pop_front().context("queue front vanished")?;
            let res = buf.extend_from_slice(chunk.get());
            self.pool.release(chunk)?;
            res?;
        }
        self.unsent_space.notify_one();

        let seq_nr = st.next_send_seq_nr;
        st.next_send_seq_nr += 1;
        let mut header = self.header(Type::Data, seq_nr, st);
        header.payload_len = (buf.len() - HEADER_SIZE) as u16;
        header.serialize(buf.get_mut())?;

        let len = copy_out(&buf, out)?;
        let dg = OutgoingDatagram {
            seq_nr,
            buf,
            resend_at: now + self.opts.initial_retransmit.unwrap_or(self.opts.retransmit),
        };
        if self.opts.initial_retransmit.is_some() {
            st.double_send.push_back(dg);
        } else {
            st.retransmit.push_back(dg);
        }

        Ok(Transmit {
            len,
            kind: TransmitKind::NewData,
        })
    }

    /// Process a segment from the remote.
    pub fn on_segment(
        &self,
        header: &TunnelHeader,
        payload: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Received> {
        let mut g = self.state.lock();
        if g.closed {
            return Ok(Received::Closed);
        }
        let st = &mut *g;

        if st.peer.is_none() {
            debug!(id = self.id, ?from, "learned remote address");
            st.peer = Some(from);
        }
        st.alive_until = now + LIVENESS_TIMEOUT;
        if header.ack_nr.is_after(st.remote_ack) {
            st.remote_ack = header.ack_nr;
        }

        match header.htype {
            Type::Data => self.on_data(st, header.seq_nr, payload),
            Type::RateAnnounce => {
                let ceiling = <[u8; 4]>::try_from(payload)
                    .ok()
                    .map(i32::from_be_bytes)
                    .filter(|c| *c > 0);
                match ceiling {
                    Some(ceiling) => {
                        let ceiling = ceiling as u64;
                        self.bucket.limit_rate(ceiling, ceiling);
                        st.rate_ack_pending = true;
                    }
                    None => debug!(id = self.id, ?payload, "ignoring invalid rate announcement"),
                }
                Ok(Received::Control)
            }
            Type::RateAck => {
                if !st.rate_announce_acked {
                    trace!(id = self.id, "remote acknowledged our rate");
                }
                st.rate_announce_acked = true;
                Ok(Received::Control)
            }
            Type::Heartbeat => Ok(Received::Control),
            Type::Unknown(htype) => {
                trace!(id = self.id, htype, "ignoring segment of unknown type");
                Ok(Received::Control)
            }
        }
    }

    fn on_data(&self, st: &mut ConnectionState, seq_nr: SeqNr, payload: &[u8]) -> Result<Received> {
        if seq_nr == st.next_recv_seq_nr {
            self.deliver(self.pool.acquire_from(payload)?)?;
            st.next_recv_seq_nr += 1;
            let mut count = 1;
            while let Some(buf) = st.held.remove(&st.next_recv_seq_nr) {
                self.deliver(buf)?;
                st.next_recv_seq_nr += 1;
                count += 1;
            }
            return Ok(Received::Delivered(count));
        }

        if seq_nr.is_after(st.next_recv_seq_nr) && !st.held.contains_key(&seq_nr) {
            trace!(id = self.id, ?seq_nr, expected = ?st.next_recv_seq_nr, "holding out of order segment");
            st.held.insert(seq_nr, self.pool.acquire_from(payload)?);
            return Ok(Received::Held);
        }

        trace!(id = self.id, ?seq_nr, expected = ?st.next_recv_seq_nr, "dropping duplicate");
        Ok(Received::Duplicate)
    }

    fn deliver(&self, buf: Buffer) -> Result<()> {
        if let Err(SendError(buf)) = self.delivered.send(buf) {
            // The writer is gone, the connection is about to be torn down.
            self.pool.release(buf)?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.state.get_mut().release_all(&self.pool) {
            error!(id = self.id, "error releasing buffers on drop: {e:#}");
        }
    }
}

fn copy_out(buf: &Buffer, out: &mut [u8]) -> Result<usize> {
    let len = buf.len();
    if out.len() < len {
        return Err(Error::BugTooSmallBuffer {
            len,
            capacity: out.len(),
        });
    }
    out[..len].copy_from_slice(buf.get());
    Ok(len)
}
