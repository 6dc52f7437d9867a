use std::{sync::Arc, time::Instant};

use tracing::{debug, error, trace, warn};

use crate::{
    Result,
    connection::{Connection, ConnectionId, TransmitKind},
    constants::{
        BUCKET_MAX_RETRIES, BUCKET_RETRY_STEP, BUFFER_SIZE, IDLE_WAIT, SEND_GATE_BYTES,
        TOMBSTONE_TTL,
    },
    traits::{LocalConnector, Transport, TunnelEnvironment},
};

use super::Tunnel;

impl<T: Transport, E: TunnelEnvironment, C: LocalConnector> Tunnel<T, E, C> {
    /// Round-robin over all connections, sending whatever they have to send, forever.
    pub(super) async fn run_send_loop(self: Arc<Self>) -> Result<()> {
        let mut out = vec![0u8; BUFFER_SIZE];
        let mut snapshot = Vec::new();
        let mut removals = Vec::new();
        loop {
            let sent = self.sweep(&mut out, &mut snapshot, &mut removals).await;
            if !sent {
                tokio::select! {
                    _ = self.send_wakeup.notified() => {},
                    _ = tokio::time::sleep(IDLE_WAIT) => {},
                }
            }
        }
    }

    // One pass over all connections. Returns true if anything was sent.
    async fn sweep(
        &self,
        out: &mut [u8],
        snapshot: &mut Vec<Arc<Connection>>,
        removals: &mut Vec<ConnectionId>,
    ) -> bool {
        snapshot.extend(self.connections.read().values().cloned());

        let mut sent_any = false;
        for conn in snapshot.drain(..) {
            if !conn.is_alive(self.env.now()) {
                removals.push(conn.id());
                continue;
            }
            let Some(peer) = conn.peer() else {
                // Entry side, waiting for the first reply.
                continue;
            };
            if !self
                .wait_for_tokens(|now| self.global_bucket.test(SEND_GATE_BYTES, now))
                .await
            {
                trace!("global bucket exhausted");
                continue;
            }

            loop {
                let transmit = match conn.poll_transmit(self.env.now(), out) {
                    Ok(Some(t)) => t,
                    Ok(None) => break,
                    Err(e) => {
                        error!(id = conn.id(), "error producing segment: {e:#}");
                        conn.close(format_args!("error producing segment: {e:#}"));
                        debug_assert!(!e.is_bug(), "{e:#}");
                        removals.push(conn.id());
                        break;
                    }
                };

                let len = transmit.len as u64;
                if !self
                    .wait_for_tokens(|now| conn.bucket().consume(len, now))
                    .await
                {
                    // Data segments stay queued and will be retransmitted.
                    trace!(id = conn.id(), "connection bucket exhausted, skipping segment");
                    break;
                }

                match self.transport.send_to(&out[..transmit.len], peer).await {
                    Ok(_) => {
                        sent_any = true;
                        self.stats
                            .on_sent(transmit.len, transmit.kind == TransmitKind::NewData);
                    }
                    Err(e) => {
                        warn!(id = conn.id(), ?peer, "error sending: {e:#}");
                        conn.close(format_args!("error sending: {e:#}"));
                        removals.push(conn.id());
                        break;
                    }
                }
            }
        }

        self.apply_removals(removals);
        sent_any
    }

    // Bounded wait for the bucket to allow something. Never blocks the loop for long.
    async fn wait_for_tokens(&self, mut check: impl FnMut(Instant) -> bool) -> bool {
        for _ in 0..BUCKET_MAX_RETRIES {
            if check(self.env.now()) {
                return true;
            }
            tokio::time::sleep(BUCKET_RETRY_STEP).await;
        }
        check(self.env.now())
    }

    fn apply_removals(&self, removals: &mut Vec<ConnectionId>) {
        let now = self.env.now();
        let exit_role = self.connector.is_some();

        if !removals.is_empty() {
            let mut connections = self.connections.write();
            let mut tombstones = self.tombstones.lock();
            for id in removals.drain(..) {
                let Some(conn) = connections.remove(&id) else {
                    continue;
                };
                conn.close("connection timed out");
                if exit_role {
                    tombstones.insert(id, now + TOMBSTONE_TTL);
                }
                debug!(id, remaining = connections.len(), "connection removed");
            }
            self.stats.set_live_connections(connections.len());
        }

        if exit_role {
            self.tombstones.lock().retain(|_, until| now < *until);
        }
    }
}
