//! Per-peer encrypted connection.
//!
//! The connection is sans-IO: callers feed inbound datagrams through
//! [`Connection::process_receive`], drain outbound datagrams with
//! [`Connection::poll_outgoing`], and drive retransmission with
//! [`Connection::process_tick`]. The socket layer stays outside.
//!
//! Lock ordering: the transmission maps are taken before the congestion
//! lock; the congestion lock is always the innermost and never held across
//! an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cancel::CancelToken;
use crate::congestion::{CubicCongestion, RttEstimator};
use crate::embryo::Embryo;
use crate::error::{TransportError, TransportResult};
use crate::gene::{AckFrame, Frame, FOLLOWING_GENE_CAPACITY};
use crate::packet::{
    create_close_packet, create_handshake_packet, create_packet, decrypt_frame, CipherPool,
    PacketHeader, PacketType,
};
use crate::transmission::{ReceiveEvent, ReceiveTransmission, SendTransmission};

/// Active send transmissions at which congestion control engages.
const CONGESTION_ENABLE_THRESHOLD: usize = 5;

/// Re-check interval while waiting for a free transmission slot.
const SLOT_PULSE: Duration = Duration::from_millis(50);

/// First wait when a stream's send window is exhausted.
const STREAM_BACKOFF_START: Duration = Duration::from_millis(5);

/// Longest wait between stream window re-checks.
const STREAM_BACKOFF_CAP: Duration = Duration::from_millis(320);

/// Retired inbound transmissions remembered for late-duplicate acks.
const TOMBSTONE_LIMIT: usize = 128;

/// Negotiated per-connection limits and timing.
#[derive(Debug, Clone)]
pub struct Agreement {
    /// Concurrent send transmissions allowed.
    pub max_transmissions: usize,
    /// Floor for resend suppression when no RTT samples exist yet.
    pub minimum_rtt: Duration,
    /// Fixed retransmission timeout; `None` derives it from measured RTT.
    pub retransmission_timeout: Option<Duration>,
}

impl Default for Agreement {
    fn default() -> Self {
        Self {
            max_transmissions: 64,
            minimum_rtt: Duration::from_millis(10),
            retransmission_timeout: None,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Datagrams queued for the wire.
    pub packets_sent: AtomicU64,
    /// Datagrams accepted by `process_receive`.
    pub packets_received: AtomicU64,
    /// Datagrams dropped without processing.
    pub packets_dropped: AtomicU64,
}

struct ConnCrypto {
    embryo: Embryo,
    pool: CipherPool,
}

impl ConnCrypto {
    fn new(embryo: Embryo) -> Self {
        let pool = CipherPool::new(embryo.key);
        Self { embryo, pool }
    }
}

/// Completion handle for one send transmission.
pub struct SendHandle {
    /// Transmission id assigned to the send.
    pub transmission_id: u32,
    done: oneshot::Receiver<()>,
}

impl SendHandle {
    /// Waits until every gene is acknowledged. Errors if the connection
    /// closes first.
    pub async fn finished(self) -> TransportResult<()> {
        self.done.await.map_err(|_| TransportError::Closed)
    }
}

struct SendEntry {
    transmission: SendTransmission,
    done: Option<oneshot::Sender<()>>,
}

/// Bounded log of delivered inbound transmissions, so a late duplicate can
/// be re-acked instead of re-delivered.
#[derive(Default)]
struct DeliveredLog {
    totals: HashMap<u32, u32>,
    order: VecDeque<u32>,
}

impl DeliveredLog {
    fn retire(&mut self, id: u32, total_genes: u32) {
        if self.totals.insert(id, total_genes).is_none() {
            self.order.push_back(id);
            if self.order.len() > TOMBSTONE_LIMIT {
                if let Some(oldest) = self.order.pop_front() {
                    self.totals.remove(&oldest);
                }
            }
        }
    }

    fn total_genes(&self, id: u32) -> Option<u32> {
        self.totals.get(&id).copied()
    }
}

/// Mints a random non-zero transmission id unused by the live sends.
fn mint_transmission_id(sends: &HashMap<u32, SendEntry>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u32 = rng.gen();
        if candidate != 0 && !sends.contains_key(&candidate) {
            return candidate;
        }
    }
}

/// One encrypted channel to a peer.
pub struct Connection {
    connection_id: u64,
    engagement: u16,
    agreement: Agreement,
    crypto: Mutex<Option<Arc<ConnCrypto>>>,
    /// Kept between the client hello and the server's response.
    pending_secret: Mutex<Option<StaticSecret>>,
    sends: Mutex<HashMap<u32, SendEntry>>,
    receives: Mutex<HashMap<u32, ReceiveTransmission>>,
    delivered_log: Mutex<DeliveredLog>,
    congestion: Mutex<(CubicCongestion, RttEstimator)>,
    outgoing: Mutex<VecDeque<Vec<u8>>>,
    slot_notify: Notify,
    cancel: CancelToken,
    closed: AtomicBool,
    /// Statistics counters.
    pub stats: ConnectionStats,
}

impl Connection {
    fn new(connection_id: u64, engagement: u16, agreement: Agreement, now: Instant) -> Self {
        Self {
            connection_id,
            engagement,
            agreement,
            crypto: Mutex::new(None),
            pending_secret: Mutex::new(None),
            sends: Mutex::new(HashMap::new()),
            receives: Mutex::new(HashMap::new()),
            delivered_log: Mutex::new(DeliveredLog::default()),
            congestion: Mutex::new((CubicCongestion::new(now), RttEstimator::new())),
            outgoing: Mutex::new(VecDeque::new()),
            slot_notify: Notify::new(),
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            stats: ConnectionStats::default(),
        }
    }

    /// Starts a client-side connection: returns it plus the connect packet
    /// to send. The connection is unusable until
    /// [`Connection::client_complete`] consumes the server's response.
    pub fn client_connect(
        connection_id: u64,
        engagement: u16,
        agreement: Agreement,
        now: Instant,
    ) -> (Self, Vec<u8>) {
        let connection = Self::new(connection_id, engagement, agreement, now);
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let packet = create_handshake_packet(
            PacketType::Connect,
            engagement,
            connection_id,
            public.as_bytes(),
        );
        *connection.pending_secret.lock() = Some(secret);
        connection.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        (connection, packet)
    }

    /// Accepts a client's connect packet server-side: returns the
    /// established connection plus the response packet. `None` means the
    /// datagram was not a valid connect and is dropped.
    pub fn server_accept(
        datagram: &[u8],
        agreement: Agreement,
        now: Instant,
    ) -> Option<(Self, Vec<u8>)> {
        let (header, body) = PacketHeader::decode(datagram)?;
        if header.packet_type != PacketType::Connect || body.len() != 32 {
            return None;
        }
        let client_public = PublicKey::from(<[u8; 32]>::try_from(body).ok()?);
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);

        let connection = Self::new(header.connection_id, header.engagement, agreement, now);
        let embryo = Embryo::from_ecdh(&secret, &client_public, header.connection_id);
        *connection.crypto.lock() = Some(Arc::new(ConnCrypto::new(embryo)));

        let response = create_handshake_packet(
            PacketType::ConnectResponse,
            header.engagement,
            header.connection_id,
            public.as_bytes(),
        );
        connection.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = header.connection_id, "connection accepted");
        Some((connection, response))
    }

    /// Consumes the server's connect response client-side, deriving the
    /// session keys. `false` means the datagram was not the expected
    /// response and was dropped.
    pub fn client_complete(&self, datagram: &[u8]) -> bool {
        let Some((header, body)) = PacketHeader::decode(datagram) else {
            return false;
        };
        if header.packet_type != PacketType::ConnectResponse
            || header.connection_id != self.connection_id
            || body.len() != 32
        {
            return false;
        }
        let Ok(bytes) = <[u8; 32]>::try_from(body) else {
            return false;
        };
        let server_public = PublicKey::from(bytes);
        let Some(secret) = self.pending_secret.lock().take() else {
            return false;
        };
        let embryo = Embryo::from_ecdh(&secret, &server_public, self.connection_id);
        *self.crypto.lock() = Some(Arc::new(ConnCrypto::new(embryo)));
        debug!(connection_id = self.connection_id, "connection established");
        true
    }

    /// Connection id.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether the handshake finished and the connection is open.
    pub fn is_established(&self) -> bool {
        !self.is_closed() && self.crypto.lock().is_some()
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelling slot waits on this connection.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn crypto(&self) -> TransportResult<Arc<ConnCrypto>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.crypto.lock().clone().ok_or(TransportError::Closed)
    }

    fn rtt_hint(&self) -> u32 {
        let congestion = self.congestion.lock();
        congestion.1.smoothed().as_micros().min(u128::from(u32::MAX)) as u32
    }

    /// Waits for a free send slot and registers the built transmission
    /// under a random unique id, atomically with the capacity check.
    /// Honors the cancellation token and connection close; re-checks a
    /// full table on a pulse.
    async fn register_send(
        &self,
        build: impl Fn(u32) -> TransportResult<SendTransmission>,
    ) -> TransportResult<(u32, oneshot::Receiver<()>)> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Canceled);
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            {
                let mut sends = self.sends.lock();
                if sends.len() < self.agreement.max_transmissions {
                    let id = mint_transmission_id(&sends);
                    let transmission = build(id)?;
                    let (tx, rx) = oneshot::channel();
                    sends.insert(
                        id,
                        SendEntry {
                            transmission,
                            done: Some(tx),
                        },
                    );
                    return Ok((id, rx));
                }
            }
            let _ = tokio::time::timeout(SLOT_PULSE, self.slot_notify.notified()).await;
        }
    }

    /// Queues a block (or Rama) send. Awaits a free transmission slot, then
    /// registers the transmission and packetizes what the current budget
    /// allows. The returned handle resolves when the peer acked every gene.
    pub async fn send_block(
        &self,
        data_kind: u32,
        data_id: u64,
        payload: &[u8],
        now: Instant,
    ) -> TransportResult<SendHandle> {
        self.crypto()?;
        let rtt_hint = self.rtt_hint();
        let (id, rx) = self
            .register_send(|id| {
                SendTransmission::new_block(id, payload, rtt_hint, data_kind, data_id, now)
            })
            .await?;
        self.process_tick(now)?;
        Ok(SendHandle {
            transmission_id: id,
            done: rx,
        })
    }

    /// Opens a stream send announcing `max_length` bytes. Data follows via
    /// [`Connection::append_stream`] and [`Connection::finish_stream`]; the
    /// returned handle resolves once the finished stream is fully acked.
    pub async fn open_stream(
        &self,
        data_kind: u32,
        data_id: u64,
        max_length: u64,
        now: Instant,
    ) -> TransportResult<SendHandle> {
        self.crypto()?;
        let rtt_hint = self.rtt_hint();
        let (id, rx) = self
            .register_send(|id| {
                Ok(SendTransmission::new_stream(
                    id, max_length, rtt_hint, data_kind, data_id, now,
                ))
            })
            .await?;
        self.process_tick(now)?;
        Ok(SendHandle {
            transmission_id: id,
            done: rx,
        })
    }

    /// Appends stream data, one gene at a time. While the stream's send
    /// window is exhausted the call waits with exponential backoff;
    /// cancellation or close aborts the wait.
    pub async fn append_stream(
        &self,
        transmission_id: u32,
        data: &[u8],
        now: Instant,
    ) -> TransportResult<()> {
        let mut backoff = STREAM_BACKOFF_START;
        let mut offset = 0;
        while offset < data.len() {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Canceled);
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let appended = {
                let mut sends = self.sends.lock();
                let entry = sends
                    .get_mut(&transmission_id)
                    .ok_or(TransportError::Closed)?;
                if entry.transmission.stream_window_open() {
                    let end = (offset + FOLLOWING_GENE_CAPACITY).min(data.len());
                    entry.transmission.append(&data[offset..end])?;
                    offset = end;
                    true
                } else {
                    false
                }
            };
            if appended {
                backoff = STREAM_BACKOFF_START;
            } else {
                trace!(transmission_id, "stream window exhausted, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(STREAM_BACKOFF_CAP);
            }
        }
        self.process_tick(now)?;
        Ok(())
    }

    /// Marks a stream fully appended; its handle resolves once every gene
    /// is acked.
    pub fn finish_stream(&self, transmission_id: u32) {
        if let Some(entry) = self.sends.lock().get_mut(&transmission_id) {
            entry.transmission.complete_stream();
        }
    }

    /// Packetizes due genes across all send transmissions and emits due
    /// acks. Never-sent genes go out in serial order; timed-out genes are
    /// resent within the same budget pass.
    pub fn process_tick(&self, now: Instant) -> TransportResult<()> {
        let crypto = self.crypto()?;
        let mut frames: Vec<bytes::Bytes> = Vec::new();
        {
            let mut sends = self.sends.lock();
            let active = sends.len();
            let (budget, rto, minimum_rtt) = {
                let mut congestion = self.congestion.lock();
                let (ref mut cc, ref rtt) = *congestion;
                cc.advance_capacity(now, rtt);
                let in_flight: usize = sends
                    .values()
                    .filter(|entry| entry.transmission.congestion_controlled())
                    .map(|entry| entry.transmission.genes_in_flight())
                    .sum();
                let budget = if active < CONGESTION_ENABLE_THRESHOLD {
                    usize::MAX
                } else {
                    cc.send_budget(in_flight)
                };
                let rto = self
                    .agreement
                    .retransmission_timeout
                    .unwrap_or_else(|| rtt.retransmission_timeout());
                let minimum_rtt = rtt.minimum().max(self.agreement.minimum_rtt);
                (budget, rto, minimum_rtt)
            };

            let mut remaining = budget;
            for entry in sends.values_mut() {
                let uncapped = !entry.transmission.congestion_controlled();
                let slice = if uncapped { usize::MAX } else { remaining };
                let collected = entry.transmission.collect_sendable(slice, now, rto, minimum_rtt);
                if !uncapped {
                    remaining = remaining.saturating_sub(collected.len());
                }
                frames.extend(collected);
            }
        }

        {
            let mut receives = self.receives.lock();
            for receive in receives.values_mut() {
                if receive.ack_due(now) {
                    frames.push(receive.take_ack().encode());
                }
            }
            // delivered and fully acked entries retire into the tombstone
            // log so late duplicates get a re-ack, not fresh state
            let retired: Vec<u32> = receives
                .iter()
                .filter(|(_, receive)| receive.delivered() && !receive.ack_pending())
                .map(|(id, _)| *id)
                .collect();
            if !retired.is_empty() {
                let mut log = self.delivered_log.lock();
                for id in retired {
                    if let Some(receive) = receives.remove(&id) {
                        log.retire(id, receive.successive_position());
                        trace!(transmission_id = id, "inbound transmission retired");
                    }
                }
            }
        }

        let mut outgoing = self.outgoing.lock();
        for frame in frames {
            outgoing.push_back(create_packet(
                &crypto.pool,
                &crypto.embryo,
                self.engagement,
                self.connection_id,
                &frame,
            ));
            self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Feeds one inbound datagram. Malformed, undecryptable, or misdirected
    /// packets are dropped silently; recovery is the sender's resend path.
    /// Returns a reassembled block or the next stream chunk when this
    /// datagram produced one.
    pub fn process_receive(&self, datagram: &[u8], now: Instant) -> Option<ReceiveEvent> {
        let Some((header, body)) = PacketHeader::decode(datagram) else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if header.connection_id != self.connection_id
            || header.packet_type != PacketType::Sealed
            || self.is_closed()
        {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if body.is_empty() {
            // bare header is the close signal
            debug!(connection_id = self.connection_id, "close signal received");
            self.shutdown();
            return None;
        }
        let crypto = self.crypto.lock().clone()?;
        let Some(plain) = decrypt_frame(&crypto.pool, &crypto.embryo, header.salt, body) else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(connection_id = self.connection_id, "undecryptable packet dropped");
            return None;
        };
        let Some(frame) = Frame::decode(&plain) else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);

        match frame {
            Frame::First(first) => {
                let id = first.transmission_id;
                if self.reack_if_retired(&crypto, id) {
                    return None;
                }
                let mut receives = self.receives.lock();
                let receive = receives
                    .entry(id)
                    .or_insert_with(|| ReceiveTransmission::new(id));
                receive.on_first(first, now)
            }
            Frame::Following(following) => {
                let id = following.transmission_id;
                if self.reack_if_retired(&crypto, id) {
                    return None;
                }
                let mut receives = self.receives.lock();
                let receive = receives
                    .entry(id)
                    .or_insert_with(|| ReceiveTransmission::new(id));
                receive.on_following(following, now)
            }
            Frame::Ack(ack) => {
                self.process_ack(ack, now);
                None
            }
        }
    }

    /// Re-acks a gene for an already retired transmission so the sender can
    /// dispose it. Returns whether the gene was handled here.
    fn reack_if_retired(&self, crypto: &ConnCrypto, transmission_id: u32) -> bool {
        let Some(total) = self.delivered_log.lock().total_genes(transmission_id) else {
            return false;
        };
        let ack = AckFrame {
            transmission_id,
            pairs: vec![(0, total)],
        };
        self.outgoing.lock().push_back(create_packet(
            &crypto.pool,
            &crypto.embryo,
            self.engagement,
            self.connection_id,
            &ack.encode(),
        ));
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        trace!(transmission_id, "late duplicate re-acked");
        true
    }

    fn process_ack(&self, ack: crate::gene::AckFrame, now: Instant) {
        let mut resend_frames: Vec<bytes::Bytes> = Vec::new();
        let mut completed = false;
        {
            let mut sends = self.sends.lock();
            let Some(entry) = sends.get_mut(&ack.transmission_id) else {
                // ack for a transmission already disposed
                return;
            };
            let outcome = {
                let mut congestion = self.congestion.lock();
                let (ref mut cc, ref mut rtt) = *congestion;
                let outcome = entry.transmission.process_ack(&ack, now, rtt);
                if entry.transmission.congestion_controlled() {
                    for _ in 0..outcome.newly_acked {
                        cc.on_ack(now, rtt);
                    }
                    if outcome.loss_event {
                        cc.on_loss(now);
                    }
                }
                outcome
            };
            for serial in &outcome.resend {
                if let Some(frame) = entry.transmission.frame_for(*serial) {
                    resend_frames.push(frame);
                }
            }
            if outcome.completed {
                if let Some(done) = entry.done.take() {
                    let _ = done.send(());
                }
                sends.remove(&ack.transmission_id);
                completed = true;
            }
        }
        if completed {
            self.slot_notify.notify_waiters();
        }
        if !resend_frames.is_empty() {
            if let Ok(crypto) = self.crypto() {
                let mut outgoing = self.outgoing.lock();
                for frame in resend_frames {
                    outgoing.push_back(create_packet(
                        &crypto.pool,
                        &crypto.embryo,
                        self.engagement,
                        self.connection_id,
                        &frame,
                    ));
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Next queued outbound datagram, if any.
    pub fn poll_outgoing(&self) -> Option<Vec<u8>> {
        self.outgoing.lock().pop_front()
    }

    /// Closes the connection: queues the bare-header close signal and drops
    /// all transmission state. Pending send handles resolve with `Closed`.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.outgoing
            .lock()
            .push_back(create_close_packet(self.engagement, self.connection_id));
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.shutdown();
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let dropped = {
            let mut sends = self.sends.lock();
            let count = sends.len();
            sends.clear();
            count
        };
        if dropped > 0 {
            warn!(
                connection_id = self.connection_id,
                dropped, "connection closed with sends in flight"
            );
        }
        self.receives.lock().clear();
        self.slot_notify.notify_waiters();
    }

    /// Number of active send transmissions.
    pub fn active_sends(&self) -> usize {
        self.sends.lock().len()
    }

    /// Number of resident inbound transmissions.
    pub fn active_receives(&self) -> usize {
        self.receives.lock().len()
    }

    /// Current congestion controller readings.
    pub fn congestion_stats(&self) -> crate::congestion::CongestionStats {
        self.congestion.lock().0.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::ReceivedBlock;

    fn pair(now: Instant) -> (Connection, Connection) {
        let (client, hello) = Connection::client_connect(7, 0, Agreement::default(), now);
        let (server, response) =
            Connection::server_accept(&hello, Agreement::default(), now).expect("valid hello");
        assert!(client.client_complete(&response));
        assert!(client.is_established());
        assert!(server.is_established());
        (client, server)
    }

    /// Moves every queued datagram from one side into the other.
    fn pump(from: &Connection, to: &Connection, now: Instant) -> Vec<ReceiveEvent> {
        let mut events = Vec::new();
        while let Some(datagram) = from.poll_outgoing() {
            if let Some(event) = to.process_receive(&datagram, now) {
                events.push(event);
            }
        }
        events
    }

    fn blocks(events: Vec<ReceiveEvent>) -> Vec<ReceivedBlock> {
        events
            .into_iter()
            .map(|event| match event {
                ReceiveEvent::Block(block) => block,
                other => panic!("expected block, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_handshake_keys_agree() {
        let now = Instant::now();
        let (client, server) = pair(now);
        assert_eq!(client.connection_id(), server.connection_id());
        assert!(client.congestion_stats().cwnd > 0.0);
    }

    #[test]
    fn test_server_rejects_garbage_hello() {
        let now = Instant::now();
        assert!(Connection::server_accept(&[0u8; 10], Agreement::default(), now).is_none());
        assert!(Connection::server_accept(&[0u8; 40], Agreement::default(), now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_delivery_end_to_end() {
        let now = Instant::now();
        let (client, server) = pair(now);
        let payload: Vec<u8> = (0..20_000).map(|i| (i % 255) as u8).collect();

        let handle = client.send_block(4, 99, &payload, now).await.unwrap();
        let blocks = blocks(pump(&client, &server, now));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].payload, payload);
        assert_eq!(blocks[0].data_kind, 4);
        assert_eq!(blocks[0].data_id, 99);

        // receiver acks after the delay tick; acks flow back and complete
        let later = now + Duration::from_millis(30);
        server.process_tick(later).unwrap();
        pump(&server, &client, later);
        handle.finished().await.unwrap();
        assert_eq!(client.active_sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_packet_silently_dropped() {
        let now = Instant::now();
        let (client, server) = pair(now);
        client.send_block(0, 0, b"hello", now).await.unwrap();

        let mut datagram = client.poll_outgoing().unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;
        assert!(server.process_receive(&datagram, now).is_none());
        assert_eq!(server.stats.packets_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_packet_recovered_by_rto() {
        let now = Instant::now();
        let (client, server) = pair(now);
        let handle = client.send_block(0, 0, b"resend me", now).await.unwrap();

        // drop the only datagram on the floor
        assert!(client.poll_outgoing().is_some());
        assert!(client.poll_outgoing().is_none());

        let later = now + Duration::from_millis(700);
        client.process_tick(later).unwrap();
        let blocks = blocks(pump(&client, &server, later));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].payload.as_ref(), b"resend me");

        let ack_time = later + Duration::from_millis(30);
        server.process_tick(ack_time).unwrap();
        pump(&server, &client, ack_time);
        handle.finished().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_signal_shuts_peer() {
        let now = Instant::now();
        let (client, server) = pair(now);
        client.close();
        pump(&client, &server, now);
        assert!(server.is_closed());
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_on_closed_connection_fails() {
        let now = Instant::now();
        let (client, server) = pair(now);
        drop(server);
        client.close();
        let result = client.send_block(0, 0, b"x", now).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_resolves_pending_handle_with_error() {
        let now = Instant::now();
        let (client, _server) = pair(now);
        let handle = client.send_block(0, 0, b"never acked", now).await.unwrap();
        client.close();
        assert!(matches!(handle.finished().await, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_wait_respects_cancel() {
        let now = Instant::now();
        let agreement = Agreement {
            max_transmissions: 1,
            ..Agreement::default()
        };
        let (client, hello) = Connection::client_connect(9, 0, agreement, now);
        let (_server, response) =
            Connection::server_accept(&hello, Agreement::default(), now).unwrap();
        client.client_complete(&response);

        let client = Arc::new(client);
        let _held = client.send_block(0, 0, b"slot holder", now).await.unwrap();

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_block(0, 0, b"queued", now).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.cancel_token().cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_datagrams_deliver_once() {
        let now = Instant::now();
        let (client, server) = pair(now);
        client.send_block(0, 0, b"once", now).await.unwrap();
        let datagram = client.poll_outgoing().unwrap();

        assert!(server.process_receive(&datagram, now).is_some());
        assert!(server.process_receive(&datagram, now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_misdirected_connection_id_dropped() {
        let now = Instant::now();
        let (client, server) = pair(now);
        let (other, hello) = Connection::client_connect(8888, 0, Agreement::default(), now);
        let (_other_server, response) =
            Connection::server_accept(&hello, Agreement::default(), now).unwrap();
        other.client_complete(&response);
        other.send_block(0, 0, b"wrong door", now).await.unwrap();

        let datagram = other.poll_outgoing().unwrap();
        assert!(server.process_receive(&datagram, now).is_none());
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_state_pruned_after_delivery() {
        let now = Instant::now();
        let (client, server) = pair(now);
        for i in 0..3 {
            let handle = client.send_block(0, i, b"short lived", now).await.unwrap();
            pump(&client, &server, now);
            let later = now + Duration::from_millis(30);
            server.process_tick(later).unwrap();
            pump(&server, &client, later);
            handle.finished().await.unwrap();
        }
        // delivered transmissions do not stay resident
        assert_eq!(server.active_receives(), 0);
        assert_eq!(client.active_sends(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_duplicate_reacked_not_redelivered() {
        let now = Instant::now();
        let (client, server) = pair(now);
        client.send_block(0, 0, b"once", now).await.unwrap();
        let datagram = client.poll_outgoing().unwrap();

        assert!(server.process_receive(&datagram, now).is_some());
        let later = now + Duration::from_millis(30);
        server.process_tick(later).unwrap();
        pump(&server, &client, later);
        assert_eq!(server.active_receives(), 0);

        // a late duplicate re-acks without recreating receive state
        assert!(server.process_receive(&datagram, later).is_none());
        assert_eq!(server.active_receives(), 0);
        assert!(server.poll_outgoing().is_some(), "re-ack queued");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmission_ids_random_unique() {
        let now = Instant::now();
        let (client, _server) = pair(now);
        let mut ids = Vec::new();
        for i in 0..32 {
            let handle = client.send_block(0, i, b"id check", now).await.unwrap();
            ids.push(handle.transmission_id);
        }
        assert!(ids.iter().all(|&id| id != 0));
        let unique: std::collections::HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        // minted ids do not form a sequential counter
        assert!(ids.windows(2).any(|w| w[1] != w[0].wrapping_add(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_senders_respect_slot_cap() {
        let now = Instant::now();
        let agreement = Agreement {
            max_transmissions: 2,
            ..Agreement::default()
        };
        let (client, hello) = Connection::client_connect(11, 0, agreement, now);
        let (_server, response) =
            Connection::server_accept(&hello, Agreement::default(), now).unwrap();
        client.client_complete(&response);
        let client = Arc::new(client);

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let client = Arc::clone(&client);
            waiters.push(tokio::spawn(async move {
                client.send_block(0, 0, b"contended", now).await.map(|_| ())
            }));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        // the cap holds no matter how the racers interleave
        assert_eq!(client.active_sends(), 2);

        client.cancel_token().cancel();
        let mut cancelled = 0;
        for waiter in waiters {
            if matches!(waiter.await.unwrap(), Err(TransportError::Canceled)) {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_to_end() {
        let now = Instant::now();
        let (client, server) = pair(now);
        let handle = client.open_stream(2, 5, 16, now).await.unwrap();
        let sid = handle.transmission_id;
        client.append_stream(sid, b"stream 16 bytes!", now).await.unwrap();
        client.finish_stream(sid);
        client.process_tick(now).unwrap();

        let events = pump(&client, &server, now);
        let mut data = Vec::new();
        let mut finished = false;
        for event in &events {
            match event {
                ReceiveEvent::Stream(chunk) => {
                    data.extend_from_slice(&chunk.payload);
                    finished = chunk.finished;
                }
                other => panic!("expected stream chunk, got {other:?}"),
            }
        }
        assert_eq!(data, b"stream 16 bytes!");
        assert!(finished);

        let later = now + Duration::from_millis(30);
        server.process_tick(later).unwrap();
        pump(&server, &client, later);
        handle.finished().await.unwrap();
        assert_eq!(client.active_sends(), 0);
        assert_eq!(server.active_receives(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_append_cancelled_during_backoff() {
        let now = Instant::now();
        let (client, _server) = pair(now);
        let client = Arc::new(client);
        let handle = client.open_stream(0, 0, 1 << 20, now).await.unwrap();
        let sid = handle.transmission_id;

        // fill the send window so the next append has to wait
        let fill = vec![0u8; 63 * FOLLOWING_GENE_CAPACITY];
        client.append_stream(sid, &fill, now).await.unwrap();

        let blocked = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.append_stream(sid, b"blocked", now).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.cancel_token().cancel();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(TransportError::Canceled)));
    }
}
