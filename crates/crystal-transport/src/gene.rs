//! Genes: packet-sized fragments of a logical send, and their frame codecs.
//!
//! First-gene frame, little-endian:
//! `[2B frame type][2B mode][4B transmission id][4B rtt hint]`
//! `[4B total genes | 8B max stream length][4B data kind][8B data id][payload]`.
//! Following-gene frame: `[2B frame type][4B transmission id][4B position][payload]`.
//! Ack frame: `[2B frame type][4B transmission id][2B pair count][4B start, 4B end]*`.

use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

/// Plaintext frame budget per packet, leaving room for the packet header,
/// CBC padding and the UDP/IP overhead within [`crate::packet::MAX_PACKET_SIZE`].
pub const FRAME_BUDGET: usize = 1376;

/// First-gene header size in block mode.
pub const FIRST_GENE_HEADER: usize = 2 + 2 + 4 + 4 + 4 + 4 + 8;
/// First-gene header size in stream mode (8-byte max length field).
pub const FIRST_GENE_HEADER_STREAM: usize = 2 + 2 + 4 + 4 + 8 + 4 + 8;
/// Following-gene header size.
pub const FOLLOWING_GENE_HEADER: usize = 2 + 4 + 4;

/// Payload capacity of the first gene of a block.
pub const FIRST_GENE_CAPACITY: usize = FRAME_BUDGET - FIRST_GENE_HEADER;
/// Payload capacity of every following gene.
pub const FOLLOWING_GENE_CAPACITY: usize = FRAME_BUDGET - FOLLOWING_GENE_HEADER;

/// Total genes for a block of `size` bytes. Computed once at send time and
/// fixed for the transmission's lifetime.
pub fn total_genes(size: usize) -> u32 {
    if size <= FIRST_GENE_CAPACITY {
        1
    } else {
        let rest = size - FIRST_GENE_CAPACITY;
        1 + rest.div_ceil(FOLLOWING_GENE_CAPACITY) as u32
    }
}

/// Frame types inside the encrypted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// First gene of a transmission, with metadata header.
    FirstGene = 1,
    /// Any later gene, pure payload.
    FollowingGene = 2,
    /// Acknowledgement ranges.
    Ack = 3,
}

impl FrameType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FrameType::FirstGene),
            2 => Some(FrameType::FollowingGene),
            3 => Some(FrameType::Ack),
            _ => None,
        }
    }
}

/// Wire form of a transmission's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WireMode {
    /// Small transfer, at most three genes, acked as a unit.
    Rama = 1,
    /// Fixed-size multi-gene transfer under congestion control.
    Block = 2,
    /// Incrementally appended transfer with flow control.
    Stream = 3,
}

impl WireMode {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(WireMode::Rama),
            2 => Some(WireMode::Block),
            3 => Some(WireMode::Stream),
            _ => None,
        }
    }
}

/// Size information carried by a first gene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneExtent {
    /// Fixed total gene count (Rama and Block).
    Genes(u32),
    /// Maximum stream length in bytes (Stream).
    StreamLength(u64),
}

/// Decoded first-gene frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstGeneFrame {
    /// Transmission mode.
    pub mode: WireMode,
    /// Transmission id, unique per connection.
    pub transmission_id: u32,
    /// Sender's smoothed RTT hint in microseconds.
    pub rtt_hint: u32,
    /// Total size information.
    pub extent: GeneExtent,
    /// Application data kind.
    pub data_kind: u32,
    /// Application data id.
    pub data_id: u64,
    /// First slice of the payload.
    pub payload: Bytes,
}

impl FirstGeneFrame {
    /// Encodes the frame.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(FIRST_GENE_HEADER_STREAM + self.payload.len());
        out.put_u16_le(FrameType::FirstGene as u16);
        out.put_u16_le(self.mode as u16);
        out.put_u32_le(self.transmission_id);
        out.put_u32_le(self.rtt_hint);
        match self.extent {
            GeneExtent::Genes(total) => out.put_u32_le(total),
            GeneExtent::StreamLength(len) => out.put_u64_le(len),
        }
        out.put_u32_le(self.data_kind);
        out.put_u64_le(self.data_id);
        out.put_slice(&self.payload);
        out.freeze()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < FIRST_GENE_HEADER {
            return None;
        }
        let mode = WireMode::from_u16(u16::from_le_bytes(frame[2..4].try_into().ok()?))?;
        let transmission_id = u32::from_le_bytes(frame[4..8].try_into().ok()?);
        let rtt_hint = u32::from_le_bytes(frame[8..12].try_into().ok()?);
        let (extent, after) = match mode {
            WireMode::Stream => {
                if frame.len() < FIRST_GENE_HEADER_STREAM {
                    return None;
                }
                (
                    GeneExtent::StreamLength(u64::from_le_bytes(frame[12..20].try_into().ok()?)),
                    20,
                )
            }
            _ => (
                GeneExtent::Genes(u32::from_le_bytes(frame[12..16].try_into().ok()?)),
                16,
            ),
        };
        let data_kind = u32::from_le_bytes(frame[after..after + 4].try_into().ok()?);
        let data_id = u64::from_le_bytes(frame[after + 4..after + 12].try_into().ok()?);
        Some(Self {
            mode,
            transmission_id,
            rtt_hint,
            extent,
            data_kind,
            data_id,
            payload: Bytes::copy_from_slice(&frame[after + 12..]),
        })
    }
}

/// Decoded following-gene frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowingGeneFrame {
    /// Transmission id.
    pub transmission_id: u32,
    /// Gene serial within the transmission (the first gene is serial 0).
    pub position: u32,
    /// Payload slice.
    pub payload: Bytes,
}

impl FollowingGeneFrame {
    /// Encodes the frame.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(FOLLOWING_GENE_HEADER + self.payload.len());
        out.put_u16_le(FrameType::FollowingGene as u16);
        out.put_u32_le(self.transmission_id);
        out.put_u32_le(self.position);
        out.put_slice(&self.payload);
        out.freeze()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < FOLLOWING_GENE_HEADER {
            return None;
        }
        Some(Self {
            transmission_id: u32::from_le_bytes(frame[2..6].try_into().ok()?),
            position: u32::from_le_bytes(frame[6..10].try_into().ok()?),
            payload: Bytes::copy_from_slice(&frame[10..]),
        })
    }
}

/// Decoded ack frame: inclusive-exclusive acknowledged ranges. The receiver
/// always reports its contiguous prefix from serial 0 as the first pair, so
/// the sender can read the successive received position from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Transmission id being acknowledged.
    pub transmission_id: u32,
    /// `(start, end)` serial ranges, end exclusive.
    pub pairs: Vec<(u32, u32)>,
}

impl AckFrame {
    /// Encodes the frame.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.pairs.len() * 8);
        out.put_u16_le(FrameType::Ack as u16);
        out.put_u32_le(self.transmission_id);
        out.put_u16_le(self.pairs.len() as u16);
        for (start, end) in &self.pairs {
            out.put_u32_le(*start);
            out.put_u32_le(*end);
        }
        out.freeze()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < 8 {
            return None;
        }
        let transmission_id = u32::from_le_bytes(frame[2..6].try_into().ok()?);
        let count = u16::from_le_bytes(frame[6..8].try_into().ok()?) as usize;
        if frame.len() < 8 + count * 8 {
            return None;
        }
        let mut pairs = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * 8;
            pairs.push((
                u32::from_le_bytes(frame[at..at + 4].try_into().ok()?),
                u32::from_le_bytes(frame[at + 4..at + 8].try_into().ok()?),
            ));
        }
        Some(Self {
            transmission_id,
            pairs,
        })
    }

    /// The successive received position: the end of the contiguous-from-zero
    /// range, zero if the receiver has no prefix yet.
    pub fn successive_position(&self) -> u32 {
        self.pairs
            .iter()
            .find(|(start, _)| *start == 0)
            .map(|(_, end)| *end)
            .unwrap_or(0)
    }
}

/// Any decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First gene with metadata.
    First(FirstGeneFrame),
    /// Following gene.
    Following(FollowingGeneFrame),
    /// Acknowledgement.
    Ack(AckFrame),
}

impl Frame {
    /// Decodes a plaintext frame. `None` means drop the packet.
    pub fn decode(frame: &[u8]) -> Option<Frame> {
        if frame.len() < 2 {
            return None;
        }
        match FrameType::from_u16(u16::from_le_bytes(frame[..2].try_into().ok()?))? {
            FrameType::FirstGene => FirstGeneFrame::decode(frame).map(Frame::First),
            FrameType::FollowingGene => FollowingGeneFrame::decode(frame).map(Frame::Following),
            FrameType::Ack => AckFrame::decode(frame).map(Frame::Ack),
        }
    }
}

/// Per-gene send state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGeneState {
    /// Built but never put on the wire.
    Initial,
    /// Sent at least once.
    Sent,
    /// Resent by the RTO path.
    Resent,
    /// Resent by packet-threshold loss detection.
    LossDetected,
}

/// One outbound gene and its transmission state.
#[derive(Debug, Clone)]
pub struct SendGene {
    /// Gene serial within the transmission.
    pub serial: u32,
    /// Encoded plaintext frame, ready for packetization.
    pub frame: Bytes,
    /// Send state.
    pub state: SendGeneState,
    /// When the gene was first sent.
    pub first_sent: Option<Instant>,
    /// When the gene was last sent or resent.
    pub last_sent: Option<Instant>,
}

impl SendGene {
    /// Creates a gene in the `Initial` state.
    pub fn new(serial: u32, frame: Bytes) -> Self {
        Self {
            serial,
            frame,
            state: SendGeneState::Initial,
            first_sent: None,
            last_sent: None,
        }
    }

    /// Marks the gene sent.
    pub fn mark_sent(&mut self, now: Instant) {
        if self.first_sent.is_none() {
            self.first_sent = Some(now);
            self.state = SendGeneState::Sent;
        }
        self.last_sent = Some(now);
    }

    /// Marks a resend, recording how it was triggered.
    pub fn mark_resent(&mut self, now: Instant, loss_detected: bool) {
        self.state = if loss_detected {
            SendGeneState::LossDetected
        } else {
            SendGeneState::Resent
        };
        self.last_sent = Some(now);
    }

    /// Whether the gene was ever resent. Resent genes never contribute RTT
    /// samples (Karn's algorithm).
    pub fn ever_resent(&self) -> bool {
        matches!(
            self.state,
            SendGeneState::Resent | SendGeneState::LossDetected
        )
    }

    /// Resend suppression: at most one send per minimum RTT.
    pub fn can_resend(&self, minimum_rtt: Duration, now: Instant) -> bool {
        match self.last_sent {
            Some(last) => now.duration_since(last) > minimum_rtt,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_genes_formula() {
        assert_eq!(total_genes(0), 1);
        assert_eq!(total_genes(FIRST_GENE_CAPACITY), 1);
        assert_eq!(total_genes(FIRST_GENE_CAPACITY + 1), 2);
        assert_eq!(
            total_genes(FIRST_GENE_CAPACITY + FOLLOWING_GENE_CAPACITY),
            2
        );
        assert_eq!(
            total_genes(FIRST_GENE_CAPACITY + FOLLOWING_GENE_CAPACITY + 1),
            3
        );
    }

    #[test]
    fn test_first_gene_block_round_trip() {
        let frame = FirstGeneFrame {
            mode: WireMode::Block,
            transmission_id: 9,
            rtt_hint: 1500,
            extent: GeneExtent::Genes(12),
            data_kind: 3,
            data_id: 0xFEED,
            payload: Bytes::from_static(b"first slice"),
        };
        let encoded = frame.encode();
        match Frame::decode(&encoded).unwrap() {
            Frame::First(decoded) => assert_eq!(decoded, frame),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_first_gene_stream_round_trip() {
        let frame = FirstGeneFrame {
            mode: WireMode::Stream,
            transmission_id: 1,
            rtt_hint: 0,
            extent: GeneExtent::StreamLength(1 << 33),
            data_kind: 0,
            data_id: 0,
            payload: Bytes::from_static(b"s"),
        };
        let encoded = frame.encode();
        match Frame::decode(&encoded).unwrap() {
            Frame::First(decoded) => assert_eq!(decoded.extent, GeneExtent::StreamLength(1 << 33)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_following_gene_round_trip() {
        let frame = FollowingGeneFrame {
            transmission_id: 4,
            position: 17,
            payload: Bytes::from_static(b"chunk"),
        };
        match Frame::decode(&frame.encode()).unwrap() {
            Frame::Following(decoded) => assert_eq!(decoded, frame),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ack_round_trip_and_successive() {
        let frame = AckFrame {
            transmission_id: 2,
            pairs: vec![(0, 5), (7, 9)],
        };
        match Frame::decode(&frame.encode()).unwrap() {
            Frame::Ack(decoded) => {
                assert_eq!(decoded, frame);
                assert_eq!(decoded.successive_position(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ack_without_prefix() {
        let frame = AckFrame {
            transmission_id: 2,
            pairs: vec![(3, 5)],
        };
        assert_eq!(frame.successive_position(), 0);
    }

    #[test]
    fn test_garbage_frame_dropped() {
        assert!(Frame::decode(&[]).is_none());
        assert!(Frame::decode(&[0xFF, 0xFF, 1, 2, 3]).is_none());
        assert!(Frame::decode(&[1, 0]).is_none()); // truncated first gene
    }

    #[test]
    fn test_send_gene_states() {
        let now = Instant::now();
        let mut gene = SendGene::new(0, Bytes::from_static(b"x"));
        assert_eq!(gene.state, SendGeneState::Initial);
        assert!(!gene.ever_resent());

        gene.mark_sent(now);
        assert_eq!(gene.state, SendGeneState::Sent);

        gene.mark_resent(now, true);
        assert_eq!(gene.state, SendGeneState::LossDetected);
        assert!(gene.ever_resent());
    }

    #[test]
    fn test_can_resend_suppression() {
        let now = Instant::now();
        let mut gene = SendGene::new(0, Bytes::from_static(b"x"));
        assert!(gene.can_resend(Duration::from_millis(50), now));
        gene.mark_sent(now);
        assert!(!gene.can_resend(Duration::from_millis(50), now));
        assert!(gene.can_resend(
            Duration::from_millis(50),
            now + Duration::from_millis(51)
        ));
    }

    #[test]
    fn test_frame_budget_fits_packet() {
        use crate::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
        // budget + CBC padding block + header must fit in one datagram
        assert!(FRAME_BUDGET + 16 + PACKET_HEADER_SIZE <= MAX_PACKET_SIZE);
    }
}
