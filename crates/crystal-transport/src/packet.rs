//! Packet framing and frame encryption.
//!
//! Wire layout, little-endian:
//! `[4B salt][2B engagement][2B packet type][8B connection id][encrypted frame]`.
//! The frame is AES-256-CBC with PKCS7 padding; the IV is the connection IV
//! with its first 4 bytes overwritten by the packet salt, so every packet
//! gets a unique IV without extra wire bytes. A packet whose frame is empty
//! is the connection-close signal.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes256;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use crate::embryo::Embryo;

/// Size of the unencrypted packet header.
pub const PACKET_HEADER_SIZE: usize = 16;

/// Largest datagram the transport will emit.
pub const MAX_PACKET_SIZE: usize = 1432;

/// Cached AES key schedules per connection. Two instances cover the common
/// encrypt-while-decrypting case without per-packet key expansion.
const CIPHER_POOL_SIZE: usize = 2;

/// Packet types carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    /// Unencrypted client hello carrying an ECDH public key.
    Connect = 1,
    /// Unencrypted server reply carrying its ECDH public key.
    ConnectResponse = 2,
    /// Encrypted frame (gene, ack, or the empty close signal).
    Sealed = 3,
}

impl PacketType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnectResponse),
            3 => Some(PacketType::Sealed),
            _ => None,
        }
    }
}

/// The unencrypted packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Per-packet random salt, also the IV differentiator.
    pub salt: u32,
    /// Engagement tag relayed as-is.
    pub engagement: u16,
    /// Packet type.
    pub packet_type: PacketType,
    /// Connection this packet belongs to.
    pub connection_id: u64,
}

impl PacketHeader {
    /// Encodes the header into its 16-byte wire form.
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.salt.to_le_bytes());
        out[4..6].copy_from_slice(&self.engagement.to_le_bytes());
        out[6..8].copy_from_slice(&(self.packet_type as u16).to_le_bytes());
        out[8..16].copy_from_slice(&self.connection_id.to_le_bytes());
        out
    }

    /// Decodes a header, returning it and the rest of the datagram.
    /// Undersized or unknown-type packets yield `None` and are dropped.
    pub fn decode(datagram: &[u8]) -> Option<(Self, &[u8])> {
        if datagram.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let salt = u32::from_le_bytes(datagram[0..4].try_into().ok()?);
        let engagement = u16::from_le_bytes(datagram[4..6].try_into().ok()?);
        let packet_type = PacketType::from_u16(u16::from_le_bytes(datagram[6..8].try_into().ok()?))?;
        let connection_id = u64::from_le_bytes(datagram[8..16].try_into().ok()?);
        Some((
            Self {
                salt,
                engagement,
                packet_type,
                connection_id,
            },
            &datagram[PACKET_HEADER_SIZE..],
        ))
    }
}

/// Pool of AES key-schedule instances for one connection.
pub struct CipherPool {
    key: [u8; 32],
    pool: Mutex<Vec<Aes256>>,
}

impl CipherPool {
    /// Creates a pool for the given key.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            pool: Mutex::new(Vec::with_capacity(CIPHER_POOL_SIZE)),
        }
    }

    fn acquire(&self) -> Aes256 {
        if let Some(cipher) = self.pool.lock().pop() {
            return cipher;
        }
        Aes256::new(GenericArray::from_slice(&self.key))
    }

    fn release(&self, cipher: Aes256) {
        let mut pool = self.pool.lock();
        if pool.len() < CIPHER_POOL_SIZE {
            pool.push(cipher);
        }
    }
}

/// The per-packet IV: connection IV with its first 4 bytes replaced by the
/// packet salt.
fn salted_iv(base: &[u8; 16], salt: u32) -> [u8; 16] {
    let mut iv = *base;
    iv[0..4].copy_from_slice(&salt.to_le_bytes());
    iv
}

/// Encrypts a frame under the embryo key with the salted IV.
pub fn encrypt_frame(pool: &CipherPool, embryo: &Embryo, salt: u32, plain: &[u8]) -> Vec<u8> {
    let iv = salted_iv(&embryo.iv, salt);
    let cipher = pool.acquire();
    let encryptor = cbc::Encryptor::<Aes256>::inner_iv_init(cipher.clone(), GenericArray::from_slice(&iv));
    let out = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain);
    pool.release(cipher);
    out
}

/// Decrypts a frame. Returns `None` on any failure; the caller drops the
/// packet silently.
pub fn decrypt_frame(pool: &CipherPool, embryo: &Embryo, salt: u32, sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.is_empty() || sealed.len() % 16 != 0 {
        return None;
    }
    let iv = salted_iv(&embryo.iv, salt);
    let cipher = pool.acquire();
    let decryptor = cbc::Decryptor::<Aes256>::inner_iv_init(cipher.clone(), GenericArray::from_slice(&iv));
    let result = decryptor.decrypt_padded_vec_mut::<Pkcs7>(sealed).ok();
    pool.release(cipher);
    result
}

/// Builds a sealed packet: fresh random salt, header, encrypted frame.
pub fn create_packet(
    pool: &CipherPool,
    embryo: &Embryo,
    engagement: u16,
    connection_id: u64,
    frame: &[u8],
) -> Vec<u8> {
    let salt: u32 = rand::thread_rng().gen();
    let header = PacketHeader {
        salt,
        engagement,
        packet_type: PacketType::Sealed,
        connection_id,
    };
    let sealed = encrypt_frame(pool, embryo, salt, frame);
    let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + sealed.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&sealed);
    trace!(connection_id, frame_len = frame.len(), "packet sealed");
    out
}

/// Builds the close signal: a header with no frame at all.
pub fn create_close_packet(engagement: u16, connection_id: u64) -> Vec<u8> {
    let header = PacketHeader {
        salt: rand::thread_rng().gen(),
        engagement,
        packet_type: PacketType::Sealed,
        connection_id,
    };
    header.encode().to_vec()
}

/// Builds an unencrypted handshake packet carrying a public key.
pub fn create_handshake_packet(
    packet_type: PacketType,
    engagement: u16,
    connection_id: u64,
    public_key: &[u8; 32],
) -> Vec<u8> {
    let header = PacketHeader {
        salt: rand::thread_rng().gen(),
        engagement,
        packet_type,
        connection_id,
    };
    let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + 32);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(public_key);
    out
}
