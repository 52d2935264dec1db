//! Connection key material ("embryo") derivation.
//!
//! Both sides derive the same symmetric key and IV from an ECDH shared
//! secret plus the handshake salt, expanded with SHA3-256. The embryo is
//! derived once per connection and never changes for its lifetime.

use sha3::{Digest, Sha3_256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Symmetric key material for one connection's packets.
#[derive(Clone)]
pub struct Embryo {
    /// Handshake salt both sides agreed on.
    pub salt: u64,
    /// AES-256 key.
    pub key: [u8; 32],
    /// Base IV; each packet overwrites its first 4 bytes with the packet salt.
    pub iv: [u8; 16],
}

impl Embryo {
    /// Expands a shared secret and salt into key and IV.
    pub fn derive(shared_secret: &[u8], salt: u64) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(shared_secret);
        hasher.update(salt.to_le_bytes());
        let key: [u8; 32] = hasher.finalize().into();

        let mut hasher = Sha3_256::new();
        hasher.update(key);
        hasher.update(shared_secret);
        let digest = hasher.finalize();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);

        Self { salt, key, iv }
    }

    /// Derives the embryo from an ECDH exchange.
    pub fn from_ecdh(local: &StaticSecret, remote: &PublicKey, salt: u64) -> Self {
        let shared = local.diffie_hellman(remote);
        Self::derive(shared.as_bytes(), salt)
    }
}

impl std::fmt::Debug for Embryo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of logs
        f.debug_struct("Embryo").field("salt", &self.salt).finish()
    }
}
