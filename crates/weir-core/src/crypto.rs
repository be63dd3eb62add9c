//! Cryptographic primitives for weir.
//!
//! Provides two things:
//!   1. BLAKE3 hashing — content keys, batch roots, proof digests
//!   2. Ed25519 signing — handover and takeover statements
//!
//! A handover proof is the upstream peer's signed assertion of the hashes
//! comprising an offered batch; a takeover proof is the downstream peer's
//! signed acknowledgment that the batch has been stored. Both sign the
//! BLAKE3 digest of the canonical statement serialization, so either side
//! can later present the proof to a third party.
//!
//! Key material derives ZeroizeOnDrop via the dalek types — wiped from
//! memory when dropped. There is no unsafe code in this module.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::wire::{Handover, HandoverProof, Takeover, TakeoverProof};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for content keys, batch roots, and proof digest derivation.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Commitment over an offered batch: the BLAKE3 digest of the concatenated
/// hash sequence. Both sides can recompute it from the offered `hashes`
/// buffer, so a proof carrying a different root is immediately suspect.
pub fn batch_root(hashes: &[u8]) -> [u8; 32] {
    hash(hashes)
}

// ── Chunk keys ────────────────────────────────────────────────────────────────

/// Content address of a chunk: the BLAKE3 hash of its payload bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey(pub [u8; 32]);

impl ChunkKey {
    /// Derive the key for a payload.
    pub fn for_data(data: &[u8]) -> Self {
        Self(hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a key out of a 32-byte slice. `None` if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({}…)", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for ChunkKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 signing keypair.
///
/// The public key identifies the node to its peers; the private half signs
/// handover and takeover statements and never leaves this struct.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_bytes(private: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&private),
        }
    }

    /// The public (verifying) key, as raw bytes.
    pub fn public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Serialize the private key for persistent storage.
    /// Store these bytes securely; the public key is always derived on load.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign a handover statement, producing the proof sent with an offer.
    pub fn sign_handover(&self, handover: &Handover) -> HandoverProof {
        let sig = self.signing.sign(&handover_digest(handover));
        HandoverProof {
            sig: sig.to_bytes().to_vec(),
            handover: handover.clone(),
        }
    }

    /// Sign a takeover statement, producing the proof that closes a batch.
    pub fn sign_takeover(&self, takeover: &Takeover) -> TakeoverProof {
        let sig = self.signing.sign(&takeover_digest(takeover));
        TakeoverProof {
            sig: sig.to_bytes().to_vec(),
            takeover: takeover.clone(),
        }
    }
}

// ── Statement digests ─────────────────────────────────────────────────────────

/// Canonical digest of a handover/takeover statement:
/// BLAKE3 over length-prefixed name and key, then start, end, and root,
/// integers little-endian. Both sides must agree on this byte layout or
/// signatures will never verify.
fn statement_digest(stream: &str, key: &[u8], start: u64, end: u64, root: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(stream.len() as u32).to_le_bytes());
    hasher.update(stream.as_bytes());
    hasher.update(&(key.len() as u32).to_le_bytes());
    hasher.update(key);
    hasher.update(&start.to_le_bytes());
    hasher.update(&end.to_le_bytes());
    hasher.update(root);
    *hasher.finalize().as_bytes()
}

/// Digest a handover statement for signing or verification.
pub fn handover_digest(h: &Handover) -> [u8; 32] {
    statement_digest(&h.stream, &h.key, h.start, h.end, &h.root)
}

/// Digest a takeover statement for signing or verification.
pub fn takeover_digest(t: &Takeover) -> [u8; 32] {
    statement_digest(&t.stream, &t.key, t.start, t.end, &t.root)
}

fn verify(sig: &[u8], digest: &[u8; 32], public: &[u8; 32]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(sig) else {
        return false;
    };
    vk.verify(digest, &sig).is_ok()
}

/// Check a handover proof against the claimed upstream public key.
pub fn verify_handover(proof: &HandoverProof, public: &[u8; 32]) -> bool {
    verify(&proof.sig, &handover_digest(&proof.handover), public)
}

/// Check a takeover proof against the claimed downstream public key.
pub fn verify_takeover(proof: &TakeoverProof, public: &[u8; 32]) -> bool {
    verify(&proof.sig, &takeover_digest(&proof.takeover), public)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
