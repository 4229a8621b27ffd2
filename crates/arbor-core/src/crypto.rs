//! Ed25519 block signing and proposer addresses.
//!
//! A proposer address is the lowercase hex of the BLAKE3 hash of the raw
//! 32-byte public key. Blocks are signed over their id; verification
//! checks that the embedded public key both produces the claimed proposer
//! address and verifies the signature.

use ed25519_dalek::{Signer, Verifier};
use std::fmt;

use crate::error::CryptoError;
use crate::types::{Block, Hash256};

/// Ed25519 keypair used by a block proposer.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    /// Derive the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// The proposer address for this keypair.
    pub fn address(&self) -> String {
        self.public_key().address()
    }

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key embedded in block headers.
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Parse a public key from raw bytes (must be exactly 32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&arr)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    /// The raw public key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// The proposer address: hex of BLAKE3 over the raw key bytes.
    pub fn address(&self) -> String {
        hex::encode(blake3::hash(&self.to_bytes()).as_bytes())
    }

    /// Verify an Ed25519 signature on a message.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

/// Verify a block's proposer identity and signature.
///
/// Parses the embedded public key, checks the proposer address matches it,
/// and verifies the signature over the block id.
pub fn verify_block_signature(block: &Block, block_id: &Hash256) -> Result<(), CryptoError> {
    let pk = PublicKey::from_bytes(&block.pubkey)?;
    if block.proposer != pk.address().as_bytes() {
        return Err(CryptoError::AddressMismatch);
    }
    pk.verify(block_id.as_bytes(), &block.sign)
}
