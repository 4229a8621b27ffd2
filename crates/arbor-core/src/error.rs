//! Error types for the Arbor ledger.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("proposer address does not match public key")] AddressMismatch,
}

/// Errors surfaced by the ledger and its stores.
///
/// `ConfirmBlock` never returns these directly — it reports them through
/// `ConfirmStatus::error`. Query operations return them as `Err`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("block not exist in this chain")] BlockNotExist,
    #[error("transaction not found")] TxNotFound,
    #[error("transaction duplicated in different trunk blocks")] TxDuplicated,
    #[error("this ledger already has a root block")] RootBlockAlreadyExist,
    #[error("transaction not confirmed")] TxNotConfirmed,
    #[error("more than one coinbase transaction in block")] MultipleCoinbase,
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("invalid block award: got {got}, expected {expected}")] InvalidAward { got: u64, expected: u64 },
    #[error("corrupt data: {0}")] Corrupt(String),
    #[error("invalid genesis config: {0}")] Genesis(String),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error("storage: {0}")] Storage(String),
}
