//! Genesis configuration and the award schedule.
//!
//! The genesis configuration is a JSON document embedded in the root
//! block's coinbase `desc`, so every reopened ledger recovers it from
//! disk alone. The award decays by an integer fraction every
//! `height_gap` blocks; all arithmetic is exact in `u128`.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Geometric decay of the block award: multiply by `ratio_num/ratio_den`
/// once per `height_gap` blocks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AwardDecay {
    pub height_gap: u64,
    pub ratio_num: u64,
    pub ratio_den: u64,
}

/// One pre-funded address in the genesis block.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Predistribution {
    pub address: String,
    pub quota: u64,
}

/// The chain parameters fixed at genesis.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct GenesisConfig {
    pub version: String,
    /// Base coinbase award at height 0.
    pub award: u64,
    /// Optional award decay schedule.
    pub award_decay: Option<AwardDecay>,
    /// Maximum serialized block size in bytes.
    pub max_block_size: u64,
    /// Blocks below `tip - window` are considered irreversible.
    pub irreversible_slide_window: u64,
    /// Whether transactions are exempt from fees.
    pub no_fee: bool,
    /// Flat gas price.
    pub gas_price: u64,
    pub predistribution: Vec<Predistribution>,
}

/// Parsed genesis block parameters, held by an open ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenesisBlock {
    config: GenesisConfig,
}

impl GenesisBlock {
    /// Parse a genesis configuration from its JSON bytes.
    pub fn new(genesis_cfg: &[u8]) -> Result<Self, LedgerError> {
        let config: GenesisConfig = serde_json::from_slice(genesis_cfg)
            .map_err(|e| LedgerError::Genesis(e.to_string()))?;
        Ok(Self { config })
    }

    /// The raw configuration.
    pub fn config(&self) -> &GenesisConfig {
        &self.config
    }

    /// The coinbase award owed at a given height.
    ///
    /// Applies the decay fraction once per elapsed `height_gap`. A zero
    /// `height_gap` or `ratio_den` disables decay. The award reaches zero
    /// permanently once truncation exhausts it.
    pub fn calc_award(&self, height: u64) -> u64 {
        let mut award = self.config.award as u128;
        let Some(decay) = &self.config.award_decay else {
            return self.config.award;
        };
        if decay.height_gap == 0 || decay.ratio_den == 0 {
            return self.config.award;
        }
        let periods = height / decay.height_gap;
        for _ in 0..periods {
            if award == 0 {
                break;
            }
            award = award * decay.ratio_num as u128 / decay.ratio_den as u128;
        }
        award as u64
    }
}
