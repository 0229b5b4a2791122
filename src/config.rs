// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;
use std::time::Duration;

use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};

use crate::chain::DEFAULT_MESSAGE_CONFIDENCE;
use crate::transfer::TransferConfig;

/// Engine-wide configuration. Loading (file formats, env overrides) is the
/// host daemon's concern; this is the already-resolved shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub publish: PublishConfig,
    pub transfer: TransferConfig,
    /// Epochs a message must stay on chain before the engine acts on it.
    pub message_confidence: i64,
    /// Directory incoming piece data is staged into.
    pub staging_dir: PathBuf,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            publish: PublishConfig::default(),
            transfer: TransferConfig::default(),
            message_confidence: DEFAULT_MESSAGE_CONFIDENCE,
            staging_dir: PathBuf::from("deal-staging"),
        }
    }
}

/// Batching policy of the publish queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Flush as soon as this many deals are queued for one provider.
    pub max_deals_per_msg: usize,
    /// Flush this long after the first deal is queued, even if the batch is
    /// not full.
    pub period: Duration,
    /// Fee cap for the publish message; also the balance an address must
    /// hold to be preferred as the sender.
    pub max_fee: TokenAmount,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_deals_per_msg: 8,
            period: Duration::from_secs(3600),
            max_fee: TokenAmount::from_nano(100_000_000), // 0.1 FIL
        }
    }
}
