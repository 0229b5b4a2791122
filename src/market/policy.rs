// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::piece::PaddedPieceSize;

/// Maximum length of a deal label.
pub const DEAL_MAX_LABEL_SIZE: usize = 256;

/// Epochs in one day at 30s block time.
pub const EPOCHS_IN_DAY: ChainEpoch = 2880;

/// Shortest deal the protocol accepts.
pub const MIN_DEAL_DURATION: ChainEpoch = 180 * EPOCHS_IN_DAY;

/// Longest deal the protocol accepts.
pub const MAX_DEAL_DURATION: ChainEpoch = 1278 * EPOCHS_IN_DAY;

/// How far past the current head a proposal's start epoch may lie.
pub const MAX_DEAL_START_BUFFER: ChainEpoch = 14 * EPOCHS_IN_DAY;

/// Protocol bounds on deal duration for a piece of the given size.
///
/// The size argument is kept for parity with the actor's signature; current
/// policy does not vary the bounds by size.
pub fn deal_duration_bounds(_size: PaddedPieceSize) -> (ChainEpoch, ChainEpoch) {
    (MIN_DEAL_DURATION, MAX_DEAL_DURATION)
}

/// Latest end epoch a proposal received at `head` may declare. Anything
/// beyond this cannot be satisfied by a deal starting within the start
/// buffer and is treated as malformed.
pub fn deal_end_epoch_bound(head: ChainEpoch) -> ChainEpoch {
    head + MAX_DEAL_START_BUFFER + MAX_DEAL_DURATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_bounds_are_sane() {
        let (min, max) = deal_duration_bounds(PaddedPieceSize(2048));
        assert!(min < max);
        assert_eq!(min, 518400);
    }

    #[test]
    fn end_epoch_bound_tracks_head() {
        assert_eq!(
            deal_end_epoch_bound(1000) - deal_end_epoch_bound(0),
            1000
        );
    }
}
