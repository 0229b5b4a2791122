// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Piece-to-sector assignment.
//!
//! [`pick_and_align`] packs pending deals into one sector's padded capacity,
//! inserting zero-commitment filler pieces wherever alignment demands one
//! and decomposing the leftover space into one filler per set bit of the
//! remainder, which is the minimum possible number of power-of-two fillers.
//! The repository-facing [`DealAssigner`] wraps it with the operations the
//! sealing pipeline calls.

use std::path::PathBuf;
use std::sync::Arc;

use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::{PaddedPieceSize, PieceInfo};
use fvm_shared::sector::{SectorNumber, SectorSize};
use tracing::debug;

use crate::db::{DealStore, StoreError};
use crate::piece::{PieceError, zero_piece_commitment};
use crate::provider::deal::{MinerDeal, PieceStatus};
use crate::provider::fsm::DealState;

/// Per-call limits on an assignment request.
#[derive(Clone, Debug, Default)]
pub struct DealSpec {
    pub max_deals: Option<usize>,
    pub max_piece_size: Option<PaddedPieceSize>,
}

/// A published deal whose piece has not been placed into a sector yet.
#[derive(Clone, Debug)]
pub struct UnpackedDeal {
    pub proposal_cid: Cid,
    pub deal_id: DealID,
    pub piece: PieceInfo,
    pub piece_path: Option<PathBuf>,
    pub start_epoch: ChainEpoch,
    pub price_per_epoch: TokenAmount,
}

impl UnpackedDeal {
    fn from_deal(deal: &MinerDeal, deal_id: DealID) -> Self {
        let proposal = deal.proposal();
        Self {
            proposal_cid: deal.proposal_cid,
            deal_id,
            piece: PieceInfo {
                cid: proposal.piece_cid,
                size: proposal.piece_size,
            },
            piece_path: deal.piece_path.clone(),
            start_epoch: proposal.start_epoch,
            price_per_epoch: proposal.storage_price_per_epoch.clone(),
        }
    }
}

/// One slot of a packed sector: a real deal or synthetic zero-filled space.
#[derive(Clone, Debug)]
pub enum CombinedPiece {
    Deal(UnpackedDeal),
    Filler(PieceInfo),
}

impl CombinedPiece {
    pub fn size(&self) -> PaddedPieceSize {
        match self {
            CombinedPiece::Deal(d) => d.piece.size,
            CombinedPiece::Filler(p) => p.size,
        }
    }

    pub fn piece_info(&self) -> PieceInfo {
        match self {
            CombinedPiece::Deal(d) => d.piece.clone(),
            CombinedPiece::Filler(p) => p.clone(),
        }
    }

    pub fn is_filler(&self) -> bool {
        matches!(self, CombinedPiece::Filler(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackingError {
    #[error("sector size {0} is not a valid padded piece size")]
    InvalidSectorSize(u64),
    #[error("piece size {0} invalid: {1}")]
    InvalidPieceSize(u64, &'static str),
    #[error("deals not sorted by (size, start epoch, price) at index {0}")]
    UnorderedInput(usize),
    #[error("no deal published with id {0}")]
    UnknownDealId(DealID),
    #[error("deal {deal_id} has piece status {status}, expected {expected}")]
    WrongPieceStatus {
        deal_id: DealID,
        status: PieceStatus,
        expected: PieceStatus,
    },
    #[error(transparent)]
    Piece(#[from] PieceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn filler(size: u64) -> Result<CombinedPiece, PackingError> {
    let size = PaddedPieceSize(size);
    Ok(CombinedPiece::Filler(PieceInfo {
        cid: zero_piece_commitment(size)?,
        size,
    }))
}

/// Checks the caller kept the required order: piece size ascending, ties by
/// start epoch ascending, then price descending.
fn verify_sorted(deals: &[UnpackedDeal]) -> Result<(), PackingError> {
    for (i, pair) in deals.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        let ordered = match a.piece.size.0.cmp(&b.piece.size.0) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => match a.start_epoch.cmp(&b.start_epoch) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => a.price_per_epoch >= b.price_per_epoch,
            },
        };
        if !ordered {
            return Err(PackingError::UnorderedInput(i + 1));
        }
    }
    Ok(())
}

/// Selects and aligns deals into one sector.
///
/// Returns the ordered piece sequence covering exactly the sector's padded
/// capacity, or an empty sequence when not even the first deal fits.
/// Errors are reserved for malformed input; running out of space is not an
/// error.
pub fn pick_and_align(
    deals: &[UnpackedDeal],
    sector_size: SectorSize,
    spec: &DealSpec,
) -> Result<Vec<CombinedPiece>, PackingError> {
    let capacity = sector_size as u64;
    PaddedPieceSize(capacity)
        .validate()
        .map_err(|_| PackingError::InvalidSectorSize(capacity))?;
    for deal in deals {
        deal.piece
            .size
            .validate()
            .map_err(|e| PackingError::InvalidPieceSize(deal.piece.size.0, e))?;
    }
    verify_sorted(deals)?;

    let mut out: Vec<CombinedPiece> = Vec::new();
    let mut remaining = capacity;
    let mut taken = 0usize;

    for deal in deals {
        let size = deal.piece.size.0;
        if spec.max_deals.is_some_and(|max| taken >= max) {
            break;
        }
        if spec.max_piece_size.is_some_and(|max| size > max.0) {
            break;
        }
        if size > remaining {
            break;
        }
        // Fill up to the next boundary the deal can sit on. The lowest set
        // bit of the remaining space is the size of its next aligned
        // sub-container.
        loop {
            let aligned = 1u64 << remaining.trailing_zeros();
            if aligned >= size {
                break;
            }
            out.push(filler(aligned)?);
            remaining -= aligned;
        }
        out.push(CombinedPiece::Deal(deal.clone()));
        remaining -= size;
        taken += 1;
    }

    if taken == 0 {
        return Ok(Vec::new());
    }

    // Binary decomposition of the leftover: one filler per set bit.
    let mut bit = 1u64;
    while remaining > 0 {
        if remaining & bit != 0 {
            out.push(filler(bit)?);
            remaining -= bit;
        }
        bit <<= 1;
    }
    Ok(out)
}

/// Repository-backed assignment operations for the sealing subsystem.
pub struct DealAssigner {
    store: Arc<dyn DealStore>,
}

impl DealAssigner {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }

    /// Published deals of `miner` awaiting placement, in packing order.
    pub fn get_unpacked_deals(
        &self,
        miner: &Address,
    ) -> Result<Vec<UnpackedDeal>, PackingError> {
        let mut deals: Vec<UnpackedDeal> = self
            .store
            .list_deals(Some(miner))?
            .iter()
            .filter(|d| {
                d.piece_status == PieceStatus::Undefined
                    && matches!(d.state, DealState::AwaitingPreCommit | DealState::Sealing)
            })
            .filter_map(|d| d.deal_id.map(|id| UnpackedDeal::from_deal(d, id)))
            .collect();
        deals.sort_by(|a, b| {
            a.piece
                .size
                .0
                .cmp(&b.piece.size.0)
                .then(a.start_epoch.cmp(&b.start_epoch))
                .then(b.price_per_epoch.cmp(&a.price_per_epoch))
        });
        Ok(deals)
    }

    /// Packs unplaced deals into `sector_number` and records the assignment.
    pub fn assign_deals(
        &self,
        miner: &Address,
        sector_number: SectorNumber,
        sector_size: SectorSize,
        spec: &DealSpec,
    ) -> Result<Vec<CombinedPiece>, PackingError> {
        let deals = self.get_unpacked_deals(miner)?;
        let pieces = pick_and_align(&deals, sector_size, spec)?;

        let mut offset = 0u64;
        for piece in &pieces {
            if let CombinedPiece::Deal(deal) = piece {
                let at = offset;
                self.store.update_deal(&deal.proposal_cid, &mut |d| {
                    d.piece_status = PieceStatus::Assigned;
                    d.sector_number = Some(sector_number);
                    d.offset = Some(at);
                })?;
                debug!(deal_id = deal.deal_id, sector_number, offset = at, "assigned deal");
            }
            offset += piece.size().0;
        }
        Ok(pieces)
    }

    /// Marks assigned deals as being sealed into their sector.
    pub fn mark_as_packing(
        &self,
        _miner: &Address,
        deal_ids: &[DealID],
    ) -> Result<(), PackingError> {
        for &deal_id in deal_ids {
            let deal = self
                .store
                .deal_by_deal_id(deal_id)?
                .ok_or(PackingError::UnknownDealId(deal_id))?;
            if deal.piece_status != PieceStatus::Assigned {
                return Err(PackingError::WrongPieceStatus {
                    deal_id,
                    status: deal.piece_status,
                    expected: PieceStatus::Assigned,
                });
            }
            self.store.update_deal(&deal.proposal_cid, &mut |d| {
                d.piece_status = PieceStatus::Packing;
            })?;
        }
        Ok(())
    }

    /// Records the placement the sealing pipeline actually used.
    pub fn update_deal_on_packing(
        &self,
        _miner: &Address,
        deal_id: DealID,
        sector_number: SectorNumber,
        offset: u64,
    ) -> Result<(), PackingError> {
        let deal = self
            .store
            .deal_by_deal_id(deal_id)?
            .ok_or(PackingError::UnknownDealId(deal_id))?;
        self.store.update_deal(&deal.proposal_cid, &mut |d| {
            d.piece_status = PieceStatus::Assigned;
            d.sector_number = Some(sector_number);
            d.offset = Some(offset);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDealStore;
    use crate::test_utils::{dummy_cid, test_deal};
    use quickcheck_macros::quickcheck;

    fn unpacked(size: u64, start_epoch: ChainEpoch, price: u64) -> UnpackedDeal {
        UnpackedDeal {
            proposal_cid: dummy_cid(format!("deal-{size}-{start_epoch}-{price}").as_bytes()),
            deal_id: size + start_epoch as u64,
            piece: PieceInfo {
                cid: dummy_cid(b"piece"),
                size: PaddedPieceSize(size),
            },
            piece_path: None,
            start_epoch,
            price_per_epoch: TokenAmount::from_atto(price),
        }
    }

    fn sizes(pieces: &[CombinedPiece]) -> Vec<u64> {
        pieces.iter().map(|p| p.size().0).collect()
    }

    #[test]
    fn single_deal_remainder_decomposes_into_powers_of_two() {
        let pieces =
            pick_and_align(&[unpacked(128, 10, 1)], SectorSize::_2KiB, &DealSpec::default())
                .unwrap();
        assert_eq!(sizes(&pieces), vec![128, 128, 256, 512, 1024]);
        assert!(!pieces[0].is_filler());
        assert!(pieces[1..].iter().all(CombinedPiece::is_filler));
    }

    #[test]
    fn misaligned_second_deal_gets_alignment_filler() {
        let deals = [unpacked(128, 10, 1), unpacked(256, 11, 1)];
        let pieces = pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()).unwrap();
        assert_eq!(sizes(&pieces), vec![128, 128, 256, 512, 1024]);
        assert!(pieces[1].is_filler());
        assert!(!pieces[2].is_filler());
    }

    #[test]
    fn unordered_input_is_a_hard_error() {
        let deals = [unpacked(256, 10, 1), unpacked(128, 10, 1)];
        let err = pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()).unwrap_err();
        assert!(matches!(err, PackingError::UnorderedInput(1)));
    }

    #[test]
    fn tie_breaking_order_is_enforced() {
        // Same size: later start epoch first is unordered.
        let deals = [unpacked(128, 20, 1), unpacked(128, 10, 1)];
        assert!(matches!(
            pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()),
            Err(PackingError::UnorderedInput(1))
        ));
        // Same size and start: ascending price is unordered (must descend).
        let deals = [unpacked(128, 10, 1), unpacked(128, 10, 5)];
        assert!(matches!(
            pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()),
            Err(PackingError::UnorderedInput(1))
        ));
        // Descending price is fine.
        let deals = [unpacked(128, 10, 5), unpacked(128, 10, 1)];
        assert!(pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()).is_ok());
    }

    #[test]
    fn oversized_first_deal_yields_empty_result() {
        let deals = [unpacked(4096, 10, 1)];
        let pieces = pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()).unwrap();
        assert!(pieces.is_empty());
    }

    #[test]
    fn capacity_exhaustion_is_not_an_error() {
        let deals = [unpacked(1024, 10, 1), unpacked(2048, 11, 1)];
        let pieces = pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()).unwrap();
        // Second deal no longer fits; the rest is filler.
        assert_eq!(sizes(&pieces), vec![1024, 1024]);
        assert!(pieces[1].is_filler());
    }

    #[test]
    fn deal_count_limit_is_respected() {
        let deals = [unpacked(128, 10, 1), unpacked(128, 11, 1)];
        let spec = DealSpec {
            max_deals: Some(1),
            ..Default::default()
        };
        let pieces = pick_and_align(&deals, SectorSize::_2KiB, &spec).unwrap();
        assert_eq!(pieces.iter().filter(|p| !p.is_filler()).count(), 1);
        assert_eq!(sizes(&pieces).iter().sum::<u64>(), 2048);
    }

    #[test]
    fn max_piece_size_limit_stops_the_walk() {
        let deals = [unpacked(128, 10, 1), unpacked(1024, 11, 1)];
        let spec = DealSpec {
            max_piece_size: Some(PaddedPieceSize(512)),
            ..Default::default()
        };
        let pieces = pick_and_align(&deals, SectorSize::_2KiB, &spec).unwrap();
        assert_eq!(pieces.iter().filter(|p| !p.is_filler()).count(), 1);
    }

    #[test]
    fn invalid_sector_size_rejected() {
        let err = pick_and_align(&[], SectorSize::_8MiB, &DealSpec::default());
        assert!(err.is_ok(), "8MiB is a valid padded size");
        // A non-power-of-two capacity cannot be constructed from SectorSize,
        // so invalid piece sizes are the malformed-input case to cover.
        let deals = [unpacked(100, 10, 1)];
        assert!(matches!(
            pick_and_align(&deals, SectorSize::_2KiB, &DealSpec::default()),
            Err(PackingError::InvalidPieceSize(100, _))
        ));
    }

    #[quickcheck]
    fn packed_pieces_always_sum_to_capacity(exponents: Vec<u8>) -> bool {
        // Power-of-two sizes from 128 to 2048, sorted ascending.
        let mut sizes_in: Vec<u64> = exponents
            .into_iter()
            .take(16)
            .map(|e| 128u64 << (u64::from(e) % 5))
            .collect();
        sizes_in.sort_unstable();
        let deals: Vec<UnpackedDeal> = sizes_in
            .iter()
            .enumerate()
            .map(|(i, &s)| unpacked(s, 10 + i as ChainEpoch, 1))
            .collect();

        let pieces = pick_and_align(&deals, SectorSize::_8MiB, &DealSpec::default()).unwrap();
        if pieces.is_empty() {
            return deals.is_empty() || deals[0].piece.size.0 > SectorSize::_8MiB as u64;
        }
        let total: u64 = pieces.iter().map(|p| p.size().0).sum();
        let valid_sizes = pieces.iter().all(|p| p.size().validate().is_ok());
        total == SectorSize::_8MiB as u64 && valid_sizes
    }

    #[test]
    fn assigner_records_offsets_and_statuses() {
        let store = Arc::new(MemoryDealStore::new());
        let mut deal = test_deal(|d| d.state = DealState::AwaitingPreCommit);
        deal.deal_id = Some(42);
        store.save_deal(&deal).unwrap();
        let miner = deal.provider();

        let assigner = DealAssigner::new(store.clone());
        let unpacked = assigner.get_unpacked_deals(&miner).unwrap();
        assert_eq!(unpacked.len(), 1);

        let pieces = assigner
            .assign_deals(&miner, 7, SectorSize::_2KiB, &DealSpec::default())
            .unwrap();
        assert!(!pieces.is_empty());

        let stored = store.get_deal(&deal.proposal_cid).unwrap();
        assert_eq!(stored.piece_status, PieceStatus::Assigned);
        assert_eq!(stored.sector_number, Some(7));
        assert_eq!(stored.offset, Some(0));

        // Assigned deals are no longer offered for packing.
        assert!(assigner.get_unpacked_deals(&miner).unwrap().is_empty());

        assigner.mark_as_packing(&miner, &[42]).unwrap();
        assert_eq!(
            store.get_deal(&deal.proposal_cid).unwrap().piece_status,
            PieceStatus::Packing
        );

        // Packing twice is a status error, not silent corruption.
        assert!(matches!(
            assigner.mark_as_packing(&miner, &[42]),
            Err(PackingError::WrongPieceStatus { .. })
        ));
    }

    #[test]
    fn unknown_deal_id_is_an_error() {
        let assigner = DealAssigner::new(Arc::new(MemoryDealStore::new()));
        let miner = Address::new_id(1000);
        assert!(matches!(
            assigner.mark_as_packing(&miner, &[9]),
            Err(PackingError::UnknownDealId(9))
        ));
        assert!(matches!(
            assigner.update_deal_on_packing(&miner, 9, 1, 0),
            Err(PackingError::UnknownDealId(9))
        ));
    }
}
