// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The deal lifecycle as an explicit transition table.
//!
//! `transition` is pure: it maps the current state and an event to the next
//! state plus the effects the orchestrator must run. Effects with external
//! side effects (fund reservation, message submission) live in the
//! interpreter (`provider::StorageProvider`), which keeps every transition
//! unit-testable without a chain.
//!
//! `handle_error` bypasses this table on purpose: it must be callable from
//! any state, twice, without further coordination.

use std::path::PathBuf;

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use serde::{Deserialize, Serialize};

/// Lifecycle states of a deal. The happy path progresses strictly downward;
/// the side states are reachable as documented on each variant.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
pub enum DealState {
    Unknown,
    Validating,
    AcceptWait,
    WaitingForData,
    VerifyData,
    ReserveProviderFunds,
    /// Waiting for an on-chain collateral top-up to land. Skipped when the
    /// reservation needed no message.
    ProviderFunding,
    Publish,
    Publishing,
    Staged,
    AwaitingPreCommit,
    Sealing,
    Active,
    /// Rejection handshake in progress; always ends in `Failing`.
    Rejecting,
    /// Terminal: operational failure after acceptance.
    Failing,
    /// Terminal: non-retryable failure (e.g. commitment mismatch).
    Error,
    /// Terminal: slashed on chain after activation.
    Slashed,
    /// Terminal: reached its end epoch.
    Expired,
}

impl DealState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealState::Failing | DealState::Error | DealState::Slashed | DealState::Expired
        )
    }
}

/// Preconditions becoming true, reported to the state machine.
#[derive(Clone, Debug)]
pub enum DealEvent {
    Validate,
    Accepted,
    Rejected { reason: String },
    ResponseSent,
    RejectionSent,
    DataReceived { path: PathBuf },
    DataVerified,
    VerificationFailed { reason: String },
    FundsReserved { amount: TokenAmount, message: Option<Cid> },
    FundingConfirmed,
    PublishSubmitted { message: Cid },
    PublishConfirmed { deal_id: DealID },
    PieceStaged,
    SectorPreCommitted { sector: SectorNumber, active: bool },
    SectorCommitted,
    SlashDetected { epoch: ChainEpoch },
    TermExpired,
}

impl DealEvent {
    pub fn label(&self) -> &'static str {
        match self {
            DealEvent::Validate => "Validate",
            DealEvent::Accepted => "Accepted",
            DealEvent::Rejected { .. } => "Rejected",
            DealEvent::ResponseSent => "ResponseSent",
            DealEvent::RejectionSent => "RejectionSent",
            DealEvent::DataReceived { .. } => "DataReceived",
            DealEvent::DataVerified => "DataVerified",
            DealEvent::VerificationFailed { .. } => "VerificationFailed",
            DealEvent::FundsReserved { .. } => "FundsReserved",
            DealEvent::FundingConfirmed => "FundingConfirmed",
            DealEvent::PublishSubmitted { .. } => "PublishSubmitted",
            DealEvent::PublishConfirmed { .. } => "PublishConfirmed",
            DealEvent::PieceStaged => "PieceStaged",
            DealEvent::SectorPreCommitted { .. } => "SectorPreCommitted",
            DealEvent::SectorCommitted => "SectorCommitted",
            DealEvent::SlashDetected { .. } => "SlashDetected",
            DealEvent::TermExpired => "TermExpired",
        }
    }
}

/// Work the interpreter must carry out after a transition persists.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    SendAcceptResponse,
    SendRejectResponse { reason: String },
    /// Start the online fetch. No-op for offline deals, which wait for an
    /// explicit import instead.
    BeginTransfer,
    VerifyPieceData,
    ReserveFunds,
    WaitForFunding { message: Cid },
    QueuePublish,
    WaitForPublish { message: Cid },
    StagePiece,
    WatchPreCommit,
    WatchCommit { sector: SectorNumber },
    /// Remove staged files.
    Cleanup,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub next: DealState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: DealState) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(next: DealState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    #[error("no transition from {state} on {event}")]
    Invalid { state: DealState, event: &'static str },
}

/// The transition table. States only ever advance; the sole regressions are
/// into the failure side states.
pub fn transition(state: DealState, event: &DealEvent) -> Result<Transition, FsmError> {
    use DealEvent as E;
    use DealState as S;

    let t = match (state, event) {
        (S::Unknown, E::Validate) => Transition::to(S::Validating),
        (S::Validating, E::Accepted) => {
            Transition::with(S::AcceptWait, vec![Effect::SendAcceptResponse])
        }
        (S::Validating, E::Rejected { reason }) => Transition::with(
            S::Rejecting,
            vec![Effect::SendRejectResponse {
                reason: reason.clone(),
            }],
        ),
        (S::Rejecting, E::RejectionSent) => Transition::with(S::Failing, vec![Effect::Cleanup]),
        (S::AcceptWait, E::ResponseSent) => {
            Transition::with(S::WaitingForData, vec![Effect::BeginTransfer])
        }
        (S::WaitingForData, E::DataReceived { .. }) => {
            Transition::with(S::VerifyData, vec![Effect::VerifyPieceData])
        }
        (S::VerifyData, E::DataVerified) => {
            Transition::with(S::ReserveProviderFunds, vec![Effect::ReserveFunds])
        }
        (S::VerifyData, E::VerificationFailed { .. }) => {
            Transition::with(S::Error, vec![Effect::Cleanup])
        }
        (
            S::ReserveProviderFunds,
            E::FundsReserved {
                message: Some(message),
                ..
            },
        ) => Transition::with(
            S::ProviderFunding,
            vec![Effect::WaitForFunding { message: *message }],
        ),
        (S::ReserveProviderFunds, E::FundsReserved { message: None, .. }) => {
            Transition::with(S::Publish, vec![Effect::QueuePublish])
        }
        (S::ProviderFunding, E::FundingConfirmed) => {
            Transition::with(S::Publish, vec![Effect::QueuePublish])
        }
        (S::Publish, E::PublishSubmitted { message }) => Transition::with(
            S::Publishing,
            vec![Effect::WaitForPublish { message: *message }],
        ),
        (S::Publishing, E::PublishConfirmed { .. }) => {
            Transition::with(S::Staged, vec![Effect::StagePiece])
        }
        (S::Staged, E::PieceStaged) => {
            Transition::with(S::AwaitingPreCommit, vec![Effect::WatchPreCommit])
        }
        (S::AwaitingPreCommit, E::SectorPreCommitted { sector, .. }) => {
            Transition::with(S::Sealing, vec![Effect::WatchCommit { sector: *sector }])
        }
        (S::Sealing, E::SectorCommitted) => Transition::to(S::Active),
        (S::Active, E::SlashDetected { .. }) => Transition::with(S::Slashed, vec![Effect::Cleanup]),
        (S::Active, E::TermExpired) => Transition::with(S::Expired, vec![Effect::Cleanup]),
        (state, event) => {
            return Err(FsmError::Invalid {
                state,
                event: event.label(),
            });
        }
    };
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::dummy_cid;
    use pretty_assertions::assert_eq;

    fn drive(state: DealState, event: DealEvent) -> Transition {
        transition(state, &event).unwrap()
    }

    #[test]
    fn happy_path_walks_every_state_in_order() {
        use DealState as S;
        let publish = dummy_cid(b"publish");
        let steps: Vec<(DealEvent, S)> = vec![
            (DealEvent::Validate, S::Validating),
            (DealEvent::Accepted, S::AcceptWait),
            (DealEvent::ResponseSent, S::WaitingForData),
            (
                DealEvent::DataReceived {
                    path: "/tmp/piece".into(),
                },
                S::VerifyData,
            ),
            (DealEvent::DataVerified, S::ReserveProviderFunds),
            (
                DealEvent::FundsReserved {
                    amount: TokenAmount::from_atto(1),
                    message: None,
                },
                S::Publish,
            ),
            (
                DealEvent::PublishSubmitted { message: publish },
                S::Publishing,
            ),
            (DealEvent::PublishConfirmed { deal_id: 99 }, S::Staged),
            (DealEvent::PieceStaged, S::AwaitingPreCommit),
            (
                DealEvent::SectorPreCommitted {
                    sector: 7,
                    active: false,
                },
                S::Sealing,
            ),
            (DealEvent::SectorCommitted, S::Active),
        ];

        let mut state = DealState::Unknown;
        for (event, expected) in steps {
            state = drive(state, event).next;
            assert_eq!(state, expected);
        }
        assert!(!state.is_terminal());
    }

    #[test]
    fn funding_message_detours_through_provider_funding() {
        let msg = dummy_cid(b"add-balance");
        let t = drive(
            DealState::ReserveProviderFunds,
            DealEvent::FundsReserved {
                amount: TokenAmount::from_atto(10),
                message: Some(msg),
            },
        );
        assert_eq!(t.next, DealState::ProviderFunding);
        assert_eq!(t.effects, vec![Effect::WaitForFunding { message: msg }]);

        let t = drive(DealState::ProviderFunding, DealEvent::FundingConfirmed);
        assert_eq!(t.next, DealState::Publish);
        assert_eq!(t.effects, vec![Effect::QueuePublish]);
    }

    #[test]
    fn commitment_mismatch_is_a_dead_end() {
        let t = drive(
            DealState::VerifyData,
            DealEvent::VerificationFailed {
                reason: "commitment mismatch".into(),
            },
        );
        assert_eq!(t.next, DealState::Error);
        assert!(t.next.is_terminal());
        assert_eq!(t.effects, vec![Effect::Cleanup]);
    }

    #[test]
    fn rejection_ends_in_failing() {
        let t = drive(
            DealState::Validating,
            DealEvent::Rejected {
                reason: "price too low".into(),
            },
        );
        assert_eq!(t.next, DealState::Rejecting);
        let t = drive(t.next, DealEvent::RejectionSent);
        assert_eq!(t.next, DealState::Failing);
        assert!(t.next.is_terminal());
    }

    #[test]
    fn stale_events_are_rejected() {
        // Replaying an earlier precondition against a deal that has moved on
        // must not regress the state.
        let err = transition(
            DealState::Publishing,
            &DealEvent::DataReceived {
                path: "/tmp/piece".into(),
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            FsmError::Invalid {
                state: DealState::Publishing,
                event: "DataReceived",
            }
        );
    }

    #[test]
    fn no_transitions_out_of_terminal_states() {
        for state in [
            DealState::Error,
            DealState::Failing,
            DealState::Slashed,
            DealState::Expired,
        ] {
            assert!(transition(state, &DealEvent::DataVerified).is_err());
            assert!(transition(state, &DealEvent::SectorCommitted).is_err());
        }
    }

    #[test]
    fn post_activation_side_states() {
        let t = drive(DealState::Active, DealEvent::SlashDetected { epoch: 500 });
        assert_eq!(t.next, DealState::Slashed);
        let t = drive(DealState::Active, DealEvent::TermExpired);
        assert_eq!(t.next, DealState::Expired);
    }
}
