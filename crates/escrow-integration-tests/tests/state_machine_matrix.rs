//! # Operation × Status Matrix
//!
//! Every caller-facing operation attempted from every status. Legal
//! operations move exactly one edge of the table, repeats are no-ops and
//! everything else is refused without touching the milestone or the
//! gateway.

mod common;

use common::{instrument, World, VISA};
use escrow_engine::{EscrowError, FundingOutcome, ReleaseOutcome};
use escrow_state::MilestoneStatus;

#[derive(Debug, Clone, Copy)]
enum Op {
    Fund,
    Complete,
    Release,
    Dispute,
}

const OPS: [Op; 4] = [Op::Fund, Op::Complete, Op::Release, Op::Dispute];

/// Label for the result of `op`: an outcome kind or an error code.
async fn attempt(w: &World, op: Op, id: escrow_core::MilestoneId) -> String {
    fn code(e: EscrowError) -> String {
        e.code().to_string()
    }
    match op {
        Op::Fund => match w.service.fund(w.client, id, instrument(VISA)).await {
            Ok(FundingOutcome::Funded { .. }) => "funded".into(),
            Ok(FundingOutcome::AlreadyFunded { .. }) => "already_funded".into(),
            Ok(other) => format!("{other:?}"),
            Err(e) => code(e),
        },
        Op::Complete => match w.service.mark_complete(w.provider, id).await {
            Ok(m) => m.status().to_string(),
            Err(e) => code(e),
        },
        Op::Release => match w.service.release(w.client, id).await {
            Ok(ReleaseOutcome::Released { .. }) => "released".into(),
            Ok(ReleaseOutcome::AlreadyReleased { .. }) => "already_released".into(),
            Ok(other) => format!("{other:?}"),
            Err(e) => code(e),
        },
        Op::Dispute => match w.service.dispute(w.client, id, "quality", "").await {
            Ok(_) => "disputed".into(),
            Err(e) => code(e),
        },
    }
}

/// Expected (label, resulting status) for `op` from `from`.
fn expected(from: MilestoneStatus, op: Op) -> (&'static str, MilestoneStatus) {
    use MilestoneStatus::*;
    const INVALID: &str = "INVALID_TRANSITION";
    match (from, op) {
        (Pending, Op::Fund) => ("funded", Funded),
        (_, Op::Fund) => ("already_funded", from),

        (Funded, Op::Complete) => ("completed", Completed),
        (_, Op::Complete) => (INVALID, from),

        (Completed, Op::Release) => ("released", Released),
        (Released, Op::Release) => ("already_released", Released),
        (_, Op::Release) => (INVALID, from),

        (Completed | Released, Op::Dispute) => ("disputed", Disputed),
        (_, Op::Dispute) => (INVALID, from),
    }
}

// =========================================================================
// Matrix
// =========================================================================

#[tokio::test]
async fn every_operation_from_every_status() {
    for from in MilestoneStatus::ALL {
        for op in OPS {
            let w = World::new();
            let id = w.at(from, 10_000).await;
            let charges = w.gateway.charge_calls();
            let transfers = w.gateway.transfer_calls();

            let label = attempt(&w, op, id).await;
            let (want_label, want_status) = expected(from, op);
            assert_eq!(label, want_label, "{op:?} from {from}");
            assert_eq!(w.status(id).await, want_status, "{op:?} from {from}");

            let charged = w.gateway.charge_calls() - charges;
            let transferred = w.gateway.transfer_calls() - transfers;
            match (from, op) {
                (MilestoneStatus::Pending, Op::Fund) => assert_eq!(charged, 1),
                (MilestoneStatus::Completed, Op::Release) => assert_eq!(transferred, 1),
                _ => assert_eq!((charged, transferred), (0, 0), "{op:?} from {from}"),
            }
        }
    }
}

#[tokio::test]
async fn refused_operations_keep_the_event_log_clean() {
    let w = World::new();
    let id = w.at(MilestoneStatus::Disputed, 10_000).await;
    for op in OPS {
        attempt(&w, op, id).await;
    }
    // Funded, completed and disputed; nothing from the refused calls.
    assert_eq!(w.service.drain_events().await.unwrap().audited, 3);
}

#[tokio::test]
async fn wrong_party_is_forbidden_before_the_status_is_considered() {
    let w = World::new();
    let id = w.at(MilestoneStatus::Pending, 10_000).await;
    let err = w
        .service
        .fund(w.provider, id, instrument(VISA))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");

    let id = w.at(MilestoneStatus::Funded, 10_000).await;
    let err = w.service.mark_complete(w.client, id).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert_eq!(w.status(id).await, MilestoneStatus::Funded);
}

#[tokio::test]
async fn outsiders_cannot_see_or_touch_a_milestone() {
    let w = World::new();
    let id = w.at(MilestoneStatus::Completed, 10_000).await;
    let stranger = w.stranger();

    let err = w.service.milestone(stranger, id).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = w.service.release(stranger, id).await.unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = w
        .service
        .dispute(stranger, id, "not mine", "")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert_eq!(w.status(id).await, MilestoneStatus::Completed);
}

// =========================================================================
// Transition table
// =========================================================================

#[test]
fn table_is_a_forward_chain_with_one_branch() {
    use MilestoneStatus::*;
    assert_eq!(Pending.valid_transitions(), &[Funded]);
    assert_eq!(Funded.valid_transitions(), &[Completed]);
    assert_eq!(Completed.valid_transitions(), &[Released, Disputed]);
    assert_eq!(Released.valid_transitions(), &[Disputed]);
    assert!(Disputed.is_terminal());
    assert_eq!(
        MilestoneStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .count(),
        1
    );
}

#[test]
fn status_names_round_trip() {
    for status in MilestoneStatus::ALL {
        assert_eq!(MilestoneStatus::from_name(status.as_str()), Some(status));
    }
    assert_eq!(MilestoneStatus::from_name("refunded"), None);
}
