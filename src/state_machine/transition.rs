//! Pure disposition of a transform tick

use crate::store::schema::{CollectionStatus, ProcessingStatus, TransformStatus};
use crate::work::{OperatorAction, Work};

/// What one update tick should do to a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// An operator request: record the action on the work and advance to the
    /// progressive state.
    Operator {
        action: OperatorAction,
        next_status: TransformStatus,
    },
    /// The work reported a terminal state: adopt it and close the
    /// collections accordingly.
    Terminal {
        next_status: TransformStatus,
        collection_status: CollectionStatus,
    },
    /// Keep transforming.
    Continue,
}

/// The operator action encoded by a `To*` status, if any.
pub fn operator_action(status: TransformStatus) -> Option<OperatorAction> {
    match status {
        TransformStatus::ToCancel => Some(OperatorAction::Cancel),
        TransformStatus::ToSuspend => Some(OperatorAction::Suspend),
        TransformStatus::ToResume => Some(OperatorAction::Resume),
        TransformStatus::ToExpire => Some(OperatorAction::Expire),
        TransformStatus::ToFinish => Some(OperatorAction::Finish),
        TransformStatus::ToForceFinish => Some(OperatorAction::ForceFinish),
        _ => None,
    }
}

/// Progressive state entered while an operator action is honoured.
fn progressive_status(action: OperatorAction) -> TransformStatus {
    match action {
        OperatorAction::Cancel => TransformStatus::Cancelling,
        OperatorAction::Suspend => TransformStatus::Suspending,
        OperatorAction::Resume => TransformStatus::Resuming,
        OperatorAction::Expire => TransformStatus::Expiring,
        OperatorAction::Finish | OperatorAction::ForceFinish => TransformStatus::Transforming,
    }
}

/// Decide the disposition of a tick.
///
/// Operator `To*` states take priority over the work's own view. Terminal
/// predicates are consulted in fixed order: finished, subfinished, failed,
/// expired, cancelled, suspended. The first match wins.
pub fn evaluate(status: TransformStatus, work: &dyn Work) -> Disposition {
    if let Some(action) = operator_action(status) {
        return Disposition::Operator {
            action,
            next_status: progressive_status(action),
        };
    }
    match status {
        _ if work.is_finished() => Disposition::Terminal {
            next_status: TransformStatus::Finished,
            collection_status: CollectionStatus::Closed,
        },
        _ if work.is_subfinished() => Disposition::Terminal {
            next_status: TransformStatus::SubFinished,
            collection_status: CollectionStatus::SubClosed,
        },
        _ if work.is_failed() => Disposition::Terminal {
            next_status: TransformStatus::Failed,
            collection_status: CollectionStatus::Failed,
        },
        _ if work.is_expired() => Disposition::Terminal {
            next_status: TransformStatus::Expired,
            collection_status: CollectionStatus::SubClosed,
        },
        _ if work.is_cancelled() => Disposition::Terminal {
            next_status: TransformStatus::Cancelled,
            collection_status: CollectionStatus::Cancelled,
        },
        _ if work.is_suspended() => Disposition::Terminal {
            next_status: TransformStatus::Suspended,
            collection_status: CollectionStatus::Suspended,
        },
        _ => Disposition::Continue,
    }
}

/// Processing status stamped onto a processing row created while the given
/// operator action is pending.
pub fn processing_status_for(action: OperatorAction) -> ProcessingStatus {
    match action {
        OperatorAction::Cancel => ProcessingStatus::ToCancel,
        OperatorAction::Suspend => ProcessingStatus::ToSuspend,
        OperatorAction::Resume => ProcessingStatus::ToResume,
        OperatorAction::Expire => ProcessingStatus::ToExpire,
        OperatorAction::Finish => ProcessingStatus::ToFinish,
        OperatorAction::ForceFinish => ProcessingStatus::ToForceFinish,
    }
}
