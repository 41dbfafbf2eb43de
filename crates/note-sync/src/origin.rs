//! Change-origin filter.
//!
//! Every buffer transaction passes through here before the save pipeline sees
//! it. Only transactions caused by this client's own input are admitted;
//! updates echoed from other participants and the initial document load
//! change what the user sees but never what this client persists.

use crate::replication::{Origin, Transaction};

/// `true` if the transaction was produced by this client's own input.
pub fn is_local_origin(transaction: &Transaction) -> bool {
    matches!(transaction.origin, Origin::Local)
}

/// What the session does with a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Update the view and mark the coordinator dirty
    Persist,
    /// Update the view only
    ViewOnly,
}

/// Gate between the replica and the persistence coordinator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OriginFilter;

impl OriginFilter {
    pub fn is_local_origin(&self, transaction: &Transaction) -> bool {
        is_local_origin(transaction)
    }

    pub fn admit(&self, transaction: &Transaction) -> Admission {
        if self.is_local_origin(transaction) {
            Admission::Persist
        } else {
            Admission::ViewOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant_id::ParticipantId;

    #[test]
    fn test_only_local_is_admitted() {
        let filter = OriginFilter;
        let local = Transaction::new(Origin::Local, "a");
        let remote = Transaction::new(Origin::Remote(ParticipantId::from(9)), "a");
        let initial = Transaction::new(Origin::InitialSync, "a");

        assert!(is_local_origin(&local));
        assert_eq!(filter.admit(&local), Admission::Persist);
        assert_eq!(filter.admit(&remote), Admission::ViewOnly);
        assert_eq!(filter.admit(&initial), Admission::ViewOnly);
    }
}
