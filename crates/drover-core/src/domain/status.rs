//! Item status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a WorkItem (and, with the same shape, of a SubItem).
///
/// State transitions:
/// - Pending -> Claimed            (claim)
/// - Claimed -> Claimed            (re-claim after the staleness timeout, attempts + 1)
/// - Claimed -> Done | Failed      (outcome recorded)
/// - Failed | Claimed -> Pending   (operator reset)
///
/// Nothing else. `Done` and `Failed` are terminal for the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed.
    Pending,

    /// Owned by exactly one worker (until the claim goes stale).
    Claimed,

    /// Pipeline finished; result may still carry partial failures.
    Done,

    /// Required stage failed; waits for an operator reset.
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Claimed,
        ItemStatus::Done,
        ItemStatus::Failed,
    ];

    /// Is this a terminal state (no transition except an operator reset)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Failed)
    }

    /// Can an operator reset this status back to `Pending`?
    pub fn is_resettable(self) -> bool {
        matches!(self, ItemStatus::Failed | ItemStatus::Claimed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown item status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for ItemStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "claimed" => Ok(ItemStatus::Claimed),
            "done" => Ok(ItemStatus::Done),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ItemStatus::Pending, false, false)]
    #[case(ItemStatus::Claimed, false, true)]
    #[case(ItemStatus::Done, true, false)]
    #[case(ItemStatus::Failed, true, true)]
    fn classification(
        #[case] status: ItemStatus,
        #[case] terminal: bool,
        #[case] resettable: bool,
    ) {
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(status.is_resettable(), resettable);
    }

    #[test]
    fn string_form_matches_serde() {
        for status in ItemStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("running".parse::<ItemStatus>().is_err());
    }
}
