//! Identifier aliases and small value types shared by every layer.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Pool identifier. One pool owns one scheduler state and one batch actor.
pub type PoolId = String;

/// Quota account identifier.
pub type AccountId = String;

/// Worker identifier as reported by polling workers.
pub type WorkerId = String;

/// Task request identifier as supplied by task producers.
pub type RequestId = String;

/// Priority level. Lower numeric value means higher priority; level 0 is the
/// most important.
pub type Priority = usize;

/// Labels (dimensions) advertised by a worker or required by a request.
pub type LabelSet = BTreeSet<String>;

/// Build a label set from anything yielding string-like items.
pub fn labels<I, S>(items: I) -> LabelSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// How a running or candidate request is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Funding {
    /// Paid from the owning account's balance at `level`.
    Funded {
        /// Balance level being charged; may be below the requested priority
        /// when the account cascaded to a cheaper level.
        level: Priority,
    },
    /// Runs on the pool's shared free capacity and is charged to nobody.
    Free,
}

impl Funding {
    /// True for `Funding::Funded`.
    pub const fn is_funded(self) -> bool {
        matches!(self, Self::Funded { .. })
    }

    /// The charged level, if funded.
    pub const fn level(self) -> Option<Priority> {
        match self {
            Self::Funded { level } => Some(level),
            Self::Free => None,
        }
    }
}
