/// Crawl entry state definitions
///
/// The database stores an entry as `pending`/`busy` flags plus an `outcome`
/// column; this module maps those columns onto one explicit state.
use std::fmt;

/// Represents the current state of a crawl entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    // ===== Active States =====
    /// Entry is waiting for a consumer to claim it
    Queued,

    /// Entry is claimed by a consumer
    InProgress,

    // ===== Terminal States =====
    /// Every follower page was collected
    Done,

    /// Entry was above the follower ceiling and was not fetched
    Skipped,

    /// Entry was abandoned after an unrecoverable error
    Failed,
}

/// Terminal outcome stored in the `outcome` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryOutcome {
    Done,
    Skipped,
    Failed,
}

impl EntryOutcome {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "done" => Some(Self::Done),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl EntryState {
    /// Derives the state from the stored columns
    ///
    /// A non-pending entry without a recorded outcome was finished by the
    /// `reset` maintenance command and is reported as done.
    pub fn from_columns(pending: bool, busy: bool, outcome: Option<EntryOutcome>) -> Self {
        if busy {
            return Self::InProgress;
        }
        if pending {
            return Self::Queued;
        }
        match outcome {
            Some(EntryOutcome::Skipped) => Self::Skipped,
            Some(EntryOutcome::Failed) => Self::Failed,
            Some(EntryOutcome::Done) | None => Self::Done,
        }
    }

    /// Returns true if this is a terminal state (no further processing needed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }

    /// Returns true if a consumer may still pick the entry up
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all entry states in display order
    pub fn all() -> &'static [EntryState] {
        &[
            Self::Queued,
            Self::InProgress,
            Self::Done,
            Self::Skipped,
            Self::Failed,
        ]
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
