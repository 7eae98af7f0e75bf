//! Import job lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// `CREATED → QUEUED → PROCESSING → {COMPLETED | FAILED}`
///
/// Terminal states are final: once a job is `COMPLETED` or `FAILED` no other
/// status may be written over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    #[default]
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub const TERMINAL: [ImportStatus; 2] = [ImportStatus::Completed, ImportStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Created => "CREATED",
            ImportStatus::Queued => "QUEUED",
            ImportStatus::Processing => "PROCESSING",
            ImportStatus::Completed => "COMPLETED",
            ImportStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    /// Whether a job currently in `self` may be moved to `next`.
    ///
    /// Redelivered messages may re-apply a non-terminal status, so only terminal
    /// states are guarded.
    pub fn can_transition_to(&self, _next: ImportStatus) -> bool {
        !self.is_terminal()
    }

    /// Status a finished master job lands in
    pub fn for_outcome(failed: i64) -> Self {
        if failed > 0 {
            ImportStatus::Failed
        } else {
            ImportStatus::Completed
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(ImportStatus::Created),
            "QUEUED" => Ok(ImportStatus::Queued),
            "PROCESSING" => Ok(ImportStatus::Processing),
            "COMPLETED" => Ok(ImportStatus::Completed),
            "FAILED" => Ok(ImportStatus::Failed),
            other => Err(CommonError::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for ImportStatus {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_never_move() {
        for terminal in ImportStatus::TERMINAL {
            for next in [
                ImportStatus::Created,
                ImportStatus::Queued,
                ImportStatus::Processing,
                ImportStatus::Completed,
                ImportStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_non_terminal_transitions() {
        assert!(ImportStatus::Created.can_transition_to(ImportStatus::Queued));
        assert!(ImportStatus::Queued.can_transition_to(ImportStatus::Processing));
        assert!(ImportStatus::Processing.can_transition_to(ImportStatus::Processing));
        assert!(ImportStatus::Processing.can_transition_to(ImportStatus::Failed));
    }

    #[test]
    fn test_outcome_policy() {
        assert_eq!(ImportStatus::for_outcome(0), ImportStatus::Completed);
        assert_eq!(ImportStatus::for_outcome(1), ImportStatus::Failed);
    }

    #[test]
    fn test_round_trip_str() {
        assert_eq!("PROCESSING".parse::<ImportStatus>().unwrap(), ImportStatus::Processing);
        assert_eq!(
            serde_json::to_string(&ImportStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        assert!("DONE".parse::<ImportStatus>().is_err());
    }
}
