use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry<C> {
    /// The client command carried by this entry
    pub command: C,
    /// The term when this entry was created
    pub term: Term,
}

impl<C> LogEntry<C> {
    pub fn new(command: C, term: Term) -> Self {
        Self { command, term }
    }
}

/// Type alias for term numbers
pub type Term = u64;

/// Type alias for log indices. Indices are 1-based; 0 is the "before the
/// start" sentinel used for an empty log.
pub type LogIndex = u64;

/// Node identifier
pub type NodeId = String;
