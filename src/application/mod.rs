pub mod calculator;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A deterministic state machine replicated by the consensus core.
///
/// `apply_command` is invoked serially on every node, in log order, exactly
/// once per committed entry; given the same command sequence every replica
/// must produce the same outputs. Commands travel between nodes and must be
/// serializable; outputs are only ever delivered to the local submitter.
pub trait Application: Send + 'static {
    type Command: Clone + Debug + Send + Serialize + DeserializeOwned + 'static;
    type Output: Clone + Debug + Send + 'static;

    fn apply_command(&mut self, command: Self::Command) -> Self::Output;
}
