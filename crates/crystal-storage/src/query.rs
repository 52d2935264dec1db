//! Abort-or-continue query checkpoints.
//!
//! Consistency and configuration failures that risk data loss are never
//! decided unilaterally by the engine; they are routed through an injected
//! callback so the embedding application (interactive CLI, service, test)
//! can decide.

use std::path::PathBuf;

use async_trait::async_trait;

/// The operator's decision at a query checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAnswer {
    /// Stop the operation; the engine surfaces `Aborted`.
    Abort,
    /// Proceed despite the condition (possibly losing data).
    Continue,
}

/// The condition being asked about.
#[derive(Debug)]
pub enum QueryPrompt<'a> {
    /// The persisted shard registry failed its hash or decode check.
    CorruptedRegistry,
    /// These shard directories failed preparation and would be dropped.
    UnavailableDirectories(&'a [PathBuf]),
    /// A document's recorded journal position is ahead of the journal;
    /// continuing resets the journal to the recorded position.
    InconsistentJournal {
        /// Position recorded in the document's waypoint.
        recorded: u64,
        /// The journal's actual current position.
        current: u64,
    },
    /// A document marked required-for-loading could not be loaded.
    LoadFailed,
}

/// Injectable decision point for abort-or-continue checkpoints.
#[async_trait]
pub trait StorageQuery: Send + Sync {
    /// Asks the operator what to do about `prompt`.
    async fn ask(&self, prompt: QueryPrompt<'_>) -> QueryAnswer;
}

/// A query that always continues. The default for non-interactive use.
pub struct ContinueAll;

#[async_trait]
impl StorageQuery for ContinueAll {
    async fn ask(&self, _prompt: QueryPrompt<'_>) -> QueryAnswer {
        QueryAnswer::Continue
    }
}

/// A query that always aborts.
pub struct AbortAll;

#[async_trait]
impl StorageQuery for AbortAll {
    async fn ask(&self, _prompt: QueryPrompt<'_>) -> QueryAnswer {
        QueryAnswer::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_continue_all() {
        let q = ContinueAll;
        assert_eq!(q.ask(QueryPrompt::CorruptedRegistry).await, QueryAnswer::Continue);
    }

    #[tokio::test]
    async fn test_abort_all() {
        let q = AbortAll;
        assert_eq!(q.ask(QueryPrompt::LoadFailed).await, QueryAnswer::Abort);
    }
}
