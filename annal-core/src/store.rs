//! Persistence layer abstractions.
//!
//! The store owns durable event data and projected documents. The pipeline
//! talks to it through a narrow contract: open a unit of work, query current
//! documents, stage event appends, and commit, with a distinguishable
//! unique-constraint signal at commit time. One unit of work is scoped to
//! one command execution and is committed or discarded within that call.

use std::future::Future;

use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::AggregateEvent,
    projection::{Document, ProjectionError, ProjectionRegistry},
};

pub mod inmemory;

/// Error from store operations other than the commit-time unique check.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode `{aggregate}/{kind}` event: {source}")]
    EncodeEvent {
        aggregate: &'static str,
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode `{kind}` document `{id}`: {source}")]
    DecodeDocument {
        kind: &'static str,
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream `{stream_id}` already exists")]
    StreamExists { stream_id: Uuid },
    #[error("unknown projection `{name}`")]
    UnknownProjection { name: String },
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Error from committing a unit of work.
///
/// `UniqueViolation` is the one storage-specific signal the command pipeline
/// is allowed to recognize; it is translated into a race-condition failure
/// for the caller.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("unique constraint `{constraint}` violated")]
    UniqueViolation { constraint: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommitError {
    /// Whether this commit failure is a unique-constraint violation.
    ///
    /// This predicate is the only place storage-specific race knowledge
    /// leaks into the pipeline.
    #[must_use]
    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

/// Storage-level uniqueness constraint on a projected-document string field.
///
/// Pre-check queries in handlers are inherently racy; these indexes are the
/// final arbiter at commit time.
#[derive(Debug, Clone)]
pub struct UniqueIndex {
    constraint: String,
    document: &'static str,
    field: &'static str,
}

impl UniqueIndex {
    /// Declare a unique constraint on `field` of document type `D`.
    #[must_use]
    pub fn new<D: Document>(field: &'static str) -> Self {
        Self {
            constraint: format!("{}_{}_unique", D::KIND, field),
            document: D::KIND,
            field,
        }
    }

    /// Constraint name reported on violation.
    #[must_use]
    pub fn constraint(&self) -> &str {
        &self.constraint
    }

    /// Document kind the constraint applies to.
    #[must_use]
    pub const fn document(&self) -> &'static str {
        self.document
    }

    /// Extract the indexed key from a serialized document.
    ///
    /// Non-string and absent fields carry no key and are exempt from the
    /// constraint, like SQL nulls.
    #[must_use]
    pub fn key_of<'a>(&self, doc: &'a serde_json::Value) -> Option<&'a str> {
        doc.get(self.field)?.as_str()
    }
}

/// Scoped read/write session against the store: the write context of one
/// command execution.
///
/// Queries observe the committed state; staged events become visible (and
/// are folded into documents) atomically at [`commit`](Self::commit).
pub trait UnitOfWork: Send {
    /// Load the current document of type `D` with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a stored document cannot be decoded.
    fn load<'a, D: Document>(
        &'a self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<D>, StoreError>> + Send + 'a;

    /// Find the first current document of type `D` matching the predicate.
    ///
    /// Documents are visited in id order, so the result is deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a stored document cannot be decoded.
    fn find<'a, D, F>(
        &'a self,
        predicate: F,
    ) -> impl Future<Output = Result<Option<D>, StoreError>> + Send + 'a
    where
        D: Document,
        F: FnMut(&D) -> bool + Send + 'a;

    /// All current documents of type `D`, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a stored document cannot be decoded.
    fn list<'a, D: Document>(
        &'a self,
    ) -> impl Future<Output = Result<Vec<D>, StoreError>> + Send + 'a;

    /// Stage the first event of a new stream.
    ///
    /// The commit fails if the stream already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EncodeEvent`] if the event cannot be
    /// serialized.
    fn start_stream<E: AggregateEvent>(
        &mut self,
        stream_id: Uuid,
        event: E,
    ) -> Result<(), StoreError>;

    /// Stage an event append to an existing stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EncodeEvent`] if the event cannot be
    /// serialized.
    fn append<E: AggregateEvent>(&mut self, stream_id: Uuid, event: E) -> Result<(), StoreError>;

    /// Number of events currently staged.
    fn pending(&self) -> usize;

    /// Drop every staged event, leaving the unit of work reusable.
    ///
    /// A failed handler must leave no partial effects; the pipeline calls
    /// this before committing guard bookkeeping.
    fn discard_pending(&mut self);

    /// Persist all staged events atomically, folding them into projected
    /// documents inline.
    ///
    /// Committing with nothing staged succeeds and persists nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::UniqueViolation`] if a declared unique index
    /// would be violated, or [`CommitError::Store`] for any other failure.
    fn commit(self) -> impl Future<Output = Result<(), CommitError>> + Send;
}

/// Abstraction over the event/document storage engine.
pub trait EventStore: Send + Sync {
    type Uow: UnitOfWork;

    /// Open a unit of work scoped to a single command execution.
    fn begin(&self) -> Self::Uow;

    /// The static registry of projections this store maintains inline.
    fn projections(&self) -> &ProjectionRegistry;

    /// Rebuild one projection from its full backing event history,
    /// rematerializing every affected document. Returns the number of
    /// documents produced.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownProjection`] for an unregistered name,
    /// or any fold error encountered during replay.
    fn rebuild<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send + 'a;
}
