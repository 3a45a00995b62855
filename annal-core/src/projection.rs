//! Read-side primitives.
//!
//! A projection folds one stream's events, in append order, into a
//! current-state document keyed by the stream identifier. Folding happens
//! inline with the unit of work that appended the events, so a reader that
//! queries a document immediately after a successful command observes the
//! update.
//!
//! Projection types are wired into an explicit [`ProjectionRegistry`] built
//! once at store construction and read-only thereafter; there is no runtime
//! discovery.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{AggregateEvent, RecordedEvent};

/// Projected current-state document, queryable by kind and identifier.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Document kind identifier. Lowercase, kebab-case: `"session"`,
    /// `"user"`.
    const KIND: &'static str;

    /// Identifier of the document; equal to the id of the stream it is
    /// folded from.
    fn id(&self) -> Uuid;
}

/// Fold definition for one document type over one aggregate's events.
///
/// `create` produces the initial document from a stream's first event;
/// `apply` is a pure, total function from (current document, next event) to
/// the next document. Applying an event that cannot legally appear after
/// creation is a programming error: implementations fire a debug assertion
/// and leave the document unchanged in release builds, keeping replay total.
pub trait Projection {
    type Event: AggregateEvent;
    type Doc: Document;

    /// Build the initial document from the stream's creating event.
    ///
    /// Returns `None` if the event cannot start a stream; the engine
    /// surfaces that as [`ProjectionError::NotACreationEvent`].
    fn create(event: &Self::Event) -> Option<Self::Doc>;

    /// Fold the next event into the current document.
    fn apply(doc: Self::Doc, event: &Self::Event) -> Self::Doc;
}

/// Errors that can occur while folding events into documents.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to decode `{aggregate}` event at sequence {sequence}: {source}")]
    DecodeEvent {
        aggregate: &'static str,
        sequence: u64,
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
    #[error("event `{kind}` cannot start a `{aggregate}` stream")]
    NotACreationEvent {
        aggregate: &'static str,
        kind: String,
    },
    #[error("failed to encode `{kind}` document: {source}")]
    EncodeDocument {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Type-erased fold over JSON documents, instantiated from a [`Projection`].
fn fold_erased<P: Projection>(
    current: Option<serde_json::Value>,
    recorded: &RecordedEvent,
) -> Result<serde_json::Value, ProjectionError> {
    let event: P::Event = recorded
        .decode()
        .map_err(|source| ProjectionError::DecodeEvent {
            aggregate: <P::Event as AggregateEvent>::AGGREGATE,
            sequence: recorded.sequence,
            source,
        })?;

    let next = match current {
        None => {
            P::create(&event).ok_or_else(|| ProjectionError::NotACreationEvent {
                aggregate: <P::Event as AggregateEvent>::AGGREGATE,
                kind: recorded.kind.clone(),
            })?
        }
        Some(value) => {
            let doc: P::Doc =
                serde_json::from_value(value).map_err(|source| ProjectionError::DecodeDocument {
                    kind: P::Doc::KIND,
                    id: recorded.stream_id,
                    source,
                })?;
            P::apply(doc, &event)
        }
    };

    serde_json::to_value(&next).map_err(|source| ProjectionError::EncodeDocument {
        kind: P::Doc::KIND,
        source,
    })
}

/// Runtime descriptor of one registered projection.
///
/// Erases the concrete [`Projection`] type so the store can hold a uniform
/// table and fold without knowing the document types.
#[derive(Clone, Copy)]
pub struct ProjectionDescriptor {
    name: &'static str,
    aggregate: &'static str,
    fold: fn(
        Option<serde_json::Value>,
        &RecordedEvent,
    ) -> Result<serde_json::Value, ProjectionError>,
}

impl ProjectionDescriptor {
    /// Build the descriptor for a concrete projection type.
    #[must_use]
    pub fn of<P: Projection>() -> Self {
        Self {
            name: P::Doc::KIND,
            aggregate: <P::Event as AggregateEvent>::AGGREGATE,
            fold: fold_erased::<P>,
        }
    }

    /// Name of the projection; equal to the projected document kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Aggregate kind whose streams feed this projection.
    #[must_use]
    pub const fn aggregate(&self) -> &'static str {
        self.aggregate
    }

    /// Fold one recorded event into the current document value.
    ///
    /// `current` is `None` for the first event of a stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event or document cannot be
    /// decoded, or if a non-creating event arrives on an empty stream.
    pub fn fold(
        &self,
        current: Option<serde_json::Value>,
        event: &RecordedEvent,
    ) -> Result<serde_json::Value, ProjectionError> {
        (self.fold)(current, event)
    }
}

impl fmt::Debug for ProjectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionDescriptor")
            .field("name", &self.name)
            .field("aggregate", &self.aggregate)
            .finish()
    }
}

/// Explicit, static registry of every projection the store maintains.
#[derive(Debug, Clone, Default)]
pub struct ProjectionRegistry {
    descriptors: Vec<ProjectionDescriptor>,
}

impl ProjectionRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Register a projection type. Names must be unique.
    #[must_use]
    pub fn register<P: Projection>(mut self) -> Self {
        let descriptor = ProjectionDescriptor::of::<P>();
        debug_assert!(
            self.get(descriptor.name()).is_none(),
            "projection `{}` registered twice",
            descriptor.name()
        );
        self.descriptors.push(descriptor);
        self
    }

    /// Look up a projection by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProjectionDescriptor> {
        self.descriptors.iter().find(|d| d.name() == name)
    }

    /// All projections fed by the given aggregate kind.
    pub fn for_aggregate<'a>(
        &'a self,
        aggregate: &'a str,
    ) -> impl Iterator<Item = &'a ProjectionDescriptor> {
        self.descriptors
            .iter()
            .filter(move |d| d.aggregate() == aggregate)
    }

    /// Names of every registered projection.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.iter().map(ProjectionDescriptor::name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
