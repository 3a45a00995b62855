//! In-memory event store: the reference [`EventStore`] implementation.
//!
//! Streams are vectors of recorded events; projected documents are folded
//! inline at commit time under a single write lock, so a commit is atomic
//! with respect to every reader. Unique indexes declared on the store are
//! enforced during that same commit, making this store the final arbiter
//! for the racy pre-check queries handlers perform.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, RwLock},
};

use uuid::Uuid;

use crate::{
    event::{AggregateEvent, RecordedEvent},
    projection::{Document, ProjectionRegistry},
    provider::{Clock, SystemClock},
    store::{CommitError, EventStore, StoreError, UniqueIndex, UnitOfWork},
};

#[derive(Default)]
struct Inner {
    streams: HashMap<Uuid, Vec<RecordedEvent>>,
    /// Projected documents, keyed by document kind then stream id. `BTreeMap`
    /// keeps query iteration in id order.
    documents: HashMap<&'static str, BTreeMap<Uuid, serde_json::Value>>,
}

/// Thread-safe in-memory event store.
///
/// `Clone` is cheap for the shared state; the registry and index
/// declarations are immutable after construction.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    registry: ProjectionRegistry,
    unique: Vec<UniqueIndex>,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Create a store maintaining the given projections inline.
    #[must_use]
    pub fn new(registry: ProjectionRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            registry,
            unique: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Declare a unique constraint enforced at commit time.
    #[must_use]
    pub fn with_unique_index(mut self, index: UniqueIndex) -> Self {
        self.unique.push(index);
        self
    }

    /// Replace the clock used to stamp `recorded_at` on committed events.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The full event history of one stream, in append order.
    #[must_use]
    pub fn stream(&self, stream_id: Uuid) -> Vec<RecordedEvent> {
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        inner.streams.get(&stream_id).cloned().unwrap_or_default()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("projections", &self.registry)
            .field("unique", &self.unique)
            .finish()
    }
}

impl EventStore for Store {
    type Uow = MemoryUnitOfWork;

    fn begin(&self) -> MemoryUnitOfWork {
        MemoryUnitOfWork {
            store: self.clone(),
            pending: Vec::new(),
        }
    }

    fn projections(&self) -> &ProjectionRegistry {
        &self.registry
    }

    #[tracing::instrument(skip(self))]
    fn rebuild<'a>(
        &'a self,
        projection: &'a str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send + 'a {
        let result = (|| {
            let descriptor =
                self.registry
                    .get(projection)
                    .ok_or_else(|| StoreError::UnknownProjection {
                        name: projection.to_string(),
                    })?;

            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let mut rebuilt: BTreeMap<Uuid, serde_json::Value> = BTreeMap::new();
            for (stream_id, events) in &inner.streams {
                let mut current: Option<serde_json::Value> = None;
                for event in events
                    .iter()
                    .filter(|e| e.aggregate == descriptor.aggregate())
                {
                    current = Some(descriptor.fold(current.take(), event)?);
                }
                if let Some(doc) = current {
                    rebuilt.insert(*stream_id, doc);
                }
            }

            let documents = rebuilt.len() as u64;
            inner.documents.insert(descriptor.name(), rebuilt);
            tracing::debug!(documents, "projection rematerialized from event history");
            Ok(documents)
        })();

        std::future::ready(result)
    }
}

struct StagedEvent {
    stream_id: Uuid,
    aggregate: &'static str,
    kind: &'static str,
    data: serde_json::Value,
    starts_stream: bool,
}

/// Unit of work over the in-memory store.
///
/// Events are buffered locally and only reach the shared state at commit.
/// Dropping the unit of work without committing discards the buffer.
pub struct MemoryUnitOfWork {
    store: Store,
    pending: Vec<StagedEvent>,
}

impl MemoryUnitOfWork {
    fn stage<E: AggregateEvent>(
        &mut self,
        stream_id: Uuid,
        event: E,
        starts_stream: bool,
    ) -> Result<(), StoreError> {
        let kind = event.kind();
        let data = serde_json::to_value(&event).map_err(|source| StoreError::EncodeEvent {
            aggregate: E::AGGREGATE,
            kind,
            source,
        })?;
        tracing::trace!(aggregate = E::AGGREGATE, kind, %stream_id, "event staged");
        self.pending.push(StagedEvent {
            stream_id,
            aggregate: E::AGGREGATE,
            kind,
            data,
            starts_stream,
        });
        Ok(())
    }

    fn commit_now(self) -> Result<(), CommitError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let now = self.store.clock.now();
        let mut inner = self
            .store
            .inner
            .write()
            .expect("in-memory store lock poisoned");

        for staged in &self.pending {
            if staged.starts_stream && inner.streams.contains_key(&staged.stream_id) {
                return Err(StoreError::StreamExists {
                    stream_id: staged.stream_id,
                }
                .into());
            }
        }

        // Fold staged events into scratch copies of the affected documents
        // before anything is made visible.
        let mut next_sequence: HashMap<Uuid, u64> = HashMap::new();
        let mut recorded = Vec::with_capacity(self.pending.len());
        let mut scratch: HashMap<(&'static str, Uuid), serde_json::Value> = HashMap::new();

        for staged in &self.pending {
            let sequence = next_sequence.entry(staged.stream_id).or_insert_with(|| {
                inner
                    .streams
                    .get(&staged.stream_id)
                    .map_or(0, |s| s.len() as u64)
            });
            let event = RecordedEvent {
                stream_id: staged.stream_id,
                aggregate: staged.aggregate.to_string(),
                sequence: *sequence,
                kind: staged.kind.to_string(),
                data: staged.data.clone(),
                recorded_at: now,
            };
            *sequence += 1;

            for descriptor in self.store.registry.for_aggregate(staged.aggregate) {
                let key = (descriptor.name(), staged.stream_id);
                let current = scratch.get(&key).cloned().or_else(|| {
                    inner
                        .documents
                        .get(descriptor.name())
                        .and_then(|docs| docs.get(&staged.stream_id))
                        .cloned()
                });
                let next = descriptor.fold(current, &event).map_err(StoreError::from)?;
                scratch.insert(key, next);
            }

            recorded.push(event);
        }

        // Unique indexes are the final arbiter: check updated documents
        // against the committed state and against each other.
        for index in &self.store.unique {
            let mut batch_keys: HashMap<&str, Uuid> = HashMap::new();
            for ((kind, id), value) in &scratch {
                if *kind != index.document() {
                    continue;
                }
                let Some(key) = index.key_of(value) else {
                    continue;
                };
                if let Some(previous) = batch_keys.insert(key, *id)
                    && previous != *id
                {
                    return Err(CommitError::UniqueViolation {
                        constraint: index.constraint().to_string(),
                    });
                }
                let clash = inner
                    .documents
                    .get(index.document())
                    .is_some_and(|docs| {
                        docs.iter().any(|(existing_id, existing)| {
                            existing_id != id
                                && !scratch.contains_key(&(index.document(), *existing_id))
                                && index.key_of(existing) == Some(key)
                        })
                    });
                if clash {
                    return Err(CommitError::UniqueViolation {
                        constraint: index.constraint().to_string(),
                    });
                }
            }
        }

        let events_committed = recorded.len();
        for event in recorded {
            inner.streams.entry(event.stream_id).or_default().push(event);
        }
        for ((kind, id), value) in scratch {
            inner.documents.entry(kind).or_default().insert(id, value);
        }
        drop(inner);

        tracing::debug!(events_committed, "unit of work committed");
        Ok(())
    }
}

impl UnitOfWork for MemoryUnitOfWork {
    fn load<'a, D: Document>(
        &'a self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<D>, StoreError>> + Send + 'a {
        let result = (|| {
            let inner = self
                .store
                .inner
                .read()
                .expect("in-memory store lock poisoned");
            match inner.documents.get(D::KIND).and_then(|docs| docs.get(&id)) {
                None => Ok(None),
                Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(
                    |source| StoreError::DecodeDocument {
                        kind: D::KIND,
                        id,
                        source,
                    },
                ),
            }
        })();

        std::future::ready(result)
    }

    fn find<'a, D, F>(
        &'a self,
        mut predicate: F,
    ) -> impl Future<Output = Result<Option<D>, StoreError>> + Send + 'a
    where
        D: Document,
        F: FnMut(&D) -> bool + Send + 'a,
    {
        let result = (|| {
            let inner = self
                .store
                .inner
                .read()
                .expect("in-memory store lock poisoned");
            if let Some(docs) = inner.documents.get(D::KIND) {
                for (id, value) in docs {
                    let doc: D = serde_json::from_value(value.clone()).map_err(|source| {
                        StoreError::DecodeDocument {
                            kind: D::KIND,
                            id: *id,
                            source,
                        }
                    })?;
                    if predicate(&doc) {
                        return Ok(Some(doc));
                    }
                }
            }
            Ok(None)
        })();

        std::future::ready(result)
    }

    fn list<'a, D: Document>(
        &'a self,
    ) -> impl Future<Output = Result<Vec<D>, StoreError>> + Send + 'a {
        let result = (|| {
            let inner = self
                .store
                .inner
                .read()
                .expect("in-memory store lock poisoned");
            let Some(docs) = inner.documents.get(D::KIND) else {
                return Ok(Vec::new());
            };
            docs.iter()
                .map(|(id, value)| {
                    serde_json::from_value(value.clone()).map_err(|source| {
                        StoreError::DecodeDocument {
                            kind: D::KIND,
                            id: *id,
                            source,
                        }
                    })
                })
                .collect()
        })();

        std::future::ready(result)
    }

    fn start_stream<E: AggregateEvent>(
        &mut self,
        stream_id: Uuid,
        event: E,
    ) -> Result<(), StoreError> {
        self.stage(stream_id, event, true)
    }

    fn append<E: AggregateEvent>(&mut self, stream_id: Uuid, event: E) -> Result<(), StoreError> {
        self.stage(stream_id, event, false)
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(discarded = self.pending.len(), "pending events discarded");
        }
        self.pending.clear();
    }

    fn commit(self) -> impl Future<Output = Result<(), CommitError>> + Send {
        std::future::ready(self.commit_now())
    }
}
