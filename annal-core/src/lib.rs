//! Core of an event-sourced session/user management backend.
//!
//! Commands mutate state by appending domain events to per-entity streams;
//! read models are documents folded from those streams, inline with the
//! commit. This crate provides:
//!
//! - [`pipeline`] - Command orchestration (`CommandPipeline`, handler traits)
//! - [`guard`] - Session validation before a command runs
//! - [`projection`] - Fold definitions and the static projection registry
//! - [`store`] - Storage abstraction and the in-memory reference store
//! - [`session`] / [`user`] - The two aggregates and their command handlers
//! - [`rebuild`] - Replay-based projection repair
//! - [`provider`] / [`hash`] - Pluggable clock, identity, and hashing
//!
//! Most users should depend on the `annal` facade crate instead.

pub mod error;
pub mod event;
pub mod guard;
pub mod hash;
pub mod pipeline;
pub mod projection;
pub mod provider;
pub mod rebuild;
pub mod session;
pub mod store;
pub mod user;



use projection::ProjectionRegistry;
use session::SessionProjection;
use store::UniqueIndex;
use user::{User, UserProjection};

/// The registry of every projection this domain maintains.
///
/// Built once at store construction; the rebuild engine enumerates it for
/// "rebuild all".
#[must_use]
pub fn projections() -> ProjectionRegistry {
    ProjectionRegistry::new()
        .register::<SessionProjection>()
        .register::<UserProjection>()
}

/// Unique constraints every storage backend must enforce on projected
/// documents: user names and emails are globally unique.
#[must_use]
pub fn unique_indexes() -> Vec<UniqueIndex> {
    vec![
        UniqueIndex::new::<User>("user_name"),
        UniqueIndex::new::<User>("email"),
    ]
}
