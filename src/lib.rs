#![doc = include_str!("../README.md")]

pub use annal_core::{
    error::{CommandError, CommandResult},
    event::{AggregateEvent, RecordedEvent},
    guard,
    hash::{Argon2Hashing, HashError, PasswordHashing},
    pipeline::{
        Cmd, Command, CommandPipeline, Execute, ExecuteInSession, HandlerContext, HandlerError,
    },
    projection::{Document, Projection, ProjectionDescriptor, ProjectionError, ProjectionRegistry},
    projections,
    provider::{Clock, IdProvider, RandomIds, SystemClock},
    rebuild::RebuildProjections,
    session::{CreateSession, EndSession, Session, SessionEvent, SessionProjection},
    unique_indexes,
    user::{
        AddPasswordAuthentication, ChangeUserEmail, CreateUser, DeactivateUser, User, UserEvent,
        UserListItem, UserProjection, list_users,
    },
};

pub mod store {
    pub use annal_core::store::{
        CommitError, EventStore, StoreError, UniqueIndex, UnitOfWork, inmemory,
    };
}

#[cfg(feature = "test-util")]
pub use annal_core::test;
