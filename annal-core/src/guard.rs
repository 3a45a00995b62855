//! Session guard: validates that a command's session token refers to a
//! live session before the handler runs.
//!
//! The guard reads through the same unit of work the handler will write
//! into, so a session closed mid-flight cannot race past validation
//! undetected any further than the storage layer's own guarantees allow.
//! It has no side effects beyond the read.

use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::CommandError,
    session::Session,
    store::{StoreError, UnitOfWork},
};

/// Why a session failed to resolve.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("no session id was supplied")]
    MissingSessionId,
    #[error("session id does not resolve to any session")]
    UnknownSession,
    #[error("session is closed")]
    SessionClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GuardError> for CommandError {
    fn from(error: GuardError) -> Self {
        match error {
            GuardError::MissingSessionId => Self::MissingSessionId,
            GuardError::UnknownSession => Self::InvalidSessionId,
            GuardError::SessionClosed => Self::SessionClosed,
            GuardError::Store(_) => Self::Internal,
        }
    }
}

/// Resolve an active (non-closed) session.
///
/// # Errors
///
/// Returns the specific [`GuardError`] for a missing id, an unknown id, a
/// closed session, or an underlying store failure.
pub async fn resolve_active<U: UnitOfWork>(
    uow: &U,
    session_id: Option<Uuid>,
) -> Result<Session, GuardError> {
    let id = session_id.ok_or(GuardError::MissingSessionId)?;
    let session: Session = uow.load(id).await?.ok_or(GuardError::UnknownSession)?;
    if session.closed {
        return Err(GuardError::SessionClosed);
    }
    Ok(session)
}

/// Whether the given session id resolves to an active session.
///
/// # Errors
///
/// Returns [`StoreError`] only for storage failures; every validation
/// outcome maps to the boolean.
pub async fn validate<U: UnitOfWork>(
    uow: &U,
    session_id: Option<Uuid>,
) -> Result<bool, StoreError> {
    match resolve_active(uow, session_id).await {
        Ok(_) => Ok(true),
        Err(GuardError::Store(error)) => Err(error),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{CreateSession, EndSession},
        store::EventStore,
        test,
    };

    #[tokio::test]
    async fn missing_id_is_rejected() {
        let pipeline = test::pipeline();
        let uow = pipeline.store().begin();

        let error = resolve_active(&uow, None).await.unwrap_err();
        assert!(matches!(error, GuardError::MissingSessionId));
        assert!(!validate(&uow, None).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let pipeline = test::pipeline();
        let uow = pipeline.store().begin();

        let error = resolve_active(&uow, Some(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(error, GuardError::UnknownSession));
    }

    #[tokio::test]
    async fn open_session_resolves() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;
        let uow = pipeline.store().begin();

        let session = resolve_active(&uow, Some(session_id)).await.unwrap();
        assert_eq!(session.session_id, session_id);
        assert!(validate(&uow, Some(session_id)).await.unwrap());
    }

    #[tokio::test]
    async fn closed_session_is_rejected() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;
        pipeline
            .execute_in_session(&EndSession {
                session_id: Some(session_id),
                reason: "test".to_string(),
            })
            .await;

        let uow = pipeline.store().begin();
        let error = resolve_active(&uow, Some(session_id)).await.unwrap_err();
        assert!(matches!(error, GuardError::SessionClosed));
        assert!(!validate(&uow, Some(session_id)).await.unwrap());
    }

    #[test]
    fn guard_errors_map_to_command_errors() {
        assert_eq!(
            CommandError::from(GuardError::MissingSessionId),
            CommandError::MissingSessionId
        );
        assert_eq!(
            CommandError::from(GuardError::UnknownSession),
            CommandError::InvalidSessionId
        );
        assert_eq!(
            CommandError::from(GuardError::SessionClosed),
            CommandError::SessionClosed
        );
        assert_eq!(
            CommandError::from(GuardError::Store(StoreError::UnknownProjection {
                name: "user".to_string()
            })),
            CommandError::Internal
        );
    }

    #[tokio::test]
    async fn guard_reads_within_the_callers_unit_of_work() {
        // The guard sees committed state only; a session created but not yet
        // committed elsewhere does not resolve.
        let pipeline = test::pipeline();
        let result = pipeline.execute(&CreateSession).await;
        let session_id: Uuid =
            serde_json::from_value(result.data().unwrap().clone()).unwrap();

        let uow = pipeline.store().begin();
        assert!(validate(&uow, Some(session_id)).await.unwrap());
    }
}
