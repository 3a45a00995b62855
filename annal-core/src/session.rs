//! Session aggregate: document, events, projection, and command handlers.
//!
//! A session is an authenticated client context. It is created without any
//! prior session, accumulates activity events while it is used, and is
//! closed exactly once, never deleted. Expiry by wall-clock time is
//! informational only and not enforced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::CommandResult,
    event::AggregateEvent,
    pipeline::{Cmd, Execute, ExecuteInSession, HandlerContext, HandlerError},
    projection::{Document, Projection},
    store::UnitOfWork,
};

/// Projected view of one session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Only ever moves forward; bumped by every command executed in the
    /// session.
    pub last_accessed_at: DateTime<Utc>,
    /// Once `true`, never transitions back.
    pub closed: bool,
}

impl Document for Session {
    const KIND: &'static str = "session";

    fn id(&self) -> Uuid {
        self.session_id
    }
}

/// Everything that can happen on a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Created {
        session_id: Uuid,
        created_at: DateTime<Utc>,
    },
    ActivityRecorded {
        session_id: Uuid,
        accessed_at: DateTime<Utc>,
    },
    Ended {
        session_id: Uuid,
        reason: String,
        ended_at: DateTime<Utc>,
    },
}

impl AggregateEvent for SessionEvent {
    const AGGREGATE: &'static str = "session";

    fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::ActivityRecorded { .. } => "activity-recorded",
            Self::Ended { .. } => "ended",
        }
    }
}

pub struct SessionProjection;

impl Projection for SessionProjection {
    type Doc = Session;
    type Event = SessionEvent;

    fn create(event: &SessionEvent) -> Option<Session> {
        match event {
            SessionEvent::Created {
                session_id,
                created_at,
            } => Some(Session {
                session_id: *session_id,
                created_at: *created_at,
                last_accessed_at: *created_at,
                closed: false,
            }),
            SessionEvent::ActivityRecorded { .. } | SessionEvent::Ended { .. } => None,
        }
    }

    fn apply(session: Session, event: &SessionEvent) -> Session {
        match event {
            SessionEvent::Created { .. } => {
                debug_assert!(false, "`created` can only start a session stream");
                session
            }
            SessionEvent::ActivityRecorded { accessed_at, .. } => Session {
                last_accessed_at: *accessed_at,
                ..session
            },
            SessionEvent::Ended { ended_at, .. } => Session {
                last_accessed_at: *ended_at,
                closed: true,
                ..session
            },
        }
    }
}

/// Open a new session. The only command that requires no prior session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateSession;

impl Cmd for CreateSession {
    const NAME: &'static str = "create-session";
}

impl Execute for CreateSession {
    async fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandResult, HandlerError> {
        let session_id = ctx.ids.new_id();
        uow.start_stream(
            session_id,
            SessionEvent::Created {
                session_id,
                created_at: ctx.clock.now(),
            },
        )?;
        Ok(CommandResult::success_with(serde_json::json!(session_id)))
    }
}

/// Close the acting session.
#[derive(Debug, Clone)]
pub struct EndSession {
    pub session_id: Option<Uuid>,
    /// Free-form reason recorded on the event, e.g. `"UserRequest"`.
    pub reason: String,
}

impl Cmd for EndSession {
    const NAME: &'static str = "end-session";
}

impl ExecuteInSession for EndSession {
    fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    async fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        session: &Session,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandResult, HandlerError> {
        uow.append(
            session.session_id,
            SessionEvent::Ended {
                session_id: session.session_id,
                reason: self.reason.clone(),
                ended_at: ctx.clock.now(),
            },
        )?;
        Ok(CommandResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::CommandError, store::EventStore, test};

    fn fold(events: &[SessionEvent]) -> Session {
        let mut iter = events.iter();
        let first = iter.next().expect("at least one event");
        let mut session = SessionProjection::create(first).expect("creating event");
        for event in iter {
            session = SessionProjection::apply(session, event);
        }
        session
    }

    #[test]
    fn created_session_is_open_with_equal_timestamps() {
        let id = Uuid::new_v4();
        let at = Utc::now();
        let session = fold(&[SessionEvent::Created {
            session_id: id,
            created_at: at,
        }]);

        assert_eq!(session.session_id, id);
        assert_eq!(session.created_at, at);
        assert_eq!(session.last_accessed_at, at);
        assert!(!session.closed);
    }

    #[test]
    fn activity_moves_last_accessed_forward() {
        let id = Uuid::new_v4();
        let at = Utc::now();
        let later = at + chrono::Duration::seconds(5);
        let session = fold(&[
            SessionEvent::Created {
                session_id: id,
                created_at: at,
            },
            SessionEvent::ActivityRecorded {
                session_id: id,
                accessed_at: later,
            },
        ]);

        assert_eq!(session.created_at, at);
        assert_eq!(session.last_accessed_at, later);
    }

    #[test]
    fn ended_session_is_closed_and_stays_closed() {
        let id = Uuid::new_v4();
        let at = Utc::now();
        let ended = at + chrono::Duration::seconds(10);
        let session = fold(&[
            SessionEvent::Created {
                session_id: id,
                created_at: at,
            },
            SessionEvent::Ended {
                session_id: id,
                reason: "UserRequest".to_string(),
                ended_at: ended,
            },
            // Late activity (e.g. the closing command's own bookkeeping)
            // must not reopen the session.
            SessionEvent::ActivityRecorded {
                session_id: id,
                accessed_at: ended + chrono::Duration::seconds(1),
            },
        ]);

        assert!(session.closed);
        assert_eq!(session.last_accessed_at, ended + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn create_session_returns_the_new_id() {
        let pipeline = test::pipeline();
        let result = pipeline.execute(&CreateSession).await;

        assert!(result.is_success());
        let id: Uuid = serde_json::from_value(result.data().unwrap().clone()).unwrap();
        assert_ne!(id, Uuid::nil());
    }

    #[tokio::test]
    async fn end_session_closes_the_acting_session() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;

        let result = pipeline
            .execute_in_session(&EndSession {
                session_id: Some(session_id),
                reason: "UserRequest".to_string(),
            })
            .await;
        assert!(result.is_success());

        let uow = pipeline.store().begin();
        let session: Session = uow.load(session_id).await.unwrap().unwrap();
        assert!(session.closed);
    }

    #[tokio::test]
    async fn end_session_twice_reports_session_closed() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;
        let end = EndSession {
            session_id: Some(session_id),
            reason: "UserRequest".to_string(),
        };

        assert!(pipeline.execute_in_session(&end).await.is_success());
        let second = pipeline.execute_in_session(&end).await;
        assert_eq!(second.error(), Some(&CommandError::SessionClosed));
    }
}
