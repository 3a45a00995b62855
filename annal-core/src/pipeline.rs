//! The command pipeline: orchestration of one command execution.
//!
//! Every command runs inside exactly one unit of work, acquired at entry and
//! committed or dropped before returning. Two execution modes exist:
//!
//! - [`CommandPipeline::execute`] - no session required; used only by
//!   session creation. Commits only if the handler reports success.
//! - [`CommandPipeline::execute_in_session`] - resolves the acting session
//!   through the guard first, discards the handler's staged events on
//!   failure, records session activity, and commits on both paths so the
//!   bookkeeping survives. A unique-constraint violation at commit time is
//!   surfaced as a race-condition failure.
//!
//! Handlers return failures as values; only truly unexpected conditions
//! travel as errors, and this module is the single place they are caught
//! and converted to an internal-error result.

use std::{future::Future, sync::Arc};

use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::{CommandError, CommandResult},
    guard::{self, GuardError},
    hash::{Argon2Hashing, HashError, PasswordHashing},
    provider::{Clock, IdProvider, RandomIds, SystemClock},
    rebuild::RebuildProjections,
    session::{CreateSession, EndSession, Session, SessionEvent},
    store::{EventStore, StoreError, UnitOfWork},
    user::{AddPasswordAuthentication, ChangeUserEmail, CreateUser, DeactivateUser},
};

/// Unexpected failure inside a handler.
///
/// Business-rule violations are not errors; handlers return those as
/// [`CommandResult`] failures. This type exists for storage and capability
/// failures the handler cannot meaningfully react to.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Capabilities handed to every handler: time, identity, and hashing.
pub struct HandlerContext<'a> {
    pub clock: &'a dyn Clock,
    pub ids: &'a dyn IdProvider,
    pub hasher: &'a dyn PasswordHashing,
}

/// A command: a transient request-to-act.
///
/// `validate` checks the input's shape (lengths, formats) before any
/// storage work; state-dependent preconditions belong in the handler.
pub trait Cmd: Send + Sync {
    /// Name used in structured logs.
    const NAME: &'static str;

    /// Validate the command input.
    ///
    /// # Errors
    ///
    /// Returns the caller-facing message of the first violated rules,
    /// joined with `", "` when several fields fail.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Handler for a command that requires no session.
pub trait Execute: Cmd {
    fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        ctx: &HandlerContext<'_>,
    ) -> impl Future<Output = Result<CommandResult, HandlerError>> + Send;
}

/// Handler for a command that runs inside a validated session.
pub trait ExecuteInSession: Cmd {
    /// The acting session's id, if the caller supplied one.
    fn session_id(&self) -> Option<Uuid>;

    fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        session: &Session,
        ctx: &HandlerContext<'_>,
    ) -> impl Future<Output = Result<CommandResult, HandlerError>> + Send;
}

/// The closed set of commands this core accepts.
///
/// Dispatch is an exhaustive match; adding a command without routing it is
/// a compile error.
#[derive(Debug, Clone)]
pub enum Command {
    CreateSession(CreateSession),
    EndSession(EndSession),
    CreateUser(CreateUser),
    AddPasswordAuthentication(AddPasswordAuthentication),
    DeactivateUser(DeactivateUser),
    ChangeUserEmail(ChangeUserEmail),
    RebuildProjections(RebuildProjections),
}

/// Orchestrator for command execution against one store.
pub struct CommandPipeline<S> {
    store: S,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdProvider>,
    hasher: Arc<dyn PasswordHashing>,
}

impl<S: EventStore> CommandPipeline<S> {
    /// Pipeline with production providers: system clock, random UUIDs,
    /// Argon2id hashing.
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
            hasher: Arc::new(Argon2Hashing),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdProvider>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn PasswordHashing>) -> Self {
        self.hasher = hasher;
        self
    }

    /// The store this pipeline executes against.
    pub const fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn context(&self) -> HandlerContext<'_> {
        HandlerContext {
            clock: self.clock.as_ref(),
            ids: self.ids.as_ref(),
            hasher: self.hasher.as_ref(),
        }
    }

    /// Route a command to its execution mode.
    pub async fn dispatch(&self, command: &Command) -> CommandResult {
        match command {
            Command::CreateSession(cmd) => self.execute(cmd).await,
            Command::EndSession(cmd) => self.execute_in_session(cmd).await,
            Command::CreateUser(cmd) => self.execute_in_session(cmd).await,
            Command::AddPasswordAuthentication(cmd) => self.execute_in_session(cmd).await,
            Command::DeactivateUser(cmd) => self.execute_in_session(cmd).await,
            Command::ChangeUserEmail(cmd) => self.execute_in_session(cmd).await,
            Command::RebuildProjections(cmd) => self.rebuild_projections(cmd).await,
        }
    }

    /// Execute a command that requires no session.
    ///
    /// The unit of work is committed only if the handler reports success.
    pub async fn execute<C: Execute>(&self, cmd: &C) -> CommandResult {
        tracing::info!(command = C::NAME, "executing command");

        if let Err(message) = cmd.validate() {
            tracing::warn!(command = C::NAME, %message, "command validation failed");
            return CommandResult::failure(CommandError::Validation(message));
        }

        let mut uow = self.store.begin();
        let result = match cmd.run(&mut uow, &self.context()).await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(command = C::NAME, %error, "unexpected error executing command");
                return CommandResult::failure(CommandError::Internal);
            }
        };

        if result.is_success() {
            if let Err(error) = uow.commit().await {
                tracing::error!(command = C::NAME, %error, "commit failed");
                return CommandResult::failure(CommandError::Internal);
            }
            tracing::info!(command = C::NAME, "command executed successfully");
        } else {
            tracing::warn!(
                command = C::NAME,
                error = %result.error_message().unwrap_or_default(),
                "command failed"
            );
        }

        result
    }

    /// Execute a command inside a validated session, resolving the session
    /// through the guard.
    pub async fn execute_in_session<C: ExecuteInSession>(&self, cmd: &C) -> CommandResult {
        self.execute_in_session_with(cmd, None).await
    }

    /// Execute a command inside a validated session, reusing an already
    /// resolved session snapshot.
    ///
    /// The HTTP layer may have resolved the session earlier in the request;
    /// passing it here avoids a second query. Without one, the session is
    /// loaded through the guard inside this unit of work. A closed
    /// pre-resolved session is still rejected; the caller's copy may be
    /// stale.
    pub async fn execute_in_session_with<C: ExecuteInSession>(
        &self,
        cmd: &C,
        resolved: Option<&Session>,
    ) -> CommandResult {
        tracing::info!(
            command = C::NAME,
            session_id = ?cmd.session_id(),
            "executing command in session"
        );

        if let Err(message) = cmd.validate() {
            tracing::warn!(command = C::NAME, %message, "command validation failed");
            return CommandResult::failure(CommandError::Validation(message));
        }

        let mut uow = self.store.begin();
        let session = match resolved {
            Some(session) if session.closed => {
                tracing::warn!(
                    command = C::NAME,
                    session_id = %session.session_id,
                    "pre-resolved session is closed"
                );
                return CommandResult::failure(CommandError::SessionClosed);
            }
            Some(session) => session.clone(),
            None => match resolve_session(&uow, C::NAME, cmd.session_id()).await {
                Ok(session) => session,
                Err(failure) => return failure,
            },
        };

        let result = match cmd.run(&mut uow, &session, &self.context()).await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(command = C::NAME, %error, "unexpected error executing command");
                CommandResult::failure(CommandError::Internal)
            }
        };

        if !result.is_success() {
            // A failed handler must leave no partial effects.
            uow.discard_pending();
            tracing::warn!(
                command = C::NAME,
                error = %result.error_message().unwrap_or_default(),
                "command failed"
            );
        }

        self.finish_in_session(uow, &session, C::NAME, result).await
    }

    /// Stage the activity bookkeeping and commit, translating commit-time
    /// failures. Shared by every session-validated execution path.
    pub(crate) async fn finish_in_session(
        &self,
        mut uow: S::Uow,
        session: &Session,
        command: &'static str,
        result: CommandResult,
    ) -> CommandResult {
        if let Err(error) = uow.append(
            session.session_id,
            SessionEvent::ActivityRecorded {
                session_id: session.session_id,
                accessed_at: self.clock.now(),
            },
        ) {
            tracing::error!(command, %error, "failed to record session activity");
            if result.is_success() {
                return CommandResult::failure(CommandError::Internal);
            }
        }

        match uow.commit().await {
            Ok(()) => {
                if result.is_success() {
                    tracing::info!(
                        command,
                        session_id = %session.session_id,
                        "command executed successfully"
                    );
                }
                result
            }
            Err(error) if error.is_unique_violation() => {
                tracing::warn!(command, %error, "race condition detected at commit");
                CommandResult::failure(CommandError::RaceCondition)
            }
            Err(error) => {
                tracing::error!(command, %error, "commit failed");
                CommandResult::failure(CommandError::Internal)
            }
        }
    }
}

/// Resolve the acting session for a command, logging and converting guard
/// failures to the command result contract.
pub(crate) async fn resolve_session<U: UnitOfWork>(
    uow: &U,
    command: &'static str,
    session_id: Option<Uuid>,
) -> Result<Session, CommandResult> {
    match guard::resolve_active(uow, session_id).await {
        Ok(session) => Ok(session),
        Err(GuardError::Store(error)) => {
            tracing::error!(command, %error, "session lookup failed");
            Err(CommandResult::failure(CommandError::Internal))
        }
        Err(error) => {
            tracing::warn!(command, %error, "session validation failed");
            Err(CommandResult::failure(error.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::EventStore,
        test,
        user::{User, UserEvent},
    };

    /// Command whose handler stages an event and then reports a business
    /// failure; used to prove the discard semantics.
    struct StageThenFail {
        session_id: Option<Uuid>,
        user_id: Uuid,
    }

    impl Cmd for StageThenFail {
        const NAME: &'static str = "stage-then-fail";
    }

    impl ExecuteInSession for StageThenFail {
        fn session_id(&self) -> Option<Uuid> {
            self.session_id
        }

        async fn run<U: UnitOfWork>(
            &self,
            uow: &mut U,
            session: &Session,
            ctx: &HandlerContext<'_>,
        ) -> Result<CommandResult, HandlerError> {
            uow.start_stream(
                self.user_id,
                UserEvent::Created {
                    session_id: session.session_id,
                    user_id: self.user_id,
                    user_name: "ghost".to_string(),
                    email: "ghost@example.com".to_string(),
                    created_at: ctx.clock.now(),
                },
            )?;
            Ok(CommandResult::failure(CommandError::Validation(
                "rejected after staging".to_string(),
            )))
        }
    }

    /// Command whose handler errors out; used to prove internal-error
    /// conversion.
    struct Explode {
        session_id: Option<Uuid>,
    }

    impl Cmd for Explode {
        const NAME: &'static str = "explode";
    }

    impl ExecuteInSession for Explode {
        fn session_id(&self) -> Option<Uuid> {
            self.session_id
        }

        async fn run<U: UnitOfWork>(
            &self,
            _uow: &mut U,
            _session: &Session,
            _ctx: &HandlerContext<'_>,
        ) -> Result<CommandResult, HandlerError> {
            Err(HandlerError::Store(StoreError::UnknownProjection {
                name: "boom".to_string(),
            }))
        }
    }

    struct RejectedInput;

    impl Cmd for RejectedInput {
        const NAME: &'static str = "rejected-input";

        fn validate(&self) -> Result<(), String> {
            Err("Input is required".to_string())
        }
    }

    impl Execute for RejectedInput {
        async fn run<U: UnitOfWork>(
            &self,
            _uow: &mut U,
            _ctx: &HandlerContext<'_>,
        ) -> Result<CommandResult, HandlerError> {
            unreachable!("validation must reject the command first")
        }
    }

    #[tokio::test]
    async fn validation_runs_before_the_handler() {
        let pipeline = test::pipeline();
        let result = pipeline.execute(&RejectedInput).await;
        assert_eq!(
            result.error(),
            Some(&CommandError::Validation("Input is required".to_string()))
        );
    }

    #[tokio::test]
    async fn missing_session_fails_fast() {
        let pipeline = test::pipeline();
        let result = pipeline
            .execute_in_session(&Explode { session_id: None })
            .await;
        assert_eq!(result.error(), Some(&CommandError::MissingSessionId));
    }

    #[tokio::test]
    async fn unknown_session_fails_fast() {
        let pipeline = test::pipeline();
        let result = pipeline
            .execute_in_session(&Explode {
                session_id: Some(Uuid::new_v4()),
            })
            .await;
        assert_eq!(result.error(), Some(&CommandError::InvalidSessionId));
    }

    #[tokio::test]
    async fn handler_error_becomes_internal_failure() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;

        let result = pipeline
            .execute_in_session(&Explode {
                session_id: Some(session_id),
            })
            .await;
        assert_eq!(result.error(), Some(&CommandError::Internal));
    }

    #[tokio::test]
    async fn failed_handler_leaves_no_partial_effects_but_activity_persists() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;
        let user_id = Uuid::new_v4();

        let result = pipeline
            .execute_in_session(&StageThenFail {
                session_id: Some(session_id),
                user_id,
            })
            .await;
        assert!(!result.is_success());

        // The staged user event was discarded...
        assert!(pipeline.store().stream(user_id).is_empty());
        let uow = pipeline.store().begin();
        assert!(uow.load::<User>(user_id).await.unwrap().is_none());

        // ...but the session stream gained an activity event.
        let session_events = pipeline.store().stream(session_id);
        assert_eq!(
            session_events.last().map(|e| e.kind.as_str()),
            Some("activity-recorded")
        );
    }

    #[tokio::test]
    async fn activity_is_recorded_on_success_too() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;
        let before = pipeline.store().stream(session_id).len();

        pipeline
            .execute_in_session(&EndSession {
                session_id: Some(session_id),
                reason: "done".to_string(),
            })
            .await;

        let events = pipeline.store().stream(session_id);
        // `ended` plus the bookkeeping event.
        assert_eq!(events.len(), before + 2);
    }

    #[tokio::test]
    async fn pre_resolved_session_skips_the_query_but_not_the_closed_check() {
        let pipeline = test::pipeline();
        let session_id = test::open_session(&pipeline).await;
        let uow = pipeline.store().begin();
        let mut session: Session = uow.load(session_id).await.unwrap().unwrap();

        let ok = pipeline
            .execute_in_session_with(
                &EndSession {
                    session_id: Some(session_id),
                    reason: "pre-resolved".to_string(),
                },
                Some(&session),
            )
            .await;
        assert!(ok.is_success());

        session.closed = true;
        let rejected = pipeline
            .execute_in_session_with(
                &EndSession {
                    session_id: Some(session_id),
                    reason: "again".to_string(),
                },
                Some(&session),
            )
            .await;
        assert_eq!(rejected.error(), Some(&CommandError::SessionClosed));
    }

    #[tokio::test]
    async fn dispatch_routes_every_command_kind() {
        let pipeline = test::pipeline();

        let created = pipeline
            .dispatch(&Command::CreateSession(CreateSession))
            .await;
        assert!(created.is_success());
        let session_id: Uuid =
            serde_json::from_value(created.data().unwrap().clone()).unwrap();

        let ended = pipeline
            .dispatch(&Command::EndSession(EndSession {
                session_id: Some(session_id),
                reason: "dispatch".to_string(),
            }))
            .await;
        assert!(ended.is_success());
    }
}
