//! Projection rebuild engine: replay a projection's full backing event
//! history and rematerialize every affected document.
//!
//! This is an operational/repair command, access-controlled like any other:
//! it requires a valid, non-closed session. Rebuilding is all-or-nothing per
//! invocation: the first failing projection aborts the command and the
//! failure is surfaced to the caller.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{
    error::{CommandError, CommandResult},
    pipeline::{Cmd, CommandPipeline, resolve_session},
    store::EventStore,
};

/// Rebuild one projection by name, or every registered projection.
#[derive(Debug, Clone, Default)]
pub struct RebuildProjections {
    pub session_id: Option<Uuid>,
    /// Name of the projection to rebuild; `None` rebuilds all of them.
    pub projection: Option<String>,
}

impl Cmd for RebuildProjections {
    const NAME: &'static str = "rebuild-projections";
}

impl<S: EventStore> CommandPipeline<S> {
    /// Execute a [`RebuildProjections`] command.
    ///
    /// On success the result payload maps each rebuilt projection name to
    /// `1`, a count of projection types processed, not of rows.
    pub async fn rebuild_projections(&self, cmd: &RebuildProjections) -> CommandResult {
        tracing::info!(
            command = RebuildProjections::NAME,
            session_id = ?cmd.session_id,
            projection = ?cmd.projection,
            "executing command in session"
        );

        let uow = self.store().begin();
        let session = match resolve_session(&uow, RebuildProjections::NAME, cmd.session_id).await {
            Ok(session) => session,
            Err(failure) => return failure,
        };

        let names: Vec<&'static str> = match cmd.projection.as_deref() {
            Some(name) => match self.store().projections().get(name) {
                Some(descriptor) => vec![descriptor.name()],
                None => {
                    tracing::warn!(projection = name, "unknown projection requested");
                    let failure = CommandResult::failure(CommandError::Validation(format!(
                        "Unknown projection '{name}'"
                    )));
                    return self
                        .finish_in_session(uow, &session, RebuildProjections::NAME, failure)
                        .await;
                }
            },
            None => self.store().projections().names().collect(),
        };

        let mut stats: BTreeMap<String, u64> = BTreeMap::new();
        for name in names {
            match self.store().rebuild(name).await {
                Ok(documents) => {
                    tracing::info!(projection = name, documents, "projection rebuilt");
                    stats.insert(name.to_string(), 1);
                }
                Err(error) => {
                    tracing::error!(projection = name, %error, "projection rebuild failed");
                    // Pending bookkeeping dies with the dropped unit of work.
                    return CommandResult::failure(CommandError::Internal);
                }
            }
        }

        let result = CommandResult::success_with(serde_json::json!(stats));
        self.finish_in_session(uow, &session, RebuildProjections::NAME, result)
            .await
    }
}
