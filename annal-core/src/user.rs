//! User aggregate: document, events, projection, command handlers, and the
//! user-list read model.
//!
//! `user_name` and `email` are globally unique. Handlers pre-check with a
//! query, but under concurrency the storage-level unique indexes are the
//! final arbiter; the pipeline translates a commit-time violation into a
//! race-condition failure.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{CommandError, CommandResult},
    event::AggregateEvent,
    pipeline::{Cmd, ExecuteInSession, HandlerContext, HandlerError},
    projection::{Document, Projection},
    session::Session,
    store::{StoreError, UnitOfWork},
};

/// Projected view of one user stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub user_name: String,
    pub email: String,
    /// `None` until password authentication is added; never cleared.
    pub password_hash: Option<String>,
    /// Only ever transitions `false` to `true`.
    pub is_deactivated: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Document for User {
    const KIND: &'static str = "user";

    fn id(&self) -> Uuid {
        self.user_id
    }
}

/// Everything that can happen on a user stream. Each event carries the
/// acting session for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UserEvent {
    Created {
        session_id: Uuid,
        user_id: Uuid,
        user_name: String,
        email: String,
        created_at: DateTime<Utc>,
    },
    PasswordAuthenticationAdded {
        session_id: Uuid,
        user_id: Uuid,
        password_hash: String,
    },
    Deactivated {
        session_id: Uuid,
        user_id: Uuid,
    },
    EmailChanged {
        session_id: Uuid,
        user_id: Uuid,
        new_email: String,
        changed_at: DateTime<Utc>,
    },
}

impl AggregateEvent for UserEvent {
    const AGGREGATE: &'static str = "user";

    fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::PasswordAuthenticationAdded { .. } => "password-authentication-added",
            Self::Deactivated { .. } => "deactivated",
            Self::EmailChanged { .. } => "email-changed",
        }
    }
}

pub struct UserProjection;

impl Projection for UserProjection {
    type Doc = User;
    type Event = UserEvent;

    fn create(event: &UserEvent) -> Option<User> {
        match event {
            UserEvent::Created {
                user_id,
                user_name,
                email,
                created_at,
                ..
            } => Some(User {
                user_id: *user_id,
                user_name: user_name.clone(),
                email: email.clone(),
                password_hash: None,
                is_deactivated: false,
                created_at: *created_at,
                last_updated_at: *created_at,
            }),
            _ => None,
        }
    }

    fn apply(user: User, event: &UserEvent) -> User {
        match event {
            UserEvent::Created { .. } => {
                debug_assert!(false, "`created` can only start a user stream");
                user
            }
            UserEvent::PasswordAuthenticationAdded { password_hash, .. } => User {
                password_hash: Some(password_hash.clone()),
                ..user
            },
            UserEvent::Deactivated { .. } => User {
                is_deactivated: true,
                ..user
            },
            UserEvent::EmailChanged {
                new_email,
                changed_at,
                ..
            } => User {
                email: new_email.clone(),
                last_updated_at: *changed_at,
                ..user
            },
        }
    }
}

fn user_name_rules(user_name: &str) -> Option<String> {
    static USER_NAME: OnceLock<Regex> = OnceLock::new();
    let pattern =
        USER_NAME.get_or_init(|| Regex::new("^[a-zA-Z0-9_-]+$").expect("static pattern compiles"));

    if user_name.is_empty() {
        Some("Username is required".to_string())
    } else if user_name.len() < 3 {
        Some("Username must be at least 3 characters".to_string())
    } else if user_name.len() > 50 {
        Some("Username cannot exceed 50 characters".to_string())
    } else if !pattern.is_match(user_name) {
        Some("Username can only contain letters, numbers, underscores, and hyphens".to_string())
    } else {
        None
    }
}

fn email_rules(email: &str) -> Option<String> {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    let pattern = EMAIL.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("static pattern compiles")
    });

    if email.is_empty() {
        Some("Email is required".to_string())
    } else if email.len() > 100 {
        Some("Email cannot exceed 100 characters".to_string())
    } else if !pattern.is_match(email) {
        Some("Invalid email format".to_string())
    } else {
        None
    }
}

fn collect(violations: impl IntoIterator<Item = Option<String>>) -> Result<(), String> {
    let messages: Vec<String> = violations.into_iter().flatten().collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join(", "))
    }
}

/// Register a new account.
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub session_id: Option<Uuid>,
    pub user_name: String,
    pub email: String,
}

impl Cmd for CreateUser {
    const NAME: &'static str = "create-user";

    fn validate(&self) -> Result<(), String> {
        collect([user_name_rules(&self.user_name), email_rules(&self.email)])
    }
}

impl ExecuteInSession for CreateUser {
    fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    async fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        session: &Session,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandResult, HandlerError> {
        let existing = uow
            .find::<User, _>(|u| u.user_name == self.user_name || u.email == self.email)
            .await?;
        if let Some(user) = existing {
            let message = if user.user_name == self.user_name {
                "Username already exists"
            } else {
                "Email already exists"
            };
            return Ok(CommandResult::failure(CommandError::Validation(
                message.to_string(),
            )));
        }

        let user_id = ctx.ids.new_id();
        uow.start_stream(
            user_id,
            UserEvent::Created {
                session_id: session.session_id,
                user_id,
                user_name: self.user_name.clone(),
                email: self.email.clone(),
                created_at: ctx.clock.now(),
            },
        )?;

        Ok(CommandResult::success_with(serde_json::json!(user_id)))
    }
}

/// Attach password authentication to an account that has none.
#[derive(Debug, Clone)]
pub struct AddPasswordAuthentication {
    pub session_id: Option<Uuid>,
    pub user_id: Uuid,
    pub password: String,
}

impl Cmd for AddPasswordAuthentication {
    const NAME: &'static str = "add-password-authentication";

    fn validate(&self) -> Result<(), String> {
        if self.password.is_empty() {
            return Err("Password is required".to_string());
        }
        Ok(())
    }
}

impl ExecuteInSession for AddPasswordAuthentication {
    fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    async fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        session: &Session,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandResult, HandlerError> {
        let Some(user) = uow.load::<User>(self.user_id).await? else {
            return Ok(CommandResult::failure(CommandError::Validation(
                "User does not exist".to_string(),
            )));
        };
        if user.password_hash.is_some() {
            return Ok(CommandResult::failure(CommandError::Validation(
                "User already has a password authentication".to_string(),
            )));
        }

        let password_hash = ctx.hasher.hash(&self.password)?;
        uow.append(
            self.user_id,
            UserEvent::PasswordAuthenticationAdded {
                session_id: session.session_id,
                user_id: self.user_id,
                password_hash,
            },
        )?;

        Ok(CommandResult::success())
    }
}

/// Deactivate an account. Re-deactivation is an idempotent success.
#[derive(Debug, Clone)]
pub struct DeactivateUser {
    pub session_id: Option<Uuid>,
    pub user_id: Uuid,
}

impl Cmd for DeactivateUser {
    const NAME: &'static str = "deactivate-user";
}

impl ExecuteInSession for DeactivateUser {
    fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    async fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        session: &Session,
        _ctx: &HandlerContext<'_>,
    ) -> Result<CommandResult, HandlerError> {
        let Some(user) = uow.load::<User>(self.user_id).await? else {
            return Ok(CommandResult::failure(CommandError::Validation(
                "User not found".to_string(),
            )));
        };
        if user.is_deactivated {
            // Already deactivated; succeed without a new event.
            return Ok(CommandResult::success());
        }

        uow.append(
            self.user_id,
            UserEvent::Deactivated {
                session_id: session.session_id,
                user_id: self.user_id,
            },
        )?;

        Ok(CommandResult::success())
    }
}

/// Change an account's email address.
#[derive(Debug, Clone)]
pub struct ChangeUserEmail {
    pub session_id: Option<Uuid>,
    pub user_id: Uuid,
    pub new_email: String,
}

impl Cmd for ChangeUserEmail {
    const NAME: &'static str = "change-user-email";

    fn validate(&self) -> Result<(), String> {
        let user_id = (self.user_id == Uuid::nil()).then(|| "UserId is required".to_string());
        collect([user_id, email_rules(&self.new_email)])
    }
}

impl ExecuteInSession for ChangeUserEmail {
    fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    async fn run<U: UnitOfWork>(
        &self,
        uow: &mut U,
        session: &Session,
        ctx: &HandlerContext<'_>,
    ) -> Result<CommandResult, HandlerError> {
        let Some(user) = uow.load::<User>(self.user_id).await? else {
            return Ok(CommandResult::failure(CommandError::Validation(
                "User not found".to_string(),
            )));
        };
        if user.is_deactivated {
            return Ok(CommandResult::failure(CommandError::Validation(
                "Cannot change email for deactivated user".to_string(),
            )));
        }
        if user.email == self.new_email {
            return Ok(CommandResult::failure(CommandError::Validation(
                "New email is the same as current email".to_string(),
            )));
        }
        if uow
            .find::<User, _>(|u| u.email == self.new_email)
            .await?
            .is_some()
        {
            return Ok(CommandResult::failure(CommandError::Validation(
                "Email already in use".to_string(),
            )));
        }

        uow.append(
            self.user_id,
            UserEvent::EmailChanged {
                session_id: session.session_id,
                user_id: self.user_id,
                new_email: self.new_email.clone(),
                changed_at: ctx.clock.now(),
            },
        )?;

        Ok(CommandResult::success())
    }
}

/// Row of the user-list read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserListItem {
    pub user_id: Uuid,
    pub user_name: String,
    pub email: String,
    pub is_deactivated: bool,
    pub has_password: bool,
}

/// All users, in id order, with their password state flattened to a flag.
///
/// # Errors
///
/// Returns [`StoreError`] if a stored document cannot be decoded.
pub async fn list_users<U: UnitOfWork>(uow: &U) -> Result<Vec<UserListItem>, StoreError> {
    Ok(uow
        .list::<User>()
        .await?
        .into_iter()
        .map(|user| UserListItem {
            user_id: user.user_id,
            user_name: user.user_name,
            email: user.email,
            is_deactivated: user.is_deactivated,
            has_password: user.password_hash.is_some(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_user_has_no_password_and_is_active() {
        let user_id = Uuid::new_v4();
        let created_at = Utc::now();
        let user = UserProjection::create(&UserEvent::Created {
            session_id: Uuid::new_v4(),
            user_id,
            user_name: "ann".to_string(),
            email: "ann@x.com".to_string(),
            created_at,
        })
        .unwrap();

        assert_eq!(user.user_id, user_id);
        assert_eq!(user.password_hash, None);
        assert!(!user.is_deactivated);
        assert_eq!(user.last_updated_at, created_at);
    }

    #[test]
    fn password_event_sets_the_hash_once() {
        let user_id = Uuid::new_v4();
        let user = UserProjection::create(&UserEvent::Created {
            session_id: Uuid::new_v4(),
            user_id,
            user_name: "ann".to_string(),
            email: "ann@x.com".to_string(),
            created_at: Utc::now(),
        })
        .unwrap();

        let user = UserProjection::apply(
            user,
            &UserEvent::PasswordAuthenticationAdded {
                session_id: Uuid::new_v4(),
                user_id,
                password_hash: "$argon2id$stub".to_string(),
            },
        );
        assert_eq!(user.password_hash.as_deref(), Some("$argon2id$stub"));
    }

    #[test]
    fn email_change_updates_address_and_timestamp() {
        let user_id = Uuid::new_v4();
        let created_at = Utc::now();
        let changed_at = created_at + chrono::Duration::minutes(1);
        let user = UserProjection::create(&UserEvent::Created {
            session_id: Uuid::new_v4(),
            user_id,
            user_name: "ann".to_string(),
            email: "ann@x.com".to_string(),
            created_at,
        })
        .unwrap();

        let user = UserProjection::apply(
            user,
            &UserEvent::EmailChanged {
                session_id: Uuid::new_v4(),
                user_id,
                new_email: "ann@y.com".to_string(),
                changed_at,
            },
        );
        assert_eq!(user.email, "ann@y.com");
        assert_eq!(user.last_updated_at, changed_at);
    }

    #[test]
    fn deactivation_is_a_one_way_flag() {
        let user_id = Uuid::new_v4();
        let user = UserProjection::create(&UserEvent::Created {
            session_id: Uuid::new_v4(),
            user_id,
            user_name: "ann".to_string(),
            email: "ann@x.com".to_string(),
            created_at: Utc::now(),
        })
        .unwrap();

        let user = UserProjection::apply(
            user,
            &UserEvent::Deactivated {
                session_id: Uuid::new_v4(),
                user_id,
            },
        );
        assert!(user.is_deactivated);
    }

    #[test]
    fn non_creating_event_cannot_start_a_stream() {
        assert!(
            UserProjection::create(&UserEvent::Deactivated {
                session_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            })
            .is_none()
        );
    }

    fn create_user(user_name: &str, email: &str) -> CreateUser {
        CreateUser {
            session_id: Some(Uuid::new_v4()),
            user_name: user_name.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn valid_input_passes_validation() {
        assert_eq!(create_user("ann-01", "ann@example.com").validate(), Ok(()));
    }

    #[test]
    fn short_user_name_is_rejected() {
        assert_eq!(
            create_user("an", "ann@example.com").validate(),
            Err("Username must be at least 3 characters".to_string())
        );
    }

    #[test]
    fn long_user_name_is_rejected() {
        let name = "a".repeat(51);
        assert_eq!(
            create_user(&name, "ann@example.com").validate(),
            Err("Username cannot exceed 50 characters".to_string())
        );
    }

    #[test]
    fn user_name_charset_is_restricted() {
        assert_eq!(
            create_user("ann smith", "ann@example.com").validate(),
            Err(
                "Username can only contain letters, numbers, underscores, and hyphens"
                    .to_string()
            )
        );
    }

    #[test]
    fn malformed_email_is_rejected() {
        assert_eq!(
            create_user("ann", "not-an-email").validate(),
            Err("Invalid email format".to_string())
        );
    }

    #[test]
    fn oversized_email_is_rejected() {
        let email = format!("{}@example.com", "a".repeat(100));
        assert_eq!(
            create_user("ann", &email).validate(),
            Err("Email cannot exceed 100 characters".to_string())
        );
    }

    #[test]
    fn all_field_errors_are_joined() {
        assert_eq!(
            create_user("", "").validate(),
            Err("Username is required, Email is required".to_string())
        );
    }

    #[test]
    fn change_email_requires_a_user_id() {
        let cmd = ChangeUserEmail {
            session_id: Some(Uuid::new_v4()),
            user_id: Uuid::nil(),
            new_email: "new@example.com".to_string(),
        };
        assert_eq!(cmd.validate(), Err("UserId is required".to_string()));
    }

    #[test]
    fn add_password_requires_a_password() {
        let cmd = AddPasswordAuthentication {
            session_id: Some(Uuid::new_v4()),
            user_id: Uuid::new_v4(),
            password: String::new(),
        };
        assert_eq!(cmd.validate(), Err("Password is required".to_string()));
    }
}
