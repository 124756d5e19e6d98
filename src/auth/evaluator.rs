//! Permission checks over loaded roles.

use std::sync::Arc;
use tracing::debug;

use super::store::PolicyStore;
use crate::error::{DataError, DataResult};
use crate::model::{ActionKind, Actor, EntityKind, Role, RoleKind};

/// Decide whether `role` grants `action` on `entity`.
///
/// Admin roles are allowed everything; this is how role management itself
/// stays reachable. Any other role needs an explicit policy for the entity.
pub fn role_allows(role: Option<&Role>, action: ActionKind, entity: EntityKind) -> bool {
  let Some(role) = role else {
    return false;
  };

  if role.kind == RoleKind::Admin {
    return true;
  }

  role
    .policy_for(entity)
    .map(|policy| policy.permits(action))
    .unwrap_or(false)
}

/// Answers "may this actor do X to entities of kind E".
#[derive(Debug, Clone)]
pub struct AuthorizationEvaluator {
  store: Arc<PolicyStore>,
}

impl AuthorizationEvaluator {
  pub fn new(store: Arc<PolicyStore>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &Arc<PolicyStore> {
    &self.store
  }

  /// Resolve the actor's role and evaluate. Never errors; denial is `false`.
  pub fn allowed(&self, action: ActionKind, entity: EntityKind, actor: Option<&Actor>) -> bool {
    let role = actor
      .and_then(|a| a.role_id.as_deref())
      .and_then(|role_id| self.store.role(role_id));
    role_allows(role.as_deref(), action, entity)
  }

  /// Like [`allowed`](Self::allowed) but turns denial into [`DataError::Unauthorized`].
  pub fn check(&self, action: ActionKind, entity: EntityKind, actor: Option<&Actor>) -> DataResult<()> {
    if self.allowed(action, entity, actor) {
      return Ok(());
    }

    debug!(
      actor = actor.map(|a| a.id.as_str()).unwrap_or("<none>"),
      %action,
      %entity,
      "Authorization denied"
    );
    Err(DataError::Unauthorized { action, entity })
  }
}
