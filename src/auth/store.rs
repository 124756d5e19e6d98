//! In-memory role registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::model::Role;

/// Roles and their permission matrices, keyed by role id.
///
/// Read-mostly: lookups clone an `Arc<Role>` under a short read lock, and the
/// evaluation itself runs on that snapshot without holding the lock.
#[derive(Debug, Default)]
pub struct PolicyStore {
  roles: RwLock<HashMap<String, Arc<Role>>>,
}

impl PolicyStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Self {
    let store = Self::new();
    store.replace_all(roles);
    store
  }

  /// Add or replace a single role.
  pub fn insert(&self, role: Role) {
    check_duplicates(&role);
    let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
    roles.insert(role.id.clone(), Arc::new(role));
  }

  /// Swap the whole role set in one step.
  pub fn replace_all(&self, new_roles: impl IntoIterator<Item = Role>) {
    let loaded: HashMap<String, Arc<Role>> = new_roles
      .into_iter()
      .map(|role| {
        check_duplicates(&role);
        (role.id.clone(), Arc::new(role))
      })
      .collect();
    debug!(count = loaded.len(), "Loaded roles");

    let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
    *roles = loaded;
  }

  pub fn remove(&self, role_id: &str) -> Option<Arc<Role>> {
    let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
    roles.remove(role_id)
  }

  pub fn role(&self, role_id: &str) -> Option<Arc<Role>> {
    let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
    roles.get(role_id).cloned()
  }

  /// All roles, sorted by id.
  pub fn roles(&self) -> Vec<Arc<Role>> {
    let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
    let mut all: Vec<Arc<Role>> = roles.values().cloned().collect();
    all.sort_by(|a, b| a.id.cmp(&b.id));
    all
  }

  pub fn len(&self) -> usize {
    self.roles.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn check_duplicates(role: &Role) {
  let duplicates = role.duplicate_policies();
  if !duplicates.is_empty() {
    warn!(
      role = %role.id,
      ?duplicates,
      "Role has more than one policy per entity kind; first match wins"
    );
  }
}
