//! Core identity and permission types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of entity the data-access layer mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
  Kit,
  KitItem,
  Vehicle,
  Base,
  CatalogItem,
  Category,
  Unit,
  User,
  Role,
}

impl EntityKind {
  pub const ALL: [EntityKind; 9] = [
    EntityKind::Kit,
    EntityKind::KitItem,
    EntityKind::Vehicle,
    EntityKind::Base,
    EntityKind::CatalogItem,
    EntityKind::Category,
    EntityKind::Unit,
    EntityKind::User,
    EntityKind::Role,
  ];

  /// Name used in config files and on the command line.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Kit => "kit",
      Self::KitItem => "kitItem",
      Self::Vehicle => "vehicle",
      Self::Base => "base",
      Self::CatalogItem => "catalogItem",
      Self::Category => "category",
      Self::Unit => "unit",
      Self::User => "user",
      Self::Role => "role",
    }
  }

  /// Remote collection holding documents of this kind.
  pub fn collection(&self) -> &'static str {
    match self {
      Self::Kit => "kits",
      Self::KitItem => "kitItems",
      Self::Vehicle => "vehicles",
      Self::Base => "bases",
      Self::CatalogItem => "catalogItems",
      Self::Category => "categories",
      Self::Unit => "units",
      Self::User => "users",
      Self::Role => "roles",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .copied()
      .find(|kind| kind.as_str().eq_ignore_ascii_case(s) || kind.collection().eq_ignore_ascii_case(s))
      .ok_or_else(|| format!("unknown entity kind '{}'", s))
  }
}

/// The four CRUD operations a policy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
  Create,
  Read,
  Update,
  Delete,
}

impl ActionKind {
  pub const ALL: [ActionKind; 4] = [
    ActionKind::Create,
    ActionKind::Read,
    ActionKind::Update,
    ActionKind::Delete,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Read => "read",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ActionKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .copied()
      .find(|action| action.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| format!("unknown action '{}'", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
  /// Bypasses every policy check
  Admin,
  Operator,
  Viewer,
}

/// CRUD grants for one entity kind within a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
  pub entity_kind: EntityKind,
  #[serde(default)]
  pub can_create: bool,
  #[serde(default)]
  pub can_read: bool,
  #[serde(default)]
  pub can_update: bool,
  #[serde(default)]
  pub can_delete: bool,
}

impl Policy {
  /// A policy granting nothing on `entity_kind`.
  pub fn deny_all(entity_kind: EntityKind) -> Self {
    Self {
      entity_kind,
      can_create: false,
      can_read: false,
      can_update: false,
      can_delete: false,
    }
  }

  pub fn permits(&self, action: ActionKind) -> bool {
    match action {
      ActionKind::Create => self.can_create,
      ActionKind::Read => self.can_read,
      ActionKind::Update => self.can_update,
      ActionKind::Delete => self.can_delete,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
  pub id: String,
  pub kind: RoleKind,
  pub display_name: String,
  #[serde(default)]
  pub policies: Vec<Policy>,
}

impl Role {
  /// Find the policy governing `entity`.
  ///
  /// At most one policy may exist per entity kind. Debug builds panic on a
  /// duplicate; release builds take the first match.
  pub fn policy_for(&self, entity: EntityKind) -> Option<&Policy> {
    let mut matches = self.policies.iter().filter(|p| p.entity_kind == entity);
    let first = matches.next();
    debug_assert!(
      matches.next().is_none(),
      "role '{}' has more than one policy for {}",
      self.id,
      entity
    );
    first
  }

  /// Entity kinds that appear in more than one policy.
  pub fn duplicate_policies(&self) -> Vec<EntityKind> {
    let mut seen = Vec::new();
    let mut duplicates = Vec::new();
    for policy in &self.policies {
      if seen.contains(&policy.entity_kind) {
        if !duplicates.contains(&policy.entity_kind) {
          duplicates.push(policy.entity_kind);
        }
      } else {
        seen.push(policy.entity_kind);
      }
    }
    duplicates
  }
}

/// The identity performing an operation.
///
/// The role is held by id and resolved at evaluation time, so a role change
/// applies to the actor's next call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
  pub id: String,
  #[serde(default)]
  pub role_id: Option<String>,
}

impl Actor {
  pub fn new(id: impl Into<String>, role_id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      role_id: Some(role_id.into()),
    }
  }

  /// An actor without any role; every check fails for it.
  pub fn without_role(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      role_id: None,
    }
  }
}
