//! Role-based authorization.
//!
//! [`PolicyStore`] holds the loaded roles; [`AuthorizationEvaluator`] answers
//! whether an actor may perform an action on an entity kind. Evaluation is
//! fail-closed: no actor, no role, or no policy all mean "denied".

mod evaluator;
mod store;

pub use evaluator::{role_allows, AuthorizationEvaluator};
pub use store::PolicyStore;
