//! Lazy relationship handles.
//!
//! An unfetched relationship is represented by a [`LazyHandle`]: a small,
//! explicit state machine instead of a runtime proxy subclass.
//!
//! ```text
//! Unloaded --begin_loading--> Loading --complete--> Loaded
//!     |                          |
//!     |                          +--reset (store error)--> Unloaded
//!     +--fail (owner detached/removed)--> Failed
//! ```
//!
//! Resolution goes through a [`LazyLoader`]; the session implements it
//! against its store and identity map, tests can implement it with a fake.

use crate::entity::{EntityRef, EntityState, Relation};
use crate::error::{Error, LazyInitializationError};
use crate::metadata::EntityType;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;
use std::future::Future;

/// What an unloaded handle points at.
#[derive(Debug, Clone, PartialEq)]
pub enum LazyTarget {
    /// Owning to-one edge `owner.relationship`: the foreign key value is
    /// already known.
    Reference {
        owner: EntityType,
        relationship: &'static str,
        target: EntityType,
        id: Value,
    },
    /// Non-owning edge: targets are found by the owner's identity.
    Inverse {
        owner: EntityType,
        owner_id: Value,
        relationship: &'static str,
    },
}

/// A resolved relationship value.
#[derive(Clone)]
pub enum Resolved {
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl Resolved {
    /// The referenced entities, in order.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            Resolved::One(target) => target.iter().cloned().collect(),
            Resolved::Many(targets) => targets.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Resolved::One(target) => usize::from(target.is_some()),
            Resolved::Many(targets) => targets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Does this value reference the given instance?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match self {
            Resolved::One(target) => target.as_ref().is_some_and(|t| t.ptr_eq(entity)),
            Resolved::Many(targets) => targets.iter().any(|t| t.ptr_eq(entity)),
        }
    }
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolved::One(target) => f.debug_tuple("One").field(target).finish(),
            Resolved::Many(targets) => write!(f, "Many(len={})", targets.len()),
        }
    }
}

/// State of a lazy handle.
#[derive(Debug, Clone)]
pub enum LazyState {
    Unloaded,
    Loading,
    Loaded(Resolved),
    Failed(String),
}

/// A relationship that is resolved on first access.
#[derive(Debug, Clone)]
pub struct LazyHandle {
    target: LazyTarget,
    state: LazyState,
}

impl LazyHandle {
    pub fn new(target: LazyTarget) -> Self {
        Self {
            target,
            state: LazyState::Unloaded,
        }
    }

    pub fn target(&self) -> &LazyTarget {
        &self.target
    }

    pub fn state(&self) -> &LazyState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LazyState::Loaded(_))
    }

    pub fn is_unloaded(&self) -> bool {
        matches!(self.state, LazyState::Unloaded)
    }

    pub fn loaded(&self) -> Option<&Resolved> {
        match &self.state {
            LazyState::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn loaded_mut(&mut self) -> Option<&mut Resolved> {
        match &mut self.state {
            LazyState::Loaded(value) => Some(value),
            _ => None,
        }
    }

    /// `Unloaded` or `Failed` -> `Loading`. Returns false if a load is already
    /// in progress or done.
    pub fn begin_loading(&mut self) -> bool {
        match self.state {
            LazyState::Unloaded | LazyState::Failed(_) => {
                self.state = LazyState::Loading;
                true
            }
            LazyState::Loading | LazyState::Loaded(_) => false,
        }
    }

    /// Cache the loaded value (internal use by the session and loaders).
    pub fn complete(&mut self, value: Resolved) {
        self.state = LazyState::Loaded(value);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = LazyState::Failed(reason.into());
    }

    /// Return an interrupted load to `Unloaded` so it can be retried.
    pub fn reset(&mut self) {
        if !self.is_loaded() {
            self.state = LazyState::Unloaded;
        }
    }
}

/// Minimal interface needed to resolve a lazy handle.
///
/// This trait lives in `persistkit-core` so handles can be resolved without
/// depending on the concrete session type.
pub trait LazyLoader {
    /// Load the entities a handle points at.
    fn load(&mut self, cx: &Cx, target: &LazyTarget) -> impl Future<Output = Outcome<Resolved, Error>>;
}

/// Resolve relationship `name` of `owner`, driving its handle through the
/// state machine.
///
/// Already-resolved relationships are returned without touching the loader.
/// An owner that is not managed fails with [`Error::LazyInitialization`] and
/// leaves the handle `Failed`. A loader error or cancellation resets the handle.
pub async fn initialize<L: LazyLoader>(
    cx: &Cx,
    owner: &EntityRef,
    name: &str,
    loader: &mut L,
) -> Outcome<Resolved, Error> {
    let target = {
        let mut entity = owner.write();
        let state = entity.state();
        let entity_type = entity.entity_type();
        let id = entity.id().cloned();
        let Some(relation) = entity.relation_mut(name) else {
            return Outcome::Ok(Resolved::Many(Vec::new()));
        };
        let handle = match relation {
            Relation::Resolved(value) => return Outcome::Ok(value.clone()),
            Relation::Lazy(handle) => handle,
        };
        if let Some(value) = handle.loaded() {
            return Outcome::Ok(value.clone());
        }
        if state != EntityState::Managed {
            let err = LazyInitializationError {
                entity: entity_type,
                id,
                relationship: name.to_string(),
                state,
            };
            handle.fail(err.to_string());
            return Outcome::Err(Error::LazyInitialization(err));
        }
        if !handle.begin_loading() {
            return Outcome::Err(Error::Custom(format!(
                "relationship '{}' of {} is already being loaded",
                name, entity_type
            )));
        }
        handle.target().clone()
    };

    tracing::debug!(relationship = name, target = ?target, "Resolving lazy relationship");
    let outcome = loader.load(cx, &target).await;

    let mut entity = owner.write();
    let handle = match entity.relation_mut(name) {
        Some(Relation::Lazy(handle)) => handle,
        _ => return outcome,
    };
    match outcome {
        Outcome::Ok(value) => {
            handle.complete(value.clone());
            Outcome::Ok(value)
        }
        Outcome::Err(e) => {
            handle.reset();
            Outcome::Err(e)
        }
        Outcome::Cancelled(r) => {
            handle.reset();
            Outcome::Cancelled(r)
        }
        Outcome::Panicked(p) => {
            handle.reset();
            Outcome::Panicked(p)
        }
    }
}
