//! Typed, hierarchical item model with source/reference inheritance.
//!
//! The [`Model`] owns the item tree and the [`TypeRegistry`] it was built
//! from. All mutations are synchronous and atomic: they either apply in full
//! or return a [`ModelErrors`] list and leave the tree untouched.

pub mod error;
pub mod item;
pub mod model;
pub mod path;
pub mod registry;
pub mod snapshot;
pub mod validator;

pub use error::{ErrorCategory, ErrorKind, ModelError, ModelErrors, ModelResult};
pub use item::{
    AppliedValues, DeltaKind, ItemId, ItemView, LifecycleState, PendingDelta, PropertyView,
    Removal,
};
pub use model::{CommitReport, Model, RestoreReport};
pub use path::ItemPath;
pub use registry::{ChildDef, ItemTypeDef, PropertyDef, RegistryError, TypeRegistry};
pub use snapshot::{ItemRecord, ModelSnapshot, load_snapshot, save_snapshot};
pub use validator::Validator;
