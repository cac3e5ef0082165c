//! Item records stored in the model arena and the views handed to callers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::path::ItemPath;

/// Arena index of an item. Stable for the lifetime of the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Initial,
    Applied,
    Updated,
    ForRemoval,
}

impl LifecycleState {
    /// The pending delta an item in this state contributes to a plan.
    pub fn delta(self) -> Option<DeltaKind> {
        match self {
            Self::Initial => Some(DeltaKind::Create),
            Self::Updated => Some(DeltaKind::Update),
            Self::ForRemoval => Some(DeltaKind::Remove),
            Self::Applied => None,
        }
    }

    pub fn is_pending(self) -> bool {
        self != Self::Applied
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Applied => "Applied",
            Self::Updated => "Updated",
            Self::ForRemoval => "ForRemoval",
        };
        f.write_str(s)
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initial" => Ok(Self::Initial),
            "Applied" => Ok(Self::Applied),
            "Updated" => Ok(Self::Updated),
            "ForRemoval" => Ok(Self::ForRemoval),
            other => Err(format!("invalid lifecycle state: {other:?}")),
        }
    }
}

/// The kind of change a plan task applies to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaKind {
    Create,
    Update,
    Remove,
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Property values captured the last time an item became Applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedValues {
    pub local: BTreeMap<String, String>,
    pub effective: BTreeMap<String, String>,
}

/// One arena slot.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) path: ItemPath,
    /// For collections, the element type.
    pub(crate) item_type: String,
    pub(crate) collection: bool,
    pub(crate) parent: Option<ItemId>,
    pub(crate) children: BTreeMap<String, ItemId>,
    /// Values set on this item. On a reference these are the overrides.
    pub(crate) local: BTreeMap<String, String>,
    pub(crate) source: Option<ItemId>,
    pub(crate) state: LifecycleState,
    pub(crate) read_only: bool,
    pub(crate) applied: Option<AppliedValues>,
}

impl Node {
    pub(crate) fn type_name(&self) -> String {
        if self.collection {
            format!("collection-of-{}", self.item_type)
        } else {
            self.item_type.clone()
        }
    }
}

/// Effective value of one property as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyView {
    pub value: String,
    /// Set only on reference items holding a local value.
    pub overridden: bool,
}

/// Serializable snapshot of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    pub path: ItemPath,
    pub item_type: String,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ItemPath>,
    pub read_only: bool,
    pub collection: bool,
    pub properties: BTreeMap<String, PropertyView>,
    pub children: Vec<String>,
}

impl ItemView {
    pub fn value(&self, property: &str) -> Option<&str> {
        self.properties.get(property).map(|p| p.value.as_str())
    }

    pub fn is_overridden(&self, property: &str) -> bool {
        self.properties
            .get(property)
            .is_some_and(|p| p.overridden)
    }
}

/// A non-Applied item as presented to the plan builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelta {
    pub path: ItemPath,
    pub kind: DeltaKind,
    pub collection: bool,
    pub source: Option<ItemPath>,
}

/// Outcome of [`crate::Model::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The item was Initial and is gone.
    Deleted,
    /// The item now awaits a plan.
    MarkedForRemoval(ItemView),
}
