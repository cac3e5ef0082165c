//! Item type definitions and the closed registry that holds them.
//!
//! A type declares its properties and its children. Types may extend a base
//! type; lookups through the registry (`properties`, `children`) return the
//! merged view along the base chain, derived declarations winning.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::path::ItemPath;
use crate::validator::Validator;

/// Type of the tree root.
pub const ROOT_TYPE: &str = "root";
/// Type of the read-only elements under `/item-types`.
pub const ITEM_TYPE_TYPE: &str = "item-type";
/// Name of the registry mirror collection under the root.
pub const ITEM_TYPES_COLLECTION: &str = "item-types";
/// Type of the read-only elements under `/property-types`.
pub const PROPERTY_TYPE_TYPE: &str = "property-type";
/// Name of the property type mirror collection under the root.
pub const PROPERTY_TYPES_COLLECTION: &str = "property-types";

/// Errors detected while assembling or checking a [`TypeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("item type {0:?} is already registered")]
    Duplicate(String),

    #[error("property type {0:?} is already registered")]
    DuplicatePropertyType(String),

    #[error("item type {0:?} is not registered")]
    UnknownType(String),

    #[error("item type {item_type:?} extends unknown type {base:?}")]
    UnknownBase { item_type: String, base: String },

    #[error("child {child:?} of {item_type:?} refers to unknown type {child_type:?}")]
    UnknownChildType {
        item_type: String,
        child: String,
        child_type: String,
    },

    #[error("{0:?} is not usable as an item name")]
    InvalidName(String),

    #[error("inheritance cycle through item type {0:?}")]
    Cycle(String),

    #[error("default of {item_type}.{property} fails its validator: {reason}")]
    BadDefault {
        item_type: String,
        property: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Declaration of one property of an item type.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub mandatory: bool,
    pub default: Option<String>,
    pub validator: Option<Validator>,
    /// Whether the property may be changed by `update` after creation.
    pub updatable: bool,
    pub description: String,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            default: None,
            validator: None,
            updatable: true,
            description: String::new(),
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Settable at creation only.
    pub fn read_only(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn check(&self, value: &str) -> Result<(), String> {
        match &self.validator {
            Some(v) => v.check(value),
            None => Ok(()),
        }
    }
}

/// Declaration of a named child of an item type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildDef {
    /// A single child item, created explicitly by the user.
    Item { item_type: String, required: bool },
    /// A collection container, created automatically with its parent.
    Collection {
        item_type: String,
        min: usize,
        max: Option<usize>,
    },
}

impl ChildDef {
    pub fn item(item_type: impl Into<String>) -> Self {
        Self::Item {
            item_type: item_type.into(),
            required: false,
        }
    }

    pub fn collection(item_type: impl Into<String>) -> Self {
        Self::Collection {
            item_type: item_type.into(),
            min: 0,
            max: None,
        }
    }

    /// Mark a single child as required. No effect on collections.
    pub fn required(self) -> Self {
        match self {
            Self::Item { item_type, .. } => Self::Item {
                item_type,
                required: true,
            },
            other => other,
        }
    }

    /// Set collection cardinality. No effect on single children.
    pub fn bounds(self, min: usize, max: Option<usize>) -> Self {
        match self {
            Self::Collection { item_type, .. } => Self::Collection {
                item_type,
                min,
                max,
            },
            other => other,
        }
    }

    pub fn item_type(&self) -> &str {
        match self {
            Self::Item { item_type, .. } | Self::Collection { item_type, .. } => item_type,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Collection { .. })
    }
}

/// An item type: properties, children, optional base type.
#[derive(Debug, Clone)]
pub struct ItemTypeDef {
    pub name: String,
    pub base: Option<String>,
    pub description: String,
    pub properties: BTreeMap<String, PropertyDef>,
    pub children: BTreeMap<String, ChildDef>,
}

impl ItemTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            description: String::new(),
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn extends(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.insert(property.name.clone(), property);
        self
    }

    pub fn child(mut self, name: impl Into<String>, child: ChildDef) -> Self {
        self.children.insert(name.into(), child);
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The closed set of item types known to a model, plus the named
/// property types (validators) plug-ins may share.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, ItemTypeDef>,
    property_types: BTreeMap<String, Validator>,
}

impl TypeRegistry {
    /// A registry holding the built-in `root`, `item-type` and
    /// `property-type` item types and the basic property types.
    pub fn with_core_types() -> Self {
        let mut types = BTreeMap::new();
        types.insert(
            ROOT_TYPE.to_owned(),
            ItemTypeDef::new(ROOT_TYPE)
                .describe("Root of the item tree.")
                .child(ITEM_TYPES_COLLECTION, ChildDef::collection(ITEM_TYPE_TYPE))
                .child(
                    PROPERTY_TYPES_COLLECTION,
                    ChildDef::collection(PROPERTY_TYPE_TYPE),
                ),
        );
        types.insert(
            ITEM_TYPE_TYPE.to_owned(),
            ItemTypeDef::new(ITEM_TYPE_TYPE)
                .describe("A registered item type.")
                .property(PropertyDef::new("description").read_only())
                .property(PropertyDef::new("base_type").read_only()),
        );
        types.insert(
            PROPERTY_TYPE_TYPE.to_owned(),
            ItemTypeDef::new(PROPERTY_TYPE_TYPE)
                .describe("A registered property type.")
                .property(PropertyDef::new("rule").read_only()),
        );

        let property_types = [
            ("basic_string", Validator::basic_string()),
            ("integer", Validator::integer()),
            ("positive_integer", Validator::positive_integer()),
            ("boolean", Validator::boolean()),
            ("path_string", Validator::path_string()),
        ]
        .into_iter()
        .map(|(name, validator)| (name.to_owned(), validator))
        .collect();

        Self {
            types,
            property_types,
        }
    }

    pub fn register(&mut self, def: ItemTypeDef) -> Result<(), RegistryError> {
        if self.types.contains_key(&def.name) {
            return Err(RegistryError::Duplicate(def.name));
        }
        tracing::debug!(item_type = %def.name, "registered item type");
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    /// Register a named validator. Property definitions pick it up with
    /// [`TypeRegistry::property_type`].
    pub fn register_property_type(
        &mut self,
        name: impl Into<String>,
        validator: Validator,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.property_types.contains_key(&name) {
            return Err(RegistryError::DuplicatePropertyType(name));
        }
        tracing::debug!(property_type = %name, "registered property type");
        self.property_types.insert(name, validator);
        Ok(())
    }

    /// A copy of a named validator, ready to attach to a [`PropertyDef`].
    pub fn property_type(&self, name: &str) -> Option<Validator> {
        self.property_types.get(name).cloned()
    }

    pub fn property_types(&self) -> impl Iterator<Item = (&str, &Validator)> {
        self.property_types.iter().map(|(name, v)| (name.as_str(), v))
    }

    /// Declare an extra child on an already registered type. Plug-ins use
    /// this to hang their top-level items off the root.
    pub fn add_child(
        &mut self,
        item_type: &str,
        name: impl Into<String>,
        child: ChildDef,
    ) -> Result<(), RegistryError> {
        let def = self
            .types
            .get_mut(item_type)
            .ok_or_else(|| RegistryError::UnknownType(item_type.to_owned()))?;
        def.children.insert(name.into(), child);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ItemTypeDef> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &ItemTypeDef> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The type followed by its bases, nearest first. Stops at unknown
    /// types and at cycles.
    fn chain(&self, name: &str) -> Vec<&ItemTypeDef> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = self.types.get(name);
        while let Some(def) = current {
            if !seen.insert(def.name.as_str()) {
                break;
            }
            chain.push(def);
            current = def.base.as_deref().and_then(|b| self.types.get(b));
        }
        chain
    }

    /// True if `name` is `ancestor` or extends it, directly or not.
    pub fn is_subtype(&self, name: &str, ancestor: &str) -> bool {
        self.chain(name).iter().any(|def| def.name == ancestor)
    }

    /// Merged property declarations of a type.
    pub fn properties(&self, name: &str) -> BTreeMap<&str, &PropertyDef> {
        let mut merged = BTreeMap::new();
        for def in self.chain(name).into_iter().rev() {
            for (prop, decl) in &def.properties {
                merged.insert(prop.as_str(), decl);
            }
        }
        merged
    }

    pub fn property(&self, name: &str, property: &str) -> Option<&PropertyDef> {
        self.chain(name)
            .into_iter()
            .find_map(|def| def.properties.get(property))
    }

    /// Merged child declarations of a type.
    pub fn children(&self, name: &str) -> BTreeMap<&str, &ChildDef> {
        let mut merged = BTreeMap::new();
        for def in self.chain(name).into_iter().rev() {
            for (child, decl) in &def.children {
                merged.insert(child.as_str(), decl);
            }
        }
        merged
    }

    /// Consistency check run before a model is built.
    pub fn check(&self) -> Result<(), RegistryError> {
        if !self.types.contains_key(ROOT_TYPE) {
            return Err(RegistryError::UnknownType(ROOT_TYPE.to_owned()));
        }
        for name in self.property_types.keys() {
            if ItemPath::root().join(name).is_err() {
                return Err(RegistryError::InvalidName(name.clone()));
            }
        }
        for def in self.types.values() {
            let names = std::iter::once(&def.name).chain(def.children.keys());
            for name in names {
                if ItemPath::root().join(name).is_err() {
                    return Err(RegistryError::InvalidName(name.clone()));
                }
            }
            if let Some(base) = &def.base {
                if !self.types.contains_key(base) {
                    return Err(RegistryError::UnknownBase {
                        item_type: def.name.clone(),
                        base: base.clone(),
                    });
                }
            }
            let mut seen = BTreeSet::new();
            let mut current = Some(def);
            while let Some(d) = current {
                if !seen.insert(d.name.as_str()) {
                    return Err(RegistryError::Cycle(def.name.clone()));
                }
                current = d.base.as_deref().and_then(|b| self.types.get(b));
            }
            for (child, decl) in &def.children {
                if !self.types.contains_key(decl.item_type()) {
                    return Err(RegistryError::UnknownChildType {
                        item_type: def.name.clone(),
                        child: child.clone(),
                        child_type: decl.item_type().to_owned(),
                    });
                }
            }
            for prop in def.properties.values() {
                if let Some(default) = &prop.default {
                    prop.check(default)
                        .map_err(|reason| RegistryError::BadDefault {
                            item_type: def.name.clone(),
                            property: prop.name.clone(),
                            reason,
                        })?;
                }
            }
        }
        Ok(())
    }
}
