//! Mutation intents: create, inherit, update, remove.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ErrorKind, ModelError, ModelErrors, ModelResult};
use crate::item::{ItemId, ItemView, LifecycleState, Removal};
use crate::path::ItemPath;
use crate::registry::ChildDef;

use super::Model;

impl Model {
    /// Create a new Initial item.
    ///
    /// Structural problems (path, existence, permissions, type) fail on the
    /// first one found. Property problems are collected and reported
    /// together. Declared defaults fill unset properties, declared
    /// collections are created, and every live reference of the parent
    /// receives a matching reference child.
    pub fn create(
        &mut self,
        path: &str,
        item_type: &str,
        properties: &BTreeMap<String, String>,
    ) -> ModelResult<ItemView> {
        let path = ItemPath::parse(path)?;
        let Some(parent_path) = path.parent() else {
            return Err(exists(&path).into());
        };
        let Some(parent) = self.lookup(&parent_path) else {
            return Err(ModelError::invalid_location(format!("Path not found: {parent_path}"))
                .at(&path)
                .into());
        };
        if self.lookup(&path).is_some() {
            return Err(exists(&path).into());
        }
        self.check_parent_writable(parent, &path)?;
        if !self.registry.contains(item_type) {
            return Err(ModelError::new(
                ErrorKind::InvalidType,
                format!("Item type not registered: {item_type}"),
            )
            .at(&path)
            .into());
        }
        self.check_child_type(parent, path.name(), item_type)
            .map_err(|msg| ModelError::new(ErrorKind::InvalidChildType, msg).at(&path))?;

        let mut errors = self.check_set(&path, item_type, properties, false);
        errors.extend(self.check_mandatory(&path, item_type, properties));
        ModelErrors::check(errors)?;

        let mut local = self.defaults(item_type);
        local.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        let id = self.insert_node(
            Some(parent),
            path.clone(),
            item_type.to_owned(),
            false,
            local,
            LifecycleState::Initial,
        );
        self.instantiate_collections(id, LifecycleState::Initial);
        self.propagate_new_child(parent, id);

        tracing::info!(path = %path, item_type, "item created");
        Ok(self.view(id))
    }

    /// Create `dest` as a reference of `source`.
    ///
    /// Descendants of the source get reference counterparts under `dest`.
    /// `overrides` become local values and are flagged overridden; every
    /// other property tracks the source.
    pub fn inherit(
        &mut self,
        dest: &str,
        source: &str,
        overrides: &BTreeMap<String, String>,
    ) -> ModelResult<ItemView> {
        let (source_path, source_id) = self.resolve(source)?;
        let dest_path = ItemPath::parse(dest)?;
        if self.lookup(&dest_path).is_some() {
            return Err(exists(&dest_path).into());
        }
        let parent_path = dest_path.parent().ok_or_else(|| exists(&dest_path))?;
        let Some(parent) = self.lookup(&parent_path) else {
            return Err(ModelError::invalid_location(format!("Path not found: {parent_path}"))
                .at(&dest_path)
                .into());
        };

        let src = self.node(source_id);
        if src.collection {
            return Err(ModelError::invalid_request(format!(
                "Cannot inherit from a collection: {source_path}"
            ))
            .at(&dest_path)
            .into());
        }
        if src.state == LifecycleState::ForRemoval {
            return Err(ModelError::invalid_request(format!(
                "Source item is marked for removal: {source_path}"
            ))
            .at(&dest_path)
            .into());
        }
        if dest_path.is_within(&source_path) {
            return Err(ModelError::invalid_request(format!(
                "Cannot inherit {source_path} into its own subtree"
            ))
            .at(&dest_path)
            .into());
        }
        let item_type = src.item_type.clone();
        self.check_parent_writable(parent, &dest_path)?;
        self.check_child_type(parent, dest_path.name(), &item_type)
            .map_err(|msg| ModelError::new(ErrorKind::ChildNotAllowed, msg).at(&dest_path))?;
        ModelErrors::check(self.check_set(&dest_path, &item_type, overrides, false))?;

        let id = self.inherit_subtree(source_id, parent, dest_path.clone());
        self.node_mut(id).local = overrides.clone();
        self.propagate_new_child(parent, id);

        tracing::info!(path = %dest_path, source = %source_path, "item inherited");
        Ok(self.view(id))
    }

    /// Set and delete properties of an item.
    ///
    /// Deleting a property resets it to its default when it has one and
    /// clears it otherwise; on a reference it drops the override so the
    /// value tracks the source again. Applied items whose effective values
    /// change become Updated, as do their references; items whose values
    /// return to what was last applied become Applied again.
    pub fn update(
        &mut self,
        path: &str,
        set: &BTreeMap<String, String>,
        delete: &[&str],
    ) -> ModelResult<ItemView> {
        let (path, id) = self.resolve(path)?;
        let node = self.node(id);
        if node.read_only {
            return Err(ModelError::method_not_allowed("Item is read-only")
                .at(&path)
                .into());
        }
        if node.collection {
            return Err(ModelError::method_not_allowed("Collections cannot be updated")
                .at(&path)
                .into());
        }
        let item_type = node.item_type.clone();
        let is_reference = node.source.is_some();

        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        let mut resets = Vec::new();
        for &name in delete {
            if !seen.insert(name) {
                continue;
            }
            if set.contains_key(name) {
                errors.push(
                    ModelError::invalid_request(format!(
                        "Property {name:?} cannot be both updated and deleted"
                    ))
                    .at(&path)
                    .on_property(name),
                );
                continue;
            }
            match self.registry.property(&item_type, name) {
                None => errors.push(
                    ModelError::invalid_request(format!(
                        "Unable to delete undeclared property {name:?}"
                    ))
                    .at(&path)
                    .on_property(name),
                ),
                Some(def) if !def.updatable => errors.push(
                    ModelError::invalid_request("Unable to modify readonly property")
                        .at(&path)
                        .on_property(name),
                ),
                Some(def) if def.mandatory && def.default.is_none() && !is_reference => errors
                    .push(
                        ModelError::new(
                            ErrorKind::MissingRequiredProperty,
                            format!("Cannot delete mandatory property {name:?}"),
                        )
                        .at(&path)
                        .on_property(name),
                    ),
                Some(def) => {
                    let reset = if is_reference { None } else { def.default.clone() };
                    resets.push((name.to_owned(), reset));
                }
            }
        }
        errors.extend(self.check_set(&path, &item_type, set, true));
        ModelErrors::check(errors)?;

        let node = self.node_mut(id);
        for (name, reset) in resets {
            match reset {
                Some(default) => {
                    node.local.insert(name, default);
                }
                None => {
                    node.local.remove(&name);
                }
            }
        }
        node.local
            .extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.refresh_states(id);

        tracing::info!(path = %path, set = set.len(), deleted = delete.len(), "item updated");
        Ok(self.view(id))
    }

    /// Remove an item and its descendants.
    ///
    /// Removal cascades to every reference of anything removed. Initial
    /// items are deleted on the spot unless something that survives still
    /// hangs off them; everything else becomes ForRemoval and is deleted
    /// when a plan commits the removal.
    pub fn remove(&mut self, path: &str) -> ModelResult<Removal> {
        let (path, id) = self.resolve(path)?;
        let node = self.node(id);
        if id == self.root {
            return Err(ModelError::method_not_allowed("The root item cannot be removed")
                .at(&path)
                .into());
        }
        // Top-level items come from the registry and are rebuilt on load.
        if node.parent == Some(self.root) {
            return Err(ModelError::method_not_allowed("Top-level items cannot be removed")
                .at(&path)
                .into());
        }
        if node.read_only {
            return Err(ModelError::method_not_allowed("Item is read-only")
                .at(&path)
                .into());
        }
        if node.collection {
            return Err(ModelError::method_not_allowed("Collections cannot be removed")
                .at(&path)
                .into());
        }
        if node.state == LifecycleState::ForRemoval {
            return Ok(Removal::MarkedForRemoval(self.view(id)));
        }

        let mut affected = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for member in self.subtree(current) {
                if affected.insert(member) {
                    stack.extend(self.references_of(member));
                }
            }
        }

        let initial = affected
            .iter()
            .copied()
            .filter(|&member| self.node(member).state == LifecycleState::Initial)
            .collect();
        let doomed = self.prune(initial);
        for &member in &affected {
            if !doomed.contains(&member) {
                self.node_mut(member).state = LifecycleState::ForRemoval;
            }
        }
        self.delete_nodes(&doomed);

        tracing::info!(
            path = %path,
            deleted = doomed.len(),
            marked = affected.len() - doomed.len(),
            "item removed"
        );
        if doomed.contains(&id) {
            Ok(Removal::Deleted)
        } else {
            Ok(Removal::MarkedForRemoval(self.view(id)))
        }
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    fn check_parent_writable(&self, parent: ItemId, path: &ItemPath) -> Result<(), ModelError> {
        let node = self.node(parent);
        if node.read_only {
            return Err(ModelError::method_not_allowed(format!(
                "Parent {} is read-only",
                node.path
            ))
            .at(path));
        }
        if node.state == LifecycleState::ForRemoval {
            return Err(ModelError::invalid_request(format!(
                "Parent {} is marked for removal",
                node.path
            ))
            .at(path));
        }
        Ok(())
    }

    /// Whether an item of `item_type` may live at `parent/name`.
    fn check_child_type(&self, parent: ItemId, name: &str, item_type: &str) -> Result<(), String> {
        let node = self.node(parent);
        if node.collection {
            return if self.registry.is_subtype(item_type, &node.item_type) {
                Ok(())
            } else {
                Err(format!(
                    "'{item_type}' is not an allowed type for collection of '{}'",
                    node.item_type
                ))
            };
        }
        match self.registry.children(&node.item_type).get(name) {
            Some(ChildDef::Item { item_type: allowed, .. })
                if self.registry.is_subtype(item_type, allowed) =>
            {
                Ok(())
            }
            Some(ChildDef::Item { item_type: allowed, .. }) => Err(format!(
                "'{item_type}' is not an allowed type for child '{name}' of '{}' (expected '{allowed}')",
                node.item_type
            )),
            _ => Err(format!(
                "'{name}' is not an allowed child of '{}'",
                node.item_type
            )),
        }
    }

    /// Undeclared names, read-only properties (when updating) and values
    /// failing their validator.
    fn check_set(
        &self,
        path: &ItemPath,
        item_type: &str,
        set: &BTreeMap<String, String>,
        updating: bool,
    ) -> Vec<ModelError> {
        let mut errors = Vec::new();
        for (name, value) in set {
            let error = match self.registry.property(item_type, name) {
                None => Some(ModelError::new(
                    ErrorKind::PropertyNotAllowed,
                    format!("Property {name:?} is not allowed for item type '{item_type}'"),
                )),
                Some(def) if updating && !def.updatable => Some(ModelError::invalid_request(
                    "Unable to modify readonly property",
                )),
                Some(def) => def
                    .check(value)
                    .err()
                    .map(|reason| ModelError::new(ErrorKind::Validation, reason)),
            };
            if let Some(error) = error {
                errors.push(error.at(path).on_property(name.as_str()));
            }
        }
        errors
    }

    fn check_mandatory(
        &self,
        path: &ItemPath,
        item_type: &str,
        set: &BTreeMap<String, String>,
    ) -> Vec<ModelError> {
        self.registry
            .properties(item_type)
            .into_iter()
            .filter(|(name, def)| def.mandatory && def.default.is_none() && !set.contains_key(*name))
            .map(|(name, _)| {
                ModelError::new(
                    ErrorKind::MissingRequiredProperty,
                    format!("Missing required property {name:?}"),
                )
                .at(path)
                .on_property(name)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Inheritance plumbing
    // -----------------------------------------------------------------------

    /// Create a reference copy of `source` (and its live descendants) at
    /// `dest` under `parent`. Returns the id of the new top item.
    fn inherit_subtree(&mut self, source: ItemId, parent: ItemId, dest: ItemPath) -> ItemId {
        let src = self.node(source);
        let item_type = src.item_type.clone();
        let collection = src.collection;
        let children: Vec<(String, ItemId)> = src
            .children
            .iter()
            .filter(|&(_, &child)| self.node(child).state != LifecycleState::ForRemoval)
            .map(|(name, &child)| (name.clone(), child))
            .collect();

        let id = self.insert_node(
            Some(parent),
            dest.clone(),
            item_type,
            collection,
            BTreeMap::new(),
            LifecycleState::Initial,
        );
        self.link(id, source);
        for (name, child) in children {
            if let Ok(path) = dest.join(&name) {
                self.inherit_subtree(child, id, path);
            }
        }
        id
    }

    /// Give every live reference of `parent` a reference counterpart of
    /// its new `child`, recursively along reference chains.
    fn propagate_new_child(&mut self, parent: ItemId, child: ItemId) {
        let name = self.node(child).path.name().to_owned();
        for reference in self.references_of(parent) {
            let node = self.node(reference);
            if node.state == LifecycleState::ForRemoval || node.children.contains_key(&name) {
                continue;
            }
            let Ok(dest) = node.path.join(&name) else {
                continue;
            };
            tracing::debug!(path = %dest, "propagating new child to reference");
            let copy = self.inherit_subtree(child, reference, dest);
            self.propagate_new_child(reference, copy);
        }
    }

    /// Recompute Applied/Updated for an item and everything inheriting
    /// from it after its values changed.
    pub(crate) fn refresh_states(&mut self, id: ItemId) {
        for member in self.with_transitive_references(id) {
            let effective = self.effective(member);
            let node = self.node_mut(member);
            if !matches!(node.state, LifecycleState::Applied | LifecycleState::Updated) {
                continue;
            }
            let unchanged = node
                .applied
                .as_ref()
                .is_some_and(|applied| applied.effective == effective);
            node.state = if unchanged {
                LifecycleState::Applied
            } else {
                LifecycleState::Updated
            };
        }
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// The largest subset of `candidates` that can be deleted without
    /// orphaning anything: every member's children and references are
    /// members too.
    pub(crate) fn prune(&self, mut candidates: BTreeSet<ItemId>) -> BTreeSet<ItemId> {
        loop {
            let blocked: Vec<ItemId> = candidates
                .iter()
                .copied()
                .filter(|id| {
                    let orphaned_child = self
                        .node(*id)
                        .children
                        .values()
                        .any(|child| !candidates.contains(child));
                    let live_reference = self
                        .references
                        .get(id)
                        .is_some_and(|refs| refs.iter().any(|r| !candidates.contains(r)));
                    orphaned_child || live_reference
                })
                .collect();
            if blocked.is_empty() {
                return candidates;
            }
            for id in blocked {
                candidates.remove(&id);
            }
        }
    }

    /// Drop items from the arena and every index. Callers pass closed sets
    /// (see [`Model::prune`]).
    pub(crate) fn delete_nodes(&mut self, ids: &BTreeSet<ItemId>) {
        for id in ids {
            let Some(node) = self.nodes.remove(id) else {
                continue;
            };
            self.paths.remove(&node.path);
            if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
                parent.children.remove(node.path.name());
            }
            if let Some(source) = node.source {
                if let Some(refs) = self.references.get_mut(&source) {
                    refs.remove(id);
                    if refs.is_empty() {
                        self.references.remove(&source);
                    }
                }
            }
            self.references.remove(id);
            tracing::debug!(path = %node.path, "item deleted");
        }
    }
}

fn exists(path: &ItemPath) -> ModelError {
    ModelError::new(ErrorKind::ItemExists, format!("Item already exists: {path}")).at(path)
}
