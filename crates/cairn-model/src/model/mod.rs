//! The item tree.
//!
//! Items live in a flat arena keyed by [`ItemId`]. A `BTreeMap` indexes them
//! by path (so subtree walks are range scans) and a reverse-adjacency map
//! records, for every source item, the reference items bound to it.
//! References hold the id of their source, never the source itself.
//!
//! Every mutation validates fully before touching the arena, so a rejected
//! request leaves the model exactly as it was.

mod lifecycle;
mod mutate;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{ErrorKind, ModelError, ModelResult};
use crate::item::{
    AppliedValues, DeltaKind, ItemId, ItemView, LifecycleState, Node, PendingDelta, PropertyView,
};
use crate::path::ItemPath;
use crate::registry::{
    ChildDef, ITEM_TYPE_TYPE, ITEM_TYPES_COLLECTION, PROPERTY_TYPE_TYPE,
    PROPERTY_TYPES_COLLECTION, ROOT_TYPE, RegistryError, TypeRegistry,
};

pub use lifecycle::{CommitReport, RestoreReport};

/// The typed item tree plus its inheritance index.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) registry: TypeRegistry,
    pub(crate) nodes: HashMap<ItemId, Node>,
    pub(crate) paths: BTreeMap<ItemPath, ItemId>,
    /// source -> references bound to it
    pub(crate) references: HashMap<ItemId, BTreeSet<ItemId>>,
    next_id: u64,
    pub(crate) root: ItemId,
}

impl Model {
    /// Check the registry and build a fresh tree.
    ///
    /// The root, its declared single children and every collection below
    /// them start out Applied. The registry itself is mirrored read-only
    /// under `/item-types` and `/property-types`.
    pub fn new(registry: TypeRegistry) -> Result<Self, RegistryError> {
        registry.check()?;
        let mut model = Self {
            registry,
            nodes: HashMap::new(),
            paths: BTreeMap::new(),
            references: HashMap::new(),
            next_id: 0,
            root: ItemId(0),
        };
        model.bootstrap();
        tracing::debug!(items = model.nodes.len(), "model bootstrapped");
        Ok(model)
    }

    fn bootstrap(&mut self) {
        let root = self.insert_node(
            None,
            ItemPath::root(),
            ROOT_TYPE.to_owned(),
            false,
            BTreeMap::new(),
            LifecycleState::Applied,
        );
        self.root = root;
        self.node_mut(root).read_only = true;
        self.instantiate_collections(root, LifecycleState::Applied);

        let singles: Vec<(String, String)> = self
            .registry
            .children(ROOT_TYPE)
            .into_iter()
            .filter_map(|(name, child)| match child {
                ChildDef::Item { item_type, .. } => Some((name.to_owned(), item_type.clone())),
                ChildDef::Collection { .. } => None,
            })
            .collect();
        for (name, item_type) in singles {
            let Ok(path) = ItemPath::root().join(&name) else {
                continue;
            };
            let local = self.defaults(&item_type);
            let id = self.insert_node(
                Some(root),
                path,
                item_type,
                false,
                local,
                LifecycleState::Applied,
            );
            self.instantiate_collections(id, LifecycleState::Applied);
        }

        self.mirror_registry();
    }

    /// Publish the registry read-only: every item type under `/item-types`,
    /// every named property type under `/property-types`.
    fn mirror_registry(&mut self) {
        let item_types: Vec<(String, BTreeMap<String, String>)> = self
            .registry
            .types()
            .map(|def| {
                let mut props = BTreeMap::new();
                props.insert("description".to_owned(), def.description.clone());
                if let Some(base) = &def.base {
                    props.insert("base_type".to_owned(), base.clone());
                }
                (def.name.clone(), props)
            })
            .collect();
        self.mirror(ITEM_TYPES_COLLECTION, ITEM_TYPE_TYPE, item_types);

        let property_types: Vec<(String, BTreeMap<String, String>)> = self
            .registry
            .property_types()
            .map(|(name, validator)| {
                let props = BTreeMap::from([("rule".to_owned(), validator.describe())]);
                (name.to_owned(), props)
            })
            .collect();
        self.mirror(PROPERTY_TYPES_COLLECTION, PROPERTY_TYPE_TYPE, property_types);
    }

    fn mirror(
        &mut self,
        collection_name: &str,
        element_type: &str,
        records: Vec<(String, BTreeMap<String, String>)>,
    ) {
        let Some(&collection) = self.node(self.root).children.get(collection_name) else {
            return;
        };
        self.node_mut(collection).read_only = true;
        let base_path = self.node(collection).path.clone();
        for (name, props) in records {
            let Ok(path) = base_path.join(&name) else {
                continue;
            };
            let id = self.insert_node(
                Some(collection),
                path,
                element_type.to_owned(),
                false,
                props,
                LifecycleState::Applied,
            );
            self.node_mut(id).read_only = true;
        }
    }

    // -----------------------------------------------------------------------
    // Arena plumbing
    // -----------------------------------------------------------------------

    // Ids handed to these accessors always come from the arena itself
    // (paths index, child maps, source links), so they are live.
    pub(crate) fn node(&self, id: ItemId) -> &Node {
        &self.nodes[&id]
    }

    pub(crate) fn node_mut(&mut self, id: ItemId) -> &mut Node {
        self.nodes.get_mut(&id).unwrap_or_else(|| unreachable!("dangling item id {id}"))
    }

    pub(crate) fn lookup(&self, path: &ItemPath) -> Option<ItemId> {
        self.paths.get(path).copied()
    }

    /// Parse `raw` and resolve it to a live item.
    pub(crate) fn resolve(&self, raw: &str) -> Result<(ItemPath, ItemId), ModelError> {
        let path = ItemPath::parse(raw)?;
        match self.lookup(&path) {
            Some(id) => Ok((path, id)),
            None => Err(ModelError::invalid_location(format!("Path not found: {path}")).at(&path)),
        }
    }

    pub(crate) fn insert_node(
        &mut self,
        parent: Option<ItemId>,
        path: ItemPath,
        item_type: String,
        collection: bool,
        local: BTreeMap<String, String>,
        state: LifecycleState,
    ) -> ItemId {
        let id = ItemId(self.next_id);
        self.next_id += 1;
        let applied = (state == LifecycleState::Applied).then(|| AppliedValues {
            local: local.clone(),
            effective: local.clone(),
        });
        if let Some(parent) = parent {
            self.node_mut(parent)
                .children
                .insert(path.name().to_owned(), id);
        }
        self.paths.insert(path.clone(), id);
        self.nodes.insert(
            id,
            Node {
                path,
                item_type,
                collection,
                parent,
                children: BTreeMap::new(),
                local,
                source: None,
                state,
                read_only: false,
                applied,
            },
        );
        id
    }

    /// Bind `reference` to `source` in both directions.
    pub(crate) fn link(&mut self, reference: ItemId, source: ItemId) {
        self.node_mut(reference).source = Some(source);
        self.references.entry(source).or_default().insert(reference);
    }

    /// Create the declared collections of an item.
    pub(crate) fn instantiate_collections(&mut self, id: ItemId, state: LifecycleState) {
        let node = self.node(id);
        let base = node.path.clone();
        let collections: Vec<(String, String)> = self
            .registry
            .children(&node.item_type)
            .into_iter()
            .filter_map(|(name, child)| match child {
                ChildDef::Collection { item_type, .. } => {
                    Some((name.to_owned(), item_type.clone()))
                }
                ChildDef::Item { .. } => None,
            })
            .collect();
        for (name, element_type) in collections {
            // Child names are checked by TypeRegistry::check.
            let Ok(path) = base.join(&name) else {
                continue;
            };
            self.insert_node(Some(id), path, element_type, true, BTreeMap::new(), state);
        }
    }

    /// Declared defaults of a type.
    pub(crate) fn defaults(&self, item_type: &str) -> BTreeMap<String, String> {
        self.registry
            .properties(item_type)
            .into_iter()
            .filter_map(|(name, def)| def.default.clone().map(|d| (name.to_owned(), d)))
            .collect()
    }

    /// References bound directly to `id`.
    pub(crate) fn references_of(&self, id: ItemId) -> Vec<ItemId> {
        self.references
            .get(&id)
            .map(|refs| refs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `id` plus every reference reachable from it, transitively.
    pub(crate) fn with_transitive_references(&self, id: ItemId) -> Vec<ItemId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            out.push(current);
            stack.extend(self.references_of(current));
        }
        out
    }

    /// `id` and all of its descendants, parents first.
    pub(crate) fn subtree(&self, id: ItemId) -> Vec<ItemId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            let children: Vec<ItemId> = self.node(out[i]).children.values().copied().collect();
            out.extend(children);
            i += 1;
        }
        out
    }

    /// Effective properties: local values overlaid on the source chain.
    pub(crate) fn effective(&self, id: ItemId) -> BTreeMap<String, String> {
        let mut chain = vec![id];
        let mut current = self.node(id).source;
        while let Some(source) = current {
            if chain.contains(&source) {
                break;
            }
            chain.push(source);
            current = self.node(source).source;
        }
        let mut values = BTreeMap::new();
        for id in chain.into_iter().rev() {
            values.extend(
                self.node(id)
                    .local
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        values
    }

    /// Record the current values as applied and mark the item Applied.
    pub(crate) fn mark_applied(&mut self, id: ItemId) {
        let effective = self.effective(id);
        let node = self.node_mut(id);
        node.applied = Some(AppliedValues {
            local: node.local.clone(),
            effective,
        });
        node.state = LifecycleState::Applied;
    }

    pub(crate) fn view(&self, id: ItemId) -> ItemView {
        let node = self.node(id);
        let is_reference = node.source.is_some();
        let properties = self
            .effective(id)
            .into_iter()
            .map(|(name, value)| {
                let overridden = is_reference && node.local.contains_key(&name);
                (name, PropertyView { value, overridden })
            })
            .collect();
        ItemView {
            path: node.path.clone(),
            item_type: node.type_name(),
            state: node.state,
            source: node.source.map(|s| self.node(s).path.clone()),
            read_only: node.read_only,
            collection: node.collection,
            properties,
            children: node.children.keys().cloned().collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Number of items in the tree, root and registry mirror included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn exists(&self, path: &str) -> bool {
        ItemPath::parse(path).is_ok_and(|p| self.paths.contains_key(&p))
    }

    pub fn state_of(&self, path: &str) -> Option<LifecycleState> {
        let path = ItemPath::parse(path).ok()?;
        self.lookup(&path).map(|id| self.node(id).state)
    }

    /// Effective properties of an item, with override flags.
    pub fn query(&self, path: &str) -> ModelResult<ItemView> {
        let (_, id) = self.resolve(path)?;
        Ok(self.view(id))
    }

    /// A subset of an item's effective properties. Every requested name the
    /// item does not carry is reported.
    pub fn query_properties(
        &self,
        path: &str,
        names: &[&str],
    ) -> ModelResult<BTreeMap<String, PropertyView>> {
        let (path, id) = self.resolve(path)?;
        let mut view = self.view(id);
        let mut errors = Vec::new();
        let mut out = BTreeMap::new();
        for name in names {
            match view.properties.remove(*name) {
                Some(prop) => {
                    out.insert((*name).to_owned(), prop);
                }
                None if out.contains_key(*name) => {}
                None => errors.push(
                    ModelError::new(
                        ErrorKind::InvalidProperty,
                        format!("Item has no property {name:?}"),
                    )
                    .at(&path)
                    .on_property(*name),
                ),
            }
        }
        crate::error::ModelErrors::check(errors)?;
        Ok(out)
    }

    /// Every item at or below `base` whose type is `item_type` or extends it.
    pub fn find(&self, base: &str, item_type: &str) -> ModelResult<Vec<ItemView>> {
        let (base, _) = self.resolve(base)?;
        let prefix = base.as_str().to_owned();
        Ok(self
            .paths
            .range(base.clone()..)
            .take_while(|(path, _)| base.is_root() || path.as_str().starts_with(&prefix))
            .filter(|(path, _)| path.is_within(&base))
            .map(|(_, &id)| id)
            .filter(|&id| {
                let node = self.node(id);
                !node.collection && self.registry.is_subtype(&node.item_type, item_type)
            })
            .map(|id| self.view(id))
            .collect())
    }

    /// Immediate children of an item.
    pub fn children(&self, path: &str) -> ModelResult<Vec<ItemPath>> {
        let (_, id) = self.resolve(path)?;
        Ok(self
            .node(id)
            .children
            .values()
            .map(|&c| self.node(c).path.clone())
            .collect())
    }

    /// Every non-Applied item, in path order.
    pub fn pending_deltas(&self) -> Vec<PendingDelta> {
        self.paths
            .values()
            .filter_map(|&id| {
                let node = self.node(id);
                let kind: DeltaKind = node.state.delta()?;
                Some(PendingDelta {
                    path: node.path.clone(),
                    kind,
                    collection: node.collection,
                    source: node.source.map(|s| self.node(s).path.clone()),
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::model;
    use super::*;

    #[test]
    fn bootstrap_builds_applied_skeleton() {
        let m = model();
        for path in [
            "/",
            "/software",
            "/software/items",
            "/ms",
            "/ms/items",
            "/item-types",
            "/property-types",
        ] {
            assert_eq!(m.state_of(path), Some(LifecycleState::Applied), "{path}");
        }
        assert!(m.pending_deltas().is_empty());
        assert_eq!(m.query("/ms").unwrap().value("hostname"), Some("ms1"));
        assert_eq!(
            m.query("/software/items").unwrap().item_type,
            "collection-of-software-item"
        );
    }

    #[test]
    fn registry_is_mirrored_read_only() {
        let m = model();
        let view = m.query("/item-types/package").unwrap();
        assert!(view.read_only);
        assert_eq!(view.value("base_type"), Some("software-item"));
        assert_eq!(
            m.children("/item-types").unwrap().len(),
            m.registry().len()
        );
    }

    #[test]
    fn property_types_are_mirrored_read_only() {
        let m = model();
        let view = m.query("/property-types/basic_string").unwrap();
        assert!(view.read_only);
        assert_eq!(view.item_type, PROPERTY_TYPE_TYPE);
        assert_eq!(view.value("rule"), Some("matches ^[A-Za-z0-9\\-._]+$"));
        assert_eq!(
            m.children("/property-types").unwrap().len(),
            m.registry().property_types().count()
        );
        assert!(m.query("/property-types").unwrap().read_only);
    }

    #[test]
    fn query_unknown_path_is_invalid_location() {
        let m = model();
        let err = m.query("/software/items/nope").unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::InvalidLocation]);
        let err = m.query("software").unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::InvalidLocation]);
    }

    #[test]
    fn query_properties_reports_each_missing_name() {
        let m = model();
        let props = m.query_properties("/ms", &["hostname"]).unwrap();
        assert_eq!(props["hostname"].value, "ms1");

        let err = m
            .query_properties("/ms", &["hostname", "ip", "mask"])
            .unwrap_err();
        assert_eq!(err.count(ErrorKind::InvalidProperty), 2);
    }
}
