//! Model-wide validation and the commit/rollback side of item lifecycles.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ModelError, ModelErrors, ModelResult};
use crate::item::{DeltaKind, ItemId, LifecycleState};
use crate::path::ItemPath;
use crate::registry::ChildDef;

use super::Model;

/// What a [`Model::commit`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    /// Items promoted to Applied.
    pub applied: Vec<ItemPath>,
    /// Items removed from the tree.
    pub deleted: Vec<ItemPath>,
    /// Removals held back because something alive still depends on them.
    pub deferred: Vec<ItemPath>,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.deleted.is_empty() && self.deferred.is_empty()
    }
}

/// What a [`Model::restore_model`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored: Vec<ItemPath>,
    pub deleted: Vec<ItemPath>,
}

impl Model {
    /// Whole-model checks run before a plan is built: required single
    /// children, collection cardinality, and mandatory effective
    /// properties. Items awaiting removal are ignored.
    pub fn validate(&self) -> ModelResult<()> {
        let mut errors = Vec::new();
        for &id in self.paths.values() {
            let node = self.node(id);
            if node.read_only || node.state == LifecycleState::ForRemoval {
                continue;
            }
            if node.collection {
                errors.extend(self.check_cardinality(id));
                continue;
            }

            for (name, child) in self.registry.children(&node.item_type) {
                if !matches!(child, ChildDef::Item { required: true, .. }) {
                    continue;
                }
                let present = node
                    .children
                    .get(name)
                    .is_some_and(|&c| self.node(c).state != LifecycleState::ForRemoval);
                if !present {
                    errors.push(
                        ModelError::new(
                            ErrorKind::MissingRequiredItem,
                            format!("Missing required child item {name:?}"),
                        )
                        .at(&node.path),
                    );
                }
            }

            let effective = self.effective(id);
            for (name, def) in self.registry.properties(&node.item_type) {
                if def.mandatory && !effective.contains_key(name) {
                    errors.push(
                        ModelError::new(
                            ErrorKind::MissingRequiredProperty,
                            format!("Missing required property {name:?}"),
                        )
                        .at(&node.path)
                        .on_property(name),
                    );
                }
            }
        }
        ModelErrors::check(errors)
    }

    fn check_cardinality(&self, collection: ItemId) -> Option<ModelError> {
        let node = self.node(collection);
        let parent = self.node(node.parent?);
        let children = self.registry.children(&parent.item_type);
        let Some(ChildDef::Collection { min, max, .. }) = children.get(node.path.name()) else {
            return None;
        };
        let live = node
            .children
            .values()
            .filter(|&&c| self.node(c).state != LifecycleState::ForRemoval)
            .count();
        let message = if live < *min {
            format!("Collection must contain at least {min} item(s), found {live}")
        } else if max.is_some_and(|max| live > max) {
            format!(
                "Collection must contain at most {} item(s), found {live}",
                max.unwrap_or_default()
            )
        } else {
            return None;
        };
        Some(ModelError::new(ErrorKind::Cardinality, message).at(&node.path))
    }

    /// Apply the outcome of executed plan tasks.
    ///
    /// Creates and updates are promoted to Applied with their current
    /// values recorded. Removals delete the item, but only once nothing
    /// that stays in the tree (children, live references) depends on it;
    /// the rest are reported as deferred and stay ForRemoval. Entries whose
    /// item no longer matches the delta are skipped.
    pub fn commit(&mut self, items: &[(ItemPath, DeltaKind)]) -> CommitReport {
        let mut report = CommitReport::default();
        let mut removals = BTreeSet::new();

        for (path, kind) in items {
            let Some(id) = self.lookup(path) else {
                continue;
            };
            let state = self.node(id).state;
            match (kind, state) {
                (DeltaKind::Create, LifecycleState::Initial)
                | (DeltaKind::Update, LifecycleState::Updated) => {
                    self.mark_applied(id);
                    report.applied.push(path.clone());
                }
                (DeltaKind::Remove, LifecycleState::ForRemoval) => {
                    removals.insert(id);
                }
                _ => {
                    tracing::debug!(path = %path, %kind, %state, "stale delta not committed");
                }
            }
        }

        let doomed = self.prune(removals.clone());
        for id in removals {
            let path = self.node(id).path.clone();
            if doomed.contains(&id) {
                report.deleted.push(path);
            } else {
                report.deferred.push(path);
            }
        }
        self.delete_nodes(&doomed);

        report.applied.sort();
        report.deleted.sort();
        report.deferred.sort();
        tracing::info!(
            applied = report.applied.len(),
            deleted = report.deleted.len(),
            deferred = report.deferred.len(),
            "model changes committed"
        );
        report
    }

    /// Throw away every pending change: Initial items are deleted and
    /// Updated or ForRemoval items get back the values they were last
    /// applied with.
    pub fn restore_model(&mut self) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut initial = BTreeSet::new();

        let ids: Vec<ItemId> = self.paths.values().copied().collect();
        for id in ids {
            let node = self.node_mut(id);
            match node.state {
                LifecycleState::Initial => {
                    initial.insert(id);
                }
                LifecycleState::Updated | LifecycleState::ForRemoval => {
                    if let Some(applied) = &node.applied {
                        node.local = applied.local.clone();
                    }
                    node.state = LifecycleState::Applied;
                    report.restored.push(node.path.clone());
                }
                LifecycleState::Applied => {}
            }
        }

        let doomed = self.prune(initial);
        report.deleted = doomed.iter().map(|&id| self.node(id).path.clone()).collect();
        report.deleted.sort();
        self.delete_nodes(&doomed);

        tracing::info!(
            restored = report.restored.len(),
            deleted = report.deleted.len(),
            "model restored"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::fixtures::model;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn pending(m: &Model) -> Vec<(ItemPath, DeltaKind)> {
        m.pending_deltas()
            .into_iter()
            .map(|d| (d.path, d.kind))
            .collect()
    }

    #[test]
    fn validate_reports_required_children_and_cardinality() {
        let mut m = model();
        m.create(
            "/software/items/svc",
            "service",
            &props(&[("service_name", "httpd"), ("owner", "web"), ("unit", "httpd.service")]),
        )
        .unwrap();
        m.create("/software/items/pkg", "package", &props(&[("name", "a")]))
            .unwrap();
        for dep in ["b", "c", "d"] {
            m.create(
                &format!("/software/items/pkg/deps/{dep}"),
                "package",
                &props(&[("name", dep)]),
            )
            .unwrap();
        }
        let err = m.validate().unwrap_err();
        assert_eq!(err.count(ErrorKind::MissingRequiredItem), 1);
        assert_eq!(err.count(ErrorKind::Cardinality), 1);

        m.create("/software/items/svc/config", "service-config", &BTreeMap::new())
            .unwrap();
        m.remove("/software/items/pkg/deps/d").unwrap();
        m.validate().unwrap();
    }

    #[test]
    fn commit_promotes_and_deletes() {
        let mut m = model();
        m.create("/software/items/pkg", "package", &props(&[("name", "finger")]))
            .unwrap();
        let report = m.commit(&pending(&m));
        assert_eq!(report.applied.len(), 2);
        assert!(m.pending_deltas().is_empty());

        m.remove("/software/items/pkg").unwrap();
        let report = m.commit(&pending(&m));
        assert_eq!(report.deleted.len(), 2);
        assert!(report.deferred.is_empty());
        assert!(!m.exists("/software/items/pkg"));
    }

    #[test]
    fn commit_defers_source_with_live_reference() {
        let mut m = model();
        m.create("/software/items/pkg", "package", &props(&[("name", "finger")]))
            .unwrap();
        m.inherit("/ms/items/pkg", "/software/items/pkg", &BTreeMap::new())
            .unwrap();
        m.commit(&pending(&m));
        m.remove("/software/items/pkg").unwrap();

        // Only the source side of the removal succeeded.
        let source_only: Vec<_> = pending(&m)
            .into_iter()
            .filter(|(p, _)| p.as_str().starts_with("/software"))
            .collect();
        let report = m.commit(&source_only);
        assert_eq!(
            report.deferred,
            vec![ItemPath::parse("/software/items/pkg").unwrap(), ItemPath::parse("/software/items/pkg/deps").unwrap()]
        );
        assert!(m.exists("/software/items/pkg"));

        let report = m.commit(&pending(&m));
        assert_eq!(report.deleted.len(), 4);
        assert!(!m.exists("/ms/items/pkg"));
    }

    #[test]
    fn stale_deltas_are_skipped() {
        let mut m = model();
        m.create("/software/items/pkg", "package", &props(&[("name", "finger")]))
            .unwrap();
        let path = ItemPath::parse("/software/items/pkg").unwrap();
        let report = m.commit(&[(path, DeltaKind::Update)]);
        assert!(report.is_empty());
        assert_eq!(m.state_of("/software/items/pkg"), Some(LifecycleState::Initial));
    }

    #[test]
    fn restore_model_discards_pending_changes() {
        let mut m = model();
        m.create("/software/items/pkg", "package", &props(&[("name", "finger")]))
            .unwrap();
        m.create("/software/items/gone", "package", &props(&[("name", "gone")]))
            .unwrap();
        m.commit(&pending(&m));

        m.update("/software/items/pkg", &props(&[("name", "telnet")]), &[])
            .unwrap();
        m.remove("/software/items/gone").unwrap();
        m.create("/software/items/new", "package", &props(&[("name", "new")]))
            .unwrap();

        let report = m.restore_model();
        assert_eq!(report.deleted.len(), 2);
        assert!(!m.exists("/software/items/new"));
        assert_eq!(m.query("/software/items/pkg").unwrap().value("name"), Some("finger"));
        assert_eq!(m.state_of("/software/items/gone"), Some(LifecycleState::Applied));
        assert!(m.pending_deltas().is_empty());
    }
}
