//! JSON persistence of the item tree.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{AppliedValues, LifecycleState};
use crate::model::Model;
use crate::path::ItemPath;
use crate::registry::TypeRegistry;

/// One persisted item. The root and the registry mirror are rebuilt from
/// the registry on load and are not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub path: ItemPath,
    pub item_type: String,
    #[serde(default)]
    pub collection: bool,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ItemPath>,
    #[serde(default)]
    pub local: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedValues>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub saved_at: DateTime<Utc>,
    pub items: Vec<ItemRecord>,
}

impl Model {
    pub fn snapshot(&self) -> ModelSnapshot {
        let items = self
            .paths
            .values()
            .map(|&id| self.node(id))
            .filter(|node| !node.read_only)
            .map(|node| ItemRecord {
                path: node.path.clone(),
                item_type: node.item_type.clone(),
                collection: node.collection,
                state: node.state,
                source: node.source.map(|s| self.node(s).path.clone()),
                local: node.local.clone(),
                applied: node.applied.clone(),
            })
            .collect();
        ModelSnapshot {
            saved_at: Utc::now(),
            items,
        }
    }

    /// Rebuild a model from a snapshot taken with a compatible registry.
    pub fn from_snapshot(registry: TypeRegistry, snapshot: &ModelSnapshot) -> Result<Model> {
        let mut model = Model::new(registry).context("item type registry is inconsistent")?;

        let mut records: Vec<&ItemRecord> = snapshot.items.iter().collect();
        records.sort_by_key(|r| r.path.depth());

        for record in &records {
            if !model.registry.contains(&record.item_type) {
                bail!(
                    "snapshot item {} has unregistered type {:?}",
                    record.path,
                    record.item_type
                );
            }
            if let Some(id) = model.lookup(&record.path) {
                let node = model.node_mut(id);
                node.local = record.local.clone();
                node.state = record.state;
                node.applied = record.applied.clone();
                continue;
            }
            let parent_path = record
                .path
                .parent()
                .context("snapshot contains a second root item")?;
            let parent = model
                .lookup(&parent_path)
                .with_context(|| format!("parent of {} missing from snapshot", record.path))?;
            let id = model.insert_node(
                Some(parent),
                record.path.clone(),
                record.item_type.clone(),
                record.collection,
                record.local.clone(),
                record.state,
            );
            model.node_mut(id).applied = record.applied.clone();
        }

        for record in &records {
            let Some(source) = &record.source else {
                continue;
            };
            let id = model
                .lookup(&record.path)
                .with_context(|| format!("item {} vanished while loading", record.path))?;
            let source_id = model
                .lookup(source)
                .with_context(|| format!("source {source} of {} missing", record.path))?;
            model.link(id, source_id);
        }

        tracing::info!(items = records.len(), "model restored from snapshot");
        Ok(model)
    }
}

/// Write a snapshot as JSON, atomically (temp file + rename).
pub fn save_snapshot(path: &Path, snapshot: &ModelSnapshot) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let json = serde_json::to_vec_pretty(snapshot).context("failed to serialize snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
    tracing::debug!(path = %path.display(), items = snapshot.items.len(), "snapshot saved");
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<ModelSnapshot> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
