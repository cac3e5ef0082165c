//! Inheritance through the public model API, including reference chains.

use std::collections::BTreeMap;

use cairn_model::registry::ROOT_TYPE;
use cairn_model::{
    ChildDef, DeltaKind, ItemPath, ItemTypeDef, LifecycleState, Model, PropertyDef, Removal,
    TypeRegistry, Validator,
};

fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn model() -> Model {
    let mut reg = TypeRegistry::with_core_types();
    reg.register(
        ItemTypeDef::new("repo")
            .property(PropertyDef::new("url").mandatory())
            .property(
                PropertyDef::new("enabled")
                    .default_value("true")
                    .validator(Validator::boolean()),
            ),
    )
    .unwrap();
    reg.register(ItemTypeDef::new("site").child("repos", ChildDef::collection("repo")))
        .unwrap();
    reg.register(ItemTypeDef::new("sites").child("all", ChildDef::collection("site")))
        .unwrap();
    reg.add_child(ROOT_TYPE, "library", ChildDef::collection("repo"))
        .unwrap();
    reg.add_child(ROOT_TYPE, "sites", ChildDef::item("sites"))
        .unwrap();
    Model::new(reg).unwrap()
}

fn commit_all(model: &mut Model) {
    let deltas: Vec<(ItemPath, DeltaKind)> = model
        .pending_deltas()
        .into_iter()
        .map(|d| (d.path, d.kind))
        .collect();
    model.commit(&deltas);
}

#[test]
fn chained_references_follow_the_original_source() {
    let mut m = model();
    m.create("/library/base", "repo", &props(&[("url", "http://a")]))
        .unwrap();
    m.create("/sites/all/east", "site", &BTreeMap::new()).unwrap();
    m.create("/sites/all/west", "site", &BTreeMap::new()).unwrap();
    m.inherit("/sites/all/east/repos/base", "/library/base", &BTreeMap::new())
        .unwrap();
    m.inherit(
        "/sites/all/west/repos/base",
        "/sites/all/east/repos/base",
        &BTreeMap::new(),
    )
    .unwrap();
    commit_all(&mut m);
    assert!(m.pending_deltas().is_empty());

    m.update("/library/base", &props(&[("url", "http://b")]), &[])
        .unwrap();
    for path in ["/sites/all/east/repos/base", "/sites/all/west/repos/base"] {
        let view = m.query(path).unwrap();
        assert_eq!(view.value("url"), Some("http://b"), "{path}");
        assert_eq!(view.state, LifecycleState::Updated, "{path}");
    }

    // An override in the middle of the chain shadows the original source.
    m.update("/sites/all/east/repos/base", &props(&[("enabled", "false")]), &[])
        .unwrap();
    let west = m.query("/sites/all/west/repos/base").unwrap();
    assert_eq!(west.value("enabled"), Some("false"));
    assert!(!west.is_overridden("enabled"));

    // Putting the source back the way it was applied settles the chain.
    m.update("/sites/all/east/repos/base", &BTreeMap::new(), &["enabled"])
        .unwrap();
    m.update("/library/base", &props(&[("url", "http://a")]), &[])
        .unwrap();
    assert!(m.pending_deltas().is_empty());
}

#[test]
fn removing_the_head_of_a_chain_marks_every_link() {
    let mut m = model();
    m.create("/library/base", "repo", &props(&[("url", "http://a")]))
        .unwrap();
    m.create("/sites/all/east", "site", &BTreeMap::new()).unwrap();
    m.inherit("/sites/all/east/repos/base", "/library/base", &BTreeMap::new())
        .unwrap();
    commit_all(&mut m);

    let removal = m.remove("/library/base").unwrap();
    assert!(matches!(removal, Removal::MarkedForRemoval(_)));
    assert_eq!(
        m.state_of("/sites/all/east/repos/base"),
        Some(LifecycleState::ForRemoval)
    );

    // Committing only the source cannot delete it while its reference lives.
    let report = m.commit(&[(ItemPath::parse("/library/base").unwrap(), DeltaKind::Remove)]);
    assert!(report.deleted.is_empty());
    assert_eq!(report.deferred.len(), 1);
    assert!(m.exists("/library/base"));

    commit_all(&mut m);
    assert!(!m.exists("/library/base"));
    assert!(!m.exists("/sites/all/east/repos/base"));
    assert!(m.exists("/sites/all/east"));
}

#[test]
fn snapshot_roundtrip_keeps_links() {
    let mut m = model();
    m.create("/library/base", "repo", &props(&[("url", "http://a")]))
        .unwrap();
    m.create("/sites/all/east", "site", &BTreeMap::new()).unwrap();
    m.inherit(
        "/sites/all/east/repos/base",
        "/library/base",
        &props(&[("enabled", "false")]),
    )
    .unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("model.json");
    cairn_model::save_snapshot(&file, &m.snapshot()).unwrap();
    let loaded = cairn_model::load_snapshot(&file).unwrap();
    let mut restored = Model::from_snapshot(m.registry().clone(), &loaded).unwrap();

    assert_eq!(
        restored.query("/sites/all/east/repos/base").unwrap(),
        m.query("/sites/all/east/repos/base").unwrap()
    );
    restored
        .update("/library/base", &props(&[("url", "http://c")]), &[])
        .unwrap();
    assert_eq!(
        restored
            .query("/sites/all/east/repos/base")
            .unwrap()
            .value("url"),
        Some("http://c")
    );
}
