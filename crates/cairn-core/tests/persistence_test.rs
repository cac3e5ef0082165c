//! Snapshot persistence and config resolution.

use std::collections::BTreeMap;

use cairn_core::{ConfigOverrides, EngineConfig, PlanState};
use cairn_model::LifecycleState;
use cairn_test_utils::{SamplePlugin, engine_with, props};

#[tokio::test]
async fn model_survives_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("model.json");
    let config = EngineConfig::in_memory().with_snapshot_path(&path);

    let plugin = SamplePlugin::new();
    {
        let engine = engine_with(config.clone(), &plugin);
        engine
            .create("/software/items/pkg", "package", &props(&[("name", "finger")]))
            .await
            .unwrap();
        engine
            .inherit("/ms/items/pkg", "/software/items/pkg", &props(&[("version", "2")]))
            .await
            .unwrap();
        engine.create_plan().await.unwrap();
        let state = engine.run_plan().await.unwrap().wait().await.unwrap();
        assert_eq!(state, PlanState::Complete);
        engine
            .update("/software/items/pkg", &props(&[("ensure", "latest")]), &[])
            .await
            .unwrap();
    }
    assert!(path.exists());

    let engine = engine_with(config, &plugin);
    let src = engine.query("/software/items/pkg").await.unwrap();
    assert_eq!(src.state, LifecycleState::Updated);
    assert_eq!(src.value("ensure"), Some("latest"));

    let reference = engine.query("/ms/items/pkg").await.unwrap();
    assert_eq!(reference.source.as_ref().map(|p| p.as_str()), Some("/software/items/pkg"));
    assert_eq!(reference.value("ensure"), Some("latest"));
    assert_eq!(reference.value("version"), Some("2"));
    assert!(reference.is_overridden("version"));
    assert_eq!(reference.state, LifecycleState::Updated);

    // The restored model still knows its applied values.
    engine.restore_model().await.unwrap();
    let src = engine.query("/software/items/pkg").await.unwrap();
    assert_eq!(src.state, LifecycleState::Applied);
    assert_eq!(src.value("ensure"), Some("installed"));
    assert!(engine.show_plan().await.is_err());
}

#[tokio::test]
async fn in_memory_engine_writes_nothing() {
    let plugin = SamplePlugin::new();
    let engine = engine_with(EngineConfig::in_memory(), &plugin);
    engine
        .create("/software/items/pkg", "package", &props(&[("name", "finger")]))
        .await
        .unwrap();
    assert!(engine.config().snapshot_path.is_none());
    assert_eq!(engine.pending_deltas().await.len(), 1);
}

#[test]
fn file_settings_feed_the_engine_config() {
    let tmp = tempfile::TempDir::new().unwrap();
    let file_path = tmp.path().join("config.toml");
    std::fs::write(
        &file_path,
        "[engine]\nmax_parallel_tasks = 2\nsnapshot_path = \"/srv/cairn/model.json\"\n",
    )
    .unwrap();
    let file = cairn_core::config::load_config_file(&file_path).unwrap();

    let config =
        EngineConfig::resolve_with(&ConfigOverrides::default(), Some(&file), |_| None).unwrap();
    assert_eq!(config.max_parallel_tasks, 2);
    assert_eq!(
        config.snapshot_path.as_deref(),
        Some(std::path::Path::new("/srv/cairn/model.json"))
    );
    assert_eq!(config.log_filter, EngineConfig::DEFAULT_LOG_FILTER);

    let env: BTreeMap<&str, &str> = BTreeMap::from([("CAIRN_MAX_PARALLEL_TASKS", "4")]);
    let config = EngineConfig::resolve_with(&ConfigOverrides::default(), Some(&file), |var| {
        env.get(var).map(|v| (*v).to_owned())
    })
    .unwrap();
    assert_eq!(config.max_parallel_tasks, 4);
}
