use super::*;
use pipewise::model::{Experiment, ExperimentConfig, SuccessCriteria};
use pipewise::store::ExperimentStore;
use std::collections::BTreeMap;

fn experiment() -> Experiment {
    Experiment::new(
        "exp-main",
        "store smoke test",
        ExperimentConfig {
            baseline_pipeline: "process-baseline-v1".to_string(),
            candidate_pipeline: "process-topk-v1".to_string(),
            target_nodes: BTreeMap::new(),
            duration: "30m".to_string(),
            success_criteria: SuccessCriteria::default(),
            parameters: BTreeMap::new(),
        },
        chrono::Utc::now(),
    )
}

#[tokio::test]
async fn test_store_defaults_to_memory() {
    let store = open_store(&Config::default()).unwrap();
    store.create(&experiment()).await.unwrap();
    assert_eq!(store.get("exp-main").await.unwrap().name, "store smoke test");
}

#[tokio::test]
async fn test_store_uses_sqlite_when_path_is_set() {
    let config = Config {
        database_path: Some(":memory:".to_string()),
        ..Config::default()
    };
    let store = open_store(&config).unwrap();
    store.create(&experiment()).await.unwrap();
    assert!(store.get("exp-main").await.is_ok());
}
