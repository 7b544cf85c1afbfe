use super::*;
use crate::model::{ExperimentConfig, ExperimentStatus, SuccessCriteria, Variant};
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;

fn config() -> ExperimentConfig {
    ExperimentConfig {
        baseline_pipeline: "process-baseline-v1".to_string(),
        candidate_pipeline: "process-priority-filter-v1".to_string(),
        target_nodes: vec![("pool".to_string(), "edge".to_string())]
            .into_iter()
            .collect(),
        duration: "30m".to_string(),
        success_criteria: SuccessCriteria {
            min_cardinality_reduction: 25.0,
            max_cpu_overhead: 7.5,
            max_memory_overhead: 12.0,
            min_critical_process_coverage: 99.5,
        },
        parameters: BTreeMap::new(),
    }
}

fn experiment(id: &str, created_minute: u32) -> Experiment {
    let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, created_minute, 0).unwrap();
    Experiment::new(id, format!("trial {}", id), config(), created)
}

fn deployment(id: &str, experiment_id: &str, variant: Variant) -> Deployment {
    Deployment {
        id: id.to_string(),
        name: id.to_string(),
        experiment_id: experiment_id.to_string(),
        variant,
        pipeline: variant.as_str().to_string(),
        namespace: "pipewise-experiments".to_string(),
        desired_instances: 3,
        ready_instances: 0,
        updated_instances: 0,
        instances: vec![],
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

async fn create_then_get_round_trips(store: &dyn Store) {
    let exp = experiment("exp-1", 0);
    store.create(&exp).await.unwrap();

    let loaded = store.get("exp-1").await.unwrap();
    assert_eq!(loaded, exp);
    assert_eq!(
        serde_json::to_vec(&loaded.config).unwrap(),
        serde_json::to_vec(&exp.config).unwrap()
    );

    // Two reads without an update are identical
    let again = store.get("exp-1").await.unwrap();
    assert_eq!(loaded, again);
}

async fn create_rejects_duplicates(store: &dyn Store) {
    let exp = experiment("dup", 0);
    store.create(&exp).await.unwrap();
    let err = store.create(&exp).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

async fn get_unknown_is_not_found(store: &dyn Store) {
    let err = store.get("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

async fn update_never_changes_config(store: &dyn Store) {
    let exp = experiment("exp-cfg", 0);
    store.create(&exp).await.unwrap();

    let mut changed = exp.clone();
    changed.phase = Phase::Initializing;
    changed.config.candidate_pipeline = "something-else".to_string();
    changed.config.success_criteria.max_cpu_overhead = 99.0;
    changed.status = ExperimentStatus {
        message: Some("Starting".to_string()),
        ..Default::default()
    };
    changed.updated_at = exp.updated_at + Duration::seconds(1);
    store.update(&changed).await.unwrap();

    let loaded = store.get("exp-cfg").await.unwrap();
    assert_eq!(loaded.phase, Phase::Initializing);
    assert_eq!(loaded.status.message.as_deref(), Some("Starting"));
    assert_eq!(loaded.config, exp.config);
    assert_eq!(loaded.updated_at, changed.updated_at);
}

async fn update_rejects_stale_record(store: &dyn Store) {
    let exp = experiment("exp-stale", 0);
    store.create(&exp).await.unwrap();

    let mut newer = exp.clone();
    newer.phase = Phase::Initializing;
    newer.updated_at = exp.updated_at + Duration::seconds(10);
    store.update(&newer).await.unwrap();

    let mut stale = exp.clone();
    stale.phase = Phase::Cancelled;
    stale.updated_at = exp.updated_at + Duration::seconds(5);
    let err = store.update(&stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let loaded = store.get("exp-stale").await.unwrap();
    assert_eq!(loaded.phase, Phase::Initializing);
}

async fn update_unknown_is_not_found(store: &dyn Store) {
    let err = store.update(&experiment("ghost", 0)).await.unwrap_err();
    assert!(err.is_not_found());
}

async fn transition_requires_expected_phase(store: &dyn Store) {
    let exp = experiment("exp-cas", 0);
    store.create(&exp).await.unwrap();

    let mut cancelled = exp.clone();
    cancelled.phase = Phase::Cancelled;
    store.transition(&cancelled, Phase::Pending).await.unwrap();

    // Same timestamp, but the record already left pending
    let mut started = exp.clone();
    started.phase = Phase::Initializing;
    let err = store.transition(&started, Phase::Pending).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::PhaseChanged {
            expected: Phase::Pending,
            actual: Phase::Cancelled,
            ..
        }
    ));
    assert_eq!(store.get("exp-cas").await.unwrap().phase, Phase::Cancelled);
}

async fn list_filters_and_orders_newest_first(store: &dyn Store) {
    for (id, minute) in [("a", 1), ("b", 3), ("c", 2), ("d", 4)] {
        store.create(&experiment(id, minute)).await.unwrap();
    }
    let mut running = store.get("c").await.unwrap();
    running.phase = Phase::Running;
    running.updated_at += Duration::seconds(1);
    store.update(&running).await.unwrap();

    let all = store.list(&ListFilter::default()).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["d", "b", "c", "a"]);

    let pending = store.list(&ListFilter::phase(Phase::Pending)).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["d", "b", "a"]);

    let page = store
        .list(&ListFilter {
            phase: None,
            limit: 2,
            offset: 1,
        })
        .await
        .unwrap();
    let ids: Vec<&str> = page.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);
}

async fn deployments_round_trip(store: &dyn Store) {
    let baseline = deployment("exp-1-baseline", "exp-1", Variant::Baseline);
    let candidate = deployment("exp-1-candidate", "exp-1", Variant::Candidate);
    store.put_deployment(&candidate).await.unwrap();
    store.put_deployment(&baseline).await.unwrap();
    store
        .put_deployment(&deployment("exp-2-baseline", "exp-2", Variant::Baseline))
        .await
        .unwrap();

    assert_eq!(store.get_deployment("exp-1-baseline").await.unwrap(), baseline);

    let listed = store.list_deployments("exp-1").await.unwrap();
    assert_eq!(listed, vec![baseline.clone(), candidate]);

    let mut replaced = baseline;
    replaced.ready_instances = 3;
    store.put_deployment(&replaced).await.unwrap();
    assert_eq!(
        store.get_deployment("exp-1-baseline").await.unwrap().ready_instances,
        3
    );

    assert!(store
        .get_deployment("nope")
        .await
        .unwrap_err()
        .is_not_found());
}

macro_rules! store_suite {
    ($($name:ident),* $(,)?) => {
        mod memory_store {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let store = MemoryStore::new();
                    super::$name(&store).await;
                }
            )*
        }

        mod sqlite_store {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let store = SqliteStore::in_memory().unwrap();
                    super::$name(&store).await;
                }
            )*
        }
    };
}

store_suite!(
    create_then_get_round_trips,
    create_rejects_duplicates,
    get_unknown_is_not_found,
    update_never_changes_config,
    update_rejects_stale_record,
    update_unknown_is_not_found,
    transition_requires_expected_phase,
    list_filters_and_orders_newest_first,
    deployments_round_trip,
);

#[tokio::test]
async fn test_sqlite_store_persists_across_handles() {
    let path = std::env::temp_dir().join(format!("pipewise-{}.db", uuid::Uuid::new_v4()));
    {
        let store = SqliteStore::open(&path).unwrap();
        store.create(&experiment("durable", 0)).await.unwrap();
    }
    let reopened = SqliteStore::open(&path).unwrap();
    let loaded = reopened.get("durable").await.unwrap();
    assert_eq!(loaded.config, config());
    let _ = std::fs::remove_file(&path);
}
