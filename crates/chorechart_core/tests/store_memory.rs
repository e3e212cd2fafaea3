use chorechart_core::service::sync_service::toggle_completed;
use chorechart_core::{
    default_app_state, AppState, ChildId, MemoryStore, Schema, StoreAdapter, StoreError,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(Arc::new(Schema::default())))
}

#[tokio::test]
async fn get_normalizes_legacy_raw_documents() {
    let schema = Arc::new(Schema::default());
    let store = MemoryStore::with_raw(
        schema,
        json!({ "children": { "alex": { "completedTasks": { "0": "make_bed", "4": "ghost" } } } }),
    );

    let state = store.get().await.unwrap().unwrap();
    let alex = state.child(ChildId::Alex).unwrap();
    assert_eq!(alex.completed_tasks.len(), 1);
    assert!(alex.is_completed("make_bed"));
    assert_eq!(state.children.len(), 3);
}

#[tokio::test]
async fn empty_store_reads_as_absent() {
    assert_eq!(store().get().await.unwrap(), None);
}

#[tokio::test]
async fn set_stores_the_normalized_form() {
    let store = store();
    let mut state = default_app_state();
    state
        .children
        .get_mut(&ChildId::Cecci)
        .unwrap()
        .completed_tasks
        .insert("not_a_task".to_string());

    store.set(&state).await.unwrap();

    let raw = store.raw_document().unwrap();
    assert_eq!(raw["children"]["cecci"]["completedTasks"], json!([]));
    assert_eq!(store.get().await.unwrap(), Some(default_app_state()));
}

#[tokio::test]
async fn conflicting_write_reruns_the_mutator() {
    let store = store();
    store.set(&default_app_state()).await.unwrap();

    let mut racing = default_app_state();
    racing
        .children
        .get_mut(&ChildId::Vicka)
        .unwrap()
        .completed_tasks
        .insert("read_book".to_string());
    store.inject_conflict(racing.to_json().unwrap());

    let calls = AtomicUsize::new(0);
    let mutator = |state: AppState| {
        calls.fetch_add(1, Ordering::SeqCst);
        toggle_completed(state, ChildId::Alex, "make_bed")
    };
    let committed = store.transactional_update(&mutator).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(committed.child(ChildId::Alex).unwrap().is_completed("make_bed"));
    assert!(committed.child(ChildId::Vicka).unwrap().is_completed("read_book"));
    assert_eq!(store.get().await.unwrap(), Some(committed));
}

#[tokio::test]
async fn endless_conflicts_exhaust_the_retry_budget() {
    let store = store();
    store.set(&default_app_state()).await.unwrap();
    for _ in 0..chorechart_core::store::MAX_TRANSACTION_ATTEMPTS {
        store.inject_conflict(default_app_state().to_json().unwrap());
    }

    let mutator = |state: AppState| toggle_completed(state, ChildId::Alex, "make_bed");
    let err = store.transactional_update(&mutator).await.unwrap_err();
    assert!(matches!(err, StoreError::TransactionConflict { attempts: 25 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_toggles_keep_both_changes() {
    let store = store();
    store.set(&default_app_state()).await.unwrap();

    let tasks = ["make_bed", "brush_teeth_morning"].map(|task_id| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mutator = move |state: AppState| toggle_completed(state, ChildId::Alex, task_id);
            store.transactional_update(&mutator).await.unwrap();
        })
    });
    for task in tasks {
        task.await.unwrap();
    }

    let state = store.get().await.unwrap().unwrap();
    let alex = state.child(ChildId::Alex).unwrap();
    assert!(alex.is_completed("make_bed"));
    assert!(alex.is_completed("brush_teeth_morning"));
}

#[tokio::test]
async fn unchanged_result_commits_nothing() {
    let store = store();
    store.set(&default_app_state()).await.unwrap();
    let revision = store.revision();

    let committed = store
        .transactional_update(&|state: AppState| toggle_completed(state, ChildId::Alex, "ghost"))
        .await
        .unwrap();

    assert_eq!(committed, default_app_state());
    assert_eq!(store.revision(), revision);
}

#[tokio::test]
async fn subscribers_see_own_and_foreign_writes_in_order() {
    let store = store();
    let mut changes = store.subscribe();

    store.set(&default_app_state()).await.unwrap();
    store.write_raw(json!({ "children": { "alex": { "completedTasks": ["make_bed"] } } }));

    let first = changes.next().await.unwrap();
    assert_eq!(first, default_app_state());
    let second = changes.next().await.unwrap();
    assert!(second.child(ChildId::Alex).unwrap().is_completed("make_bed"));
}

#[tokio::test]
async fn offline_store_rejects_operations_and_reports_transitions() {
    let store = store();
    let mut connectivity = store.subscribe_connectivity();
    assert!(connectivity.current());

    store.set_online(false);
    let reading = tokio::time::timeout(Duration::from_secs(1), connectivity.changed())
        .await
        .unwrap();
    assert_eq!(reading, Some(false));
    assert!(matches!(store.get().await, Err(StoreError::Offline)));

    store.set_online(true);
    assert!(store.get().await.is_ok());
}

#[tokio::test]
async fn injected_failures_surface_as_unavailable() {
    let store = store();
    store.fail_next(1);
    assert!(matches!(
        store.set(&default_app_state()).await,
        Err(StoreError::Unavailable(_))
    ));
    store.set(&default_app_state()).await.unwrap();
}
