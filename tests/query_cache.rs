use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use shopdesk::query::{BoxError, QueryClient, QueryClientConfig, QueryOptions};
use shopdesk::query_key;
use tokio::sync::oneshot;

fn client() -> QueryClient<Value> {
    QueryClient::new(QueryClientConfig::default())
}

fn counting(
    calls: &Arc<AtomicUsize>,
    value: Value,
) -> impl Fn() -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move { Ok(value) }.boxed()
    }
}

fn orders(count: usize) -> Value {
    let items: Vec<Value> = (1..=count).map(|id| json!({ "id": id })).collect();
    json!({ "orders": items })
}

fn order_count(value: &Value) -> usize {
    value["orders"].as_array().map_or(0, Vec::len)
}

#[tokio::test(start_paused = true)]
async fn dashboard_orders_scenario() {
    let client = client();
    let key = query_key!["orders"];
    let calls = Arc::new(AtomicUsize::new(0));

    let a = client.observe(
        key.clone(),
        counting(&calls, orders(5)),
        QueryOptions::default().with_stale_time(Duration::ZERO),
    );
    let state = a.settled().await;
    assert_eq!(state.data.as_deref().map(order_count), Some(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    let b = client.observe(
        key.clone(),
        counting(&calls, orders(99)),
        QueryOptions::default().with_stale_time(Duration::from_secs(60)),
    );
    let b_state = b.state();
    assert!(!b_state.is_fetching);
    assert!(!b_state.is_loading);
    assert_eq!(b_state.data.as_deref().map(order_count), Some(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    client.update_query_data(&key, |old| {
        let mut next = old.cloned().unwrap_or_else(|| orders(0));
        if let Some(list) = next["orders"].as_array_mut() {
            list.push(json!({ "id": 6 }));
        }
        next
    });

    assert_eq!(a.data().as_deref().map(order_count), Some(6));
    assert_eq!(b.data().as_deref().map(order_count), Some(6));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn equal_identities_share_entry_and_subscribers() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = query_key!["products", json!({ "page": 1, "q": "red" })];
    let second = query_key!["products", json!({ "q": "red", "page": 1 })];
    assert_eq!(first, second);

    let a = client.observe(
        first.clone(),
        counting(&calls, json!([1])),
        QueryOptions::default(),
    );
    a.settled().await;
    let b = client.observe(
        second.clone(),
        counting(&calls, json!([2])),
        QueryOptions::default().with_enabled(false),
    );

    assert_eq!(client.len(), 1);
    assert_eq!(client.subscriber_count(&first), 2);
    assert_eq!(b.data(), a.data());
}

#[tokio::test(start_paused = true)]
async fn staleness_gate_decides_fetches() {
    let client = client();
    let key = query_key!["customers"];
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default().with_stale_time(Duration::from_millis(1_000));

    let first = client.observe(key.clone(), counting(&calls, json!(1)), options);
    first.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(999)).await;
    let fresh = client.observe(key.clone(), counting(&calls, json!(2)), options);
    fresh.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fresh.data().as_deref(), Some(&json!(1)));

    tokio::time::advance(Duration::from_millis(1)).await;
    let stale = client.observe(key.clone(), counting(&calls, json!(3)), options);
    stale.settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(stale.data().as_deref(), Some(&json!(3)));
}

#[tokio::test(start_paused = true)]
async fn refreshed_entry_survives_older_sweep() {
    let client = client();
    let key = query_key!["orders", "recent"];
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default().with_cache_time(Duration::from_millis(1_000));

    let observer = client.observe(key.clone(), counting(&calls, json!("v")), options);
    observer.settled().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    observer.refetch().await.expect("refetch succeeds");

    // The sweep from the first fetch fires at 1000ms.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(client.contains_query(&key));

    // The sweep from the refetch fires at 1500ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!client.contains_query(&key));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fetch_fans_out_to_every_observer() {
    let client = client();
    let key = query_key!["inventory"];
    let calls = Arc::new(AtomicUsize::new(0));

    let passive: Vec<_> = (0..4)
        .map(|_| {
            client.observe(
                key.clone(),
                counting(&calls, json!("unused")),
                QueryOptions::default().with_enabled(false),
            )
        })
        .collect();

    let active = client.observe(
        key.clone(),
        counting(&calls, json!({ "sku": 7 })),
        QueryOptions::default(),
    );
    active.settled().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for observer in &passive {
        assert_eq!(observer.data().as_deref(), Some(&json!({ "sku": 7 })));
        assert!(!observer.state().is_fetching);
    }
}

#[tokio::test]
async fn invalidation_matches_prefix_only() {
    let client = client();
    client.set_query_data(&query_key!["products"], json!(1));
    client.set_query_data(&query_key!["products", "admin"], json!(2));
    client.set_query_data(&query_key!["products", 42], json!(3));
    client.set_query_data(&query_key!["customers"], json!(4));
    client.set_query_data(&query_key!["productsArchive"], json!(5));

    let removed = client.invalidate_queries(&query_key!["products"]);

    assert_eq!(removed, 3);
    assert_eq!(
        client.get_query_data(&query_key!["customers"]).as_deref(),
        Some(&json!(4))
    );
    assert!(client.contains_query(&query_key!["productsArchive"]));
    assert!(!client.contains_query(&query_key!["products", "admin"]));
}

#[tokio::test]
async fn invalidated_observer_refetches() {
    let client = client();
    let key = query_key!["products", "admin"];
    let calls = Arc::new(AtomicUsize::new(0));

    let observer = client.observe(
        key.clone(),
        counting(&calls, json!(["a"])),
        QueryOptions::default(),
    );
    observer.settled().await;

    client.invalidate_queries(&query_key!["products"]);
    let mut changes = observer.watch();
    changes
        .wait_for(|state| state.data.is_some() && !state.is_fetching)
        .await
        .expect("observer alive");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client.contains_query(&key));
}

#[tokio::test]
async fn failed_fetch_leaves_shared_entry_alone() {
    let client = client();
    let key = query_key!["orders", 17];
    client.set_query_data(&key, json!({ "status": "paid" }));
    let before = client.get_query_entry(&key).expect("seeded entry");

    let observer = client.observe(
        key.clone(),
        || async { Err::<Value, BoxError>("503 service unavailable".into()) },
        QueryOptions::default(),
    );
    let state = observer.settled().await;

    assert!(state.is_error);
    assert!(state.data.is_none());
    let after = client.get_query_entry(&key).expect("entry kept");
    assert_eq!(after.value, before.value);
    assert_eq!(after.fetched_at, before.fetched_at);
}

#[tokio::test]
async fn detaching_mid_fetch_is_safe() {
    let client = client();
    let key = query_key!["reports", "monthly"];
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let gate = Arc::new(Mutex::new(Some(release_rx)));

    let observer = client.observe(
        key.clone(),
        move || {
            let rx = gate.lock().expect("gate lock").take();
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok::<Value, BoxError>(json!({ "total": 12 }))
            }
        },
        QueryOptions::default(),
    );
    tokio::task::yield_now().await;
    observer.detach();
    assert_eq!(client.subscriber_count(&key), 0);

    let _ = release_tx.send(());
    for _ in 0..50 {
        if client.contains_query(&key) {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(
        client.get_query_data(&key).as_deref(),
        Some(&json!({ "total": 12 }))
    );
}

#[tokio::test]
async fn remove_and_clear_drop_entries_silently() {
    let client = client();
    let notified = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&notified);
    let _subscription = client.subscribe(query_key!["orders", 1], move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    client.set_query_data(&query_key!["orders", 1], json!(1));
    client.set_query_data(&query_key!["orders", 2], json!(2));
    client.set_query_data(&query_key!["customers"], json!(3));
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    assert_eq!(client.remove_queries(&query_key!["orders"]), 2);
    assert_eq!(client.len(), 1);

    client.clear();
    assert!(client.is_empty());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_after_clear_spares_rewritten_entry() {
    let client = client();
    let orders_key = query_key!["orders"];
    let customers_key = query_key!["customers"];
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::default().with_cache_time(Duration::from_millis(1_000));

    let orders_view =
        client.observe(orders_key.clone(), counting(&calls, json!("fetched")), options);
    let customers_view =
        client.observe(customers_key.clone(), counting(&calls, json!("fetched")), options);
    orders_view.settled().await;
    customers_view.settled().await;
    drop(orders_view);
    drop(customers_view);

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.clear();
    assert_eq!(client.remove_queries(&customers_key), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    client.set_query_data(&orders_key, json!("manual"));
    client.set_query_data(&customers_key, json!("manual"));

    // Both sweeps from the first fetches fire at 1000ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        client.get_query_data(&orders_key).as_deref(),
        Some(&json!("manual"))
    );
    assert_eq!(
        client.get_query_data(&customers_key).as_deref(),
        Some(&json!("manual"))
    );

    client.remove_queries(&customers_key);
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.set_query_data(&customers_key, json!("again"));
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(
        client.get_query_data(&customers_key).as_deref(),
        Some(&json!("again"))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_observer_clears_on_invalidation_without_fetching() {
    let client = client();
    let key = query_key!["products", "admin"];
    let calls = Arc::new(AtomicUsize::new(0));
    client.set_query_data(&key, json!([{ "id": 1 }]));

    let observer = client.observe(
        key.clone(),
        counting(&calls, json!([{ "id": 2 }])),
        QueryOptions::default().with_enabled(false),
    );
    assert_eq!(observer.data().as_deref(), Some(&json!([{ "id": 1 }])));

    assert_eq!(client.invalidate_queries(&query_key!["products"]), 1);

    let state = observer.state();
    assert!(state.data.is_none());
    assert!(!state.is_fetching);
    assert!(!state.is_loading);
    assert!(!state.is_error);

    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!client.contains_query(&key));
}
