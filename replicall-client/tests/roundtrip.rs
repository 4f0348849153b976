//! End-to-end protocol round trips: Link on one peer, Dispatcher on
//! another, the replicated store the only channel between them.
//!
//! Every scenario runs against both store bindings.

use replicall_client::{CallError, Link};
use replicall_core::{
    code, CallId, CallState, CallType, ClientId, RecordFilter,
};
use replicall_server::Dispatcher;
use replicall_store::{CallStore, CallTable, MergeNetwork, MergeStore, TableStore};
use replicall_test_utils::{init_tracing, user_router, TestApp, BAD_NAME, REJECTION_TEXT};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn merge_pair() -> (Arc<MergeStore>, Arc<MergeStore>) {
    let network = MergeNetwork::new();
    (Arc::new(network.replica()), Arc::new(network.replica()))
}

fn table_pair() -> (Arc<TableStore>, Arc<TableStore>) {
    let table = CallTable::new();
    (Arc::new(table.connect()), Arc::new(table.connect()))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

async fn create(link: &Link<impl CallStore + 'static>, name: &str) -> Result<Value, CallError> {
    link.call("user.create", json!({ "name": name }), CallType::Mutation)
        .await
}

async fn check_create_round_trip<S: CallStore + 'static>(server: Arc<S>, client: Arc<S>) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(Arc::clone(&client), ClientId::now_v7());

    let response = create(&link, "foo").await.unwrap();
    assert_eq!(response["name"], json!("foo"));
    assert_eq!(response["id"], json!("1"));
    assert_eq!(app.users.get("1").unwrap().name, "foo");
    assert_eq!(link.in_flight(), 0);

    // The caller's peer converges on the terminal record.
    let mine = client
        .query(&RecordFilter::terminal_for(link.client_id()))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].state, CallState::Done);

    dispatcher.shutdown().await;
}

async fn check_rejection_round_trips_error_shape<S: CallStore + 'static>(
    server: Arc<S>,
    client: Arc<S>,
) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(client, ClientId::now_v7());

    let err = create(&link, BAD_NAME).await.unwrap_err();
    match err {
        CallError::Rejected(shape) => {
            assert_eq!(shape.code, code::CONFLICT);
            assert_eq!(shape.message, REJECTION_TEXT);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // The staged directory write never ran.
    assert!(app.users.is_empty());

    dispatcher.shutdown().await;
}

async fn check_slow_call_does_not_block_fast_call<S: CallStore + 'static>(
    server: Arc<S>,
    client: Arc<S>,
) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(client, ClientId::now_v7());

    let slow = link.call(
        "user.create",
        json!({ "name": "slow", "optional_delay_ms": 300 }),
        CallType::Mutation,
    );
    let fast = create(&link, "fast");
    tokio::pin!(slow, fast);

    // The fast call resolves while the slow one is still executing.
    let fast_response = tokio::select! {
        _ = &mut slow => panic!("slow call resolved first"),
        fast_response = &mut fast => fast_response.unwrap(),
    };
    assert_eq!(fast_response["name"], json!("fast"));
    assert_eq!(link.in_flight(), 1);

    let slow_response = slow.await.unwrap();
    assert_eq!(slow_response["name"], json!("slow"));
    assert_eq!(app.users.len(), 2);

    dispatcher.shutdown().await;
}

async fn check_concurrent_calls_all_complete<S: CallStore + 'static>(
    server: Arc<S>,
    client: Arc<S>,
) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(Arc::clone(&client), ClientId::now_v7());

    let (a, b, c, d, e) = tokio::join!(
        create(&link, "amy"),
        create(&link, "bo"),
        create(&link, "cy"),
        create(&link, "di"),
        create(&link, "ed"),
    );
    for (response, name) in [a, b, c, d, e].into_iter().zip(["amy", "bo", "cy", "di", "ed"]) {
        assert_eq!(response.unwrap()["name"], json!(name));
    }
    assert_eq!(app.users.len(), 5);

    // Five terminal records with five distinct ids on the caller's peer.
    let mine = client
        .query(&RecordFilter::terminal_for(link.client_id()))
        .await
        .unwrap();
    assert_eq!(mine.len(), 5);
    let mut ids: Vec<CallId> = mine.iter().map(|record| record.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert!(mine.iter().all(|record| record.state == CallState::Done));

    dispatcher.shutdown().await;
}

async fn check_timeout_is_caller_local<S: CallStore + 'static>(server: Arc<S>, client: Arc<S>) {
    let app = TestApp::new();
    // No dispatcher yet: the call cannot complete.
    let link =
        Link::new(Arc::clone(&client), ClientId::now_v7()).with_default_timeout(Duration::from_millis(50));

    let err = create(&link, "foo").await.unwrap_err();
    assert!(matches!(err, CallError::Timeout { waited_ms: 50 }));
    assert_eq!(link.in_flight(), 0);

    // The record outlives the caller's patience.
    let waiting = client.query(&RecordFilter::waiting()).await.unwrap();
    assert_eq!(waiting.len(), 1);

    // A dispatcher arriving later still executes and commits.
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let id = waiting[0].id;
    let probe = Arc::clone(&client);
    eventually(|| {
        let probe = Arc::clone(&probe);
        async move {
            probe
                .get(id)
                .await
                .unwrap()
                .is_some_and(|record| record.state == CallState::Done)
        }
    })
    .await;
    assert_eq!(app.users.len(), 1);

    dispatcher.shutdown().await;
}

async fn check_caller_supplied_id_dedups_retry<S: CallStore + 'static>(
    server: Arc<S>,
    client: Arc<S>,
) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(client, ClientId::now_v7());

    let call_id = CallId::now_v7();
    let input = json!({ "name": "foo", "callId": call_id.to_string() });
    let first = link
        .call("user.create", input.clone(), CallType::Mutation)
        .await
        .unwrap();

    // Replaying the same callId resolves from the existing record
    // without executing again.
    let second = link
        .call("user.create", input, CallType::Mutation)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(app.users.len(), 1);

    dispatcher.shutdown().await;
}

async fn check_query_and_kind_mismatch<S: CallStore + 'static>(server: Arc<S>, client: Arc<S>) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(client, ClientId::now_v7());

    create(&link, "foo").await.unwrap();
    let listed = link
        .call("user.list", json!(null), CallType::Query)
        .await
        .unwrap();
    assert_eq!(listed, json!([{ "id": "1", "name": "foo" }]));

    // A mutation path invoked as a query is refused by the router.
    let err = link
        .call("user.create", json!({ "name": "bar" }), CallType::Query)
        .await
        .unwrap_err();
    match err {
        CallError::Rejected(shape) => assert_eq!(shape.code, code::METHOD_NOT_SUPPORTED),
        other => panic!("expected rejection, got {other:?}"),
    }

    // Input that fails deserialization comes back as BAD_REQUEST.
    let err = link
        .call("user.create", json!({ "name": 42 }), CallType::Mutation)
        .await
        .unwrap_err();
    match err {
        CallError::Rejected(shape) => assert_eq!(shape.code, code::BAD_REQUEST),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(app.users.len(), 1);

    dispatcher.shutdown().await;
}

async fn check_elapsed_telemetry_written_back<S: CallStore + 'static>(
    server: Arc<S>,
    client: Arc<S>,
) {
    let app = TestApp::new();
    let dispatcher = Dispatcher::new(server, user_router(), app.clone()).spawn();
    let link = Link::new(Arc::clone(&client), ClientId::now_v7());

    create(&link, "foo").await.unwrap();
    let mine = client
        .query(&RecordFilter::terminal_for(link.client_id()))
        .await
        .unwrap();
    let id = mine[0].id;

    // Written after resolution, fire and forget.
    let probe = Arc::clone(&client);
    eventually(|| {
        let probe = Arc::clone(&probe);
        async move {
            probe
                .get(id)
                .await
                .unwrap()
                .is_some_and(|record| record.elapsed_ms.is_some())
        }
    })
    .await;

    dispatcher.shutdown().await;
}

macro_rules! roundtrip {
    ($name:ident, $check:ident) => {
        mod $name {
            use super::*;

            #[tokio::test]
            async fn merge() {
                init_tracing();
                let (server, client) = merge_pair();
                $check(server, client).await;
            }

            #[tokio::test]
            async fn table() {
                init_tracing();
                let (server, client) = table_pair();
                $check(server, client).await;
            }
        }
    };
}

roundtrip!(create_round_trip, check_create_round_trip);
roundtrip!(
    rejection_round_trips_error_shape,
    check_rejection_round_trips_error_shape
);
roundtrip!(
    slow_call_does_not_block_fast_call,
    check_slow_call_does_not_block_fast_call
);
roundtrip!(concurrent_calls_all_complete, check_concurrent_calls_all_complete);
roundtrip!(timeout_is_caller_local, check_timeout_is_caller_local);
roundtrip!(
    caller_supplied_id_dedups_retry,
    check_caller_supplied_id_dedups_retry
);
roundtrip!(query_and_kind_mismatch, check_query_and_kind_mismatch);
roundtrip!(
    elapsed_telemetry_written_back,
    check_elapsed_telemetry_written_back
);
