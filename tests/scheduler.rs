//! Run-loop behavior: sequential chains, routing, parallel fan-out,
//! deadlines, and cancellation.

mod common;

use std::time::Duration;

use graphloom::errors::ErrorKind;
use graphloom::event_bus::EventKind;
use graphloom::runtimes::{CancelToken, RunOptions, RunStatus, Workflow};
use serde_json::{json, Value};

use common::*;

fn chain_document() -> Value {
    json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local", "graph_name": "chain"},
        "components": [
            {"id": "seed", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": 7}}},
            {"id": "bump", "type": "add_one",
             "inputs": {"x": "node.a.x"}, "outputs": {"y": "$.y"}},
        ],
        "graph": {
            "entry": "a",
            "nodes": [
                {"id": "a", "type": "component", "component": "seed", "next": "b"},
                {"id": "b", "type": "component", "component": "bump"},
            ],
            "outputs": [{"key": "out", "node": "b", "output": "y"}],
        },
    })
}

#[tokio::test]
async fn simple_chain_produces_expected_output_and_event_order() {
    let (result, events) = run_document(chain_document(), RunOptions::default()).await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.outputs["out"], json!(8));
    assert_eq!(result.node_states["a"].outputs["x"], json!(7));
    assert_eq!(result.node_states["b"].outputs["y"], json!(8));

    assert_stream_shape(&events);
    let observed: Vec<(EventKind, Option<String>)> = events
        .iter()
        .map(|event| {
            (
                event.kind,
                event
                    .payload
                    .get("node_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            )
        })
        .collect();
    assert_eq!(
        observed,
        vec![
            (EventKind::GraphStart, None),
            (EventKind::NodeStart, Some("a".to_string())),
            (EventKind::NodeFinish, Some("a".to_string())),
            (EventKind::NodeStart, Some("b".to_string())),
            (EventKind::NodeFinish, Some("b".to_string())),
            (EventKind::GraphFinish, None),
        ]
    );
    let finish = events.last().unwrap();
    assert_eq!(finish.payload["status"], "success");
    assert_eq!(finish.payload["outputs"]["out"], json!(8));
}

fn router_document(route: &str, with_default: bool) -> Value {
    let mut next = json!({"greet": "g", "q": "q"});
    if with_default {
        next["default"] = json!("d");
    }
    json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local", "graph_name": "router"},
        "components": [
            {"id": "decide", "type": "static", "inputs": {}, "outputs": {"route": "$.route"},
             "config": {"value": {"route": route}}},
            {"id": "answer", "type": "static", "inputs": {}, "outputs": {"text": "$.text"},
             "config": {"value": {"text": "answered"}}},
        ],
        "graph": {
            "entry": "r",
            "nodes": [
                {"id": "r", "type": "router", "component": "decide", "next": next},
                {"id": "g", "type": "component", "component": "answer"},
                {"id": "q", "type": "component", "component": "answer"},
                {"id": "d", "type": "component", "component": "answer"},
            ],
            "outputs": [{"key": "text", "node": "q", "output": "text"}],
        },
    })
}

#[tokio::test]
async fn router_selects_the_matching_route() {
    let (result, events) = run_document(router_document("q", true), RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.outputs["text"], json!("answered"));
    assert_eq!(start_finish_counts(&events, "q"), (1, 1));
    assert_eq!(start_finish_counts(&events, "g"), (0, 0));
    assert_eq!(start_finish_counts(&events, "d"), (0, 0));
}

#[tokio::test]
async fn router_falls_back_to_default() {
    let (result, events) = run_document(router_document("zzz", true), RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(start_finish_counts(&events, "d"), (1, 1));
    assert_eq!(start_finish_counts(&events, "q"), (0, 0));
    // The routed-away output node never ran, so its key is absent.
    assert!(!result.outputs.contains_key("text"));
}

#[tokio::test]
async fn router_without_match_or_default_is_fatal() {
    let (result, events) = run_document(router_document("zzz", false), RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Error);
    let failure = result.error.unwrap();
    assert_eq!(failure.kind, ErrorKind::RouterNoMatch);
    assert!(failure.message.contains("zzz"));
    let finish = events.last().unwrap();
    assert_eq!(finish.payload["status"], "error");
    assert_eq!(finish.payload["error_code"], "ROUTER_NO_MATCH");
}

fn fanout_document() -> Value {
    json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local", "graph_name": "fanout"},
        "components": [
            {"id": "one", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": 1}}},
            {"id": "two", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": 2}}},
            {"id": "three", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": 3}}},
            {"id": "collect", "type": "echo",
             "inputs": {"xa": "node.a.x", "xb": "node.b.x", "xc": "node.c.x"},
             "outputs": {"xa": "$.xa", "xb": "$.xb", "xc": "$.xc"}},
        ],
        "graph": {
            "entry": "s",
            "nodes": [
                {"id": "s", "type": "parallel", "next": ["a", "b", "c"]},
                {"id": "a", "type": "component", "component": "one", "next": "m"},
                {"id": "b", "type": "component", "component": "two", "next": "m"},
                {"id": "c", "type": "component", "component": "three", "next": "m"},
                {"id": "m", "type": "component", "component": "collect"},
            ],
            "outputs": [
                {"key": "xa", "node": "m", "output": "xa"},
                {"key": "xb", "node": "m", "output": "xb"},
                {"key": "xc", "node": "m", "output": "xc"},
            ],
        },
    })
}

#[tokio::test]
async fn parallel_fanout_joins_before_the_merge_node() {
    let (result, events) = run_document(fanout_document(), RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.outputs["xa"], json!(1));
    assert_eq!(result.outputs["xb"], json!(2));
    assert_eq!(result.outputs["xc"], json!(3));

    // The merge node runs exactly once, each child exactly once.
    for node in ["s", "a", "b", "c", "m"] {
        assert_eq!(start_finish_counts(&events, node), (1, 1), "node {node}");
    }

    // Every child finishes before the merge node starts.
    let merge_start = events
        .iter()
        .position(|e| {
            e.kind == EventKind::NodeStart
                && e.payload.get("node_id").and_then(Value::as_str) == Some("m")
        })
        .unwrap();
    for child in ["a", "b", "c"] {
        let child_finish = events
            .iter()
            .position(|e| {
                e.kind == EventKind::NodeFinish
                    && e.payload.get("node_id").and_then(Value::as_str) == Some(child)
            })
            .unwrap();
        assert!(child_finish < merge_start, "child {child} finished after merge start");
    }
    assert_stream_shape(&events);
}

#[tokio::test]
async fn empty_parallel_list_is_a_runtime_error() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "graph": {
            "entry": "s",
            "nodes": [{"id": "s", "type": "parallel", "next": []}],
        },
    });
    let (result, _events) = run_document(document, RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.error.unwrap().kind, ErrorKind::ParallelEmpty);
}

#[tokio::test]
async fn failing_parallel_branch_aborts_the_run() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "components": [
            {"id": "slow", "type": "sleepy", "inputs": {}, "outputs": {},
             "config": {"delay_ms": 200}},
            {"id": "broken", "type": "failing", "inputs": {}, "outputs": {},
             "config": {"message": "branch exploded"}},
        ],
        "graph": {
            "entry": "s",
            "nodes": [
                {"id": "s", "type": "parallel", "next": ["slow_branch", "bad_branch"]},
                {"id": "slow_branch", "type": "component", "component": "slow"},
                {"id": "bad_branch", "type": "component", "component": "broken"},
            ],
        },
    });
    let started = std::time::Instant::now();
    let (result, events) = run_document(document, RunOptions::default()).await;
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.error.unwrap().kind, ErrorKind::NodeRuntime);
    // The failing sibling cancels the slow one instead of waiting it out.
    assert!(started.elapsed() < Duration::from_millis(150));
    let slow_finish = of_kind(&events, EventKind::NodeFinish)
        .into_iter()
        .find(|e| e.payload.get("node_id").and_then(Value::as_str) == Some("slow_branch"))
        .expect("slow branch must still finish");
    assert_eq!(slow_finish.payload["status"], "cancelled");
}

#[tokio::test]
async fn deadline_cancels_in_flight_nodes_and_reports_timeout() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local", "graph_name": "slow"},
        "components": [
            {"id": "slow", "type": "sleepy", "inputs": {}, "outputs": {},
             "config": {"delay_ms": 10_000}},
        ],
        "graph": {
            "entry": "a",
            "nodes": [{"id": "a", "type": "component", "component": "slow"}],
        },
    });
    let options = RunOptions {
        timeout: Some(Duration::from_millis(100)),
        ..RunOptions::default()
    };
    let (result, events) = run_document(document, options).await;

    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(of_kind(&events, EventKind::Timeout).len(), 1);
    let finish = events.last().unwrap();
    assert_eq!(finish.kind, EventKind::GraphFinish);
    assert_eq!(finish.payload["status"], "timeout");

    // The sleeping node never finishes successfully; it completes as
    // cancelled so start/finish counts stay balanced.
    assert_eq!(start_finish_counts(&events, "a"), (1, 1));
    let node_finish = of_kind(&events, EventKind::NodeFinish)[0];
    assert_eq!(node_finish.payload["status"], "cancelled");
    assert_stream_shape(&events);
}

#[tokio::test]
async fn external_cancellation_ends_the_run_as_cancelled() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "components": [
            {"id": "slow", "type": "sleepy", "inputs": {}, "outputs": {},
             "config": {"delay_ms": 10_000}},
        ],
        "graph": {
            "entry": "a",
            "nodes": [{"id": "a", "type": "component", "component": "slow"}],
        },
    });
    let token = CancelToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let options = RunOptions {
        cancel: Some(token),
        ..RunOptions::default()
    };
    let (result, events) = run_document(document, options).await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(of_kind(&events, EventKind::Cancelled).len(), 1);
    assert_eq!(events.last().unwrap().payload["status"], "cancelled");
    // Once the token fired no further node starts appeared.
    let cancel_seq = of_kind(&events, EventKind::Cancelled)[0].sequence;
    assert!(of_kind(&events, EventKind::NodeStart)
        .iter()
        .all(|e| e.sequence < cancel_seq));
}

#[tokio::test]
async fn tolerated_failures_end_only_their_branch() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "components": [
            {"id": "broken", "type": "failing", "inputs": {}, "outputs": {},
             "config": {"message": "left branch failed"}},
            {"id": "fine", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": 42}}},
        ],
        "graph": {
            "entry": "s",
            "nodes": [
                {"id": "s", "type": "parallel", "next": ["bad", "good"]},
                {"id": "bad", "type": "component", "component": "broken", "next": "after_bad"},
                {"id": "after_bad", "type": "component", "component": "fine"},
                {"id": "good", "type": "component", "component": "fine"},
            ],
            "outputs": [{"key": "x", "node": "good", "output": "x"}],
        },
    });
    let options = RunOptions {
        cancel_on_error: false,
        ..RunOptions::default()
    };
    let (result, events) = run_document(document, options).await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.outputs["x"], json!(42));
    // The failed node's successor never ran.
    assert_eq!(start_finish_counts(&events, "after_bad"), (0, 0));
    assert_eq!(start_finish_counts(&events, "good"), (1, 1));
    // The failure was still observable.
    assert_eq!(of_kind(&events, EventKind::ErrorRaised).len(), 1);
}

#[tokio::test]
async fn normalization_warnings_surface_on_the_workflow() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "components": [{"id": "c", "type": "static"}],
        "graph": {
            "entry": "a",
            "nodes": [{"id": "a", "type": "component", "component": "c"}],
        },
    });
    let workflow = Workflow::from_document(&document, fixture_factories()).unwrap();
    assert!(!workflow.warnings().is_empty());
    workflow.close().await;
}
