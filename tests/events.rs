//! Event-stream invariants across a mixed workflow, and masking on the bus.

mod common;

use graphloom::event_bus::EventKind;
use graphloom::runtimes::RunStatus;
use serde_json::{json, Value};

use common::*;

fn mixed_document() -> Value {
    json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local", "graph_name": "mixed"},
        "components": [
            {"id": "seed", "type": "static", "inputs": {}, "outputs": {"xs": "$.xs"},
             "config": {"value": {"xs": [1, 2, 3]}}},
            {"id": "doubler", "type": "double_or_fail",
             "inputs": {"item": "map.item"}, "outputs": {"value": "$.value"},
             "config": {"fail_on": -1}},
            {"id": "left", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": "l"}}},
            {"id": "right", "type": "static", "inputs": {}, "outputs": {"x": "$.x"},
             "config": {"value": {"x": "r"}}},
        ],
        "graph": {
            "entry": "seed_node",
            "nodes": [
                {"id": "seed_node", "type": "component", "component": "seed", "next": "mapper"},
                {"id": "mapper", "type": "map",
                 "config": {"body": "body", "collection": "node.seed_node.xs", "concurrency": 2},
                 "next": "fork"},
                {"id": "body", "type": "component", "component": "doubler"},
                {"id": "fork", "type": "parallel", "next": ["l", "r"]},
                {"id": "l", "type": "component", "component": "left"},
                {"id": "r", "type": "component", "component": "right"},
            ],
            "outputs": [{"key": "doubled", "node": "mapper", "output": "results"}],
        },
    })
}

#[tokio::test]
async fn stream_is_first_start_last_finish_with_increasing_sequence() {
    let (result, events) = run_with_inputs(mixed_document(), json!({})).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_stream_shape(&events);
    assert_eq!(events[0].sequence, 0);
    assert_eq!(
        result.outputs["doubled"],
        json!([{"value": 2}, {"value": 4}, {"value": 6}])
    );
}

#[tokio::test]
async fn start_and_finish_counts_balance_for_every_node() {
    let (_result, events) = run_with_inputs(mixed_document(), json!({})).await;
    for node in ["seed_node", "mapper", "fork", "l", "r"] {
        assert_eq!(start_finish_counts(&events, node), (1, 1), "node {node}");
    }
    // Three map iterations over the body node.
    assert_eq!(start_finish_counts(&events, "body"), (3, 3));
}

#[tokio::test]
async fn sequential_successors_start_after_their_predecessor_finishes() {
    let (_result, events) = run_with_inputs(mixed_document(), json!({})).await;
    let finish_of = |node: &str| {
        events
            .iter()
            .position(|e| {
                e.kind == EventKind::NodeFinish
                    && e.payload.get("node_id").and_then(Value::as_str) == Some(node)
            })
            .unwrap()
    };
    let start_of = |node: &str| {
        events
            .iter()
            .position(|e| {
                e.kind == EventKind::NodeStart
                    && e.payload.get("node_id").and_then(Value::as_str) == Some(node)
            })
            .unwrap()
    };
    assert!(finish_of("seed_node") < start_of("mapper"));
    assert!(finish_of("mapper") < start_of("fork"));
    assert!(finish_of("fork") < start_of("l"));
    assert!(finish_of("fork") < start_of("r"));
}

#[tokio::test]
async fn unconditional_masking_applies_to_node_payloads() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "components": [
            {"id": "secretive", "type": "echo",
             "inputs": {"api_key": "graph.inputs.api_key", "q": "graph.inputs.q"},
             "outputs": {"api_key": "$.api_key", "q": "$.q"}},
        ],
        "graph": {
            "entry": "n1",
            "nodes": [{"id": "n1", "type": "component", "component": "secretive"}],
        },
        "policies": {"masking": {"fields": ["outputs.api_key"], "mask_value": "***"}},
    });
    let (result, events) = run_with_inputs(document, json!({"api_key": "sk-12345", "q": "hi"})).await;
    assert_eq!(result.status, RunStatus::Success);

    let finish = of_kind(&events, EventKind::NodeFinish)[0];
    assert_eq!(finish.payload["outputs"]["api_key"], "***");
    assert_eq!(finish.payload["outputs"]["q"], "hi");
    // Masking happens on the export path; the run result is untouched.
    assert_eq!(result.node_states["n1"].outputs["api_key"], json!("sk-12345"));
}

#[tokio::test]
async fn diff_masking_hides_rotated_values_within_a_run() {
    let document = json!({
        "meta": {"version": 2},
        "runtime": {"engine": "local"},
        "components": [
            {"id": "rotator", "type": "rotating_token",
             "inputs": {}, "outputs": {"token": "$.token"}},
        ],
        "graph": {
            "entry": "n1",
            "nodes": [
                {"id": "n1", "type": "component", "component": "rotator", "next": "n2"},
                {"id": "n2", "type": "component", "component": "rotator"},
            ],
        },
        "policies": {"masking": {"diff_fields": ["outputs.token"]}},
    });
    let (result, events) = run_with_inputs(document, json!({})).await;
    assert_eq!(result.status, RunStatus::Success);

    let finishes = of_kind(&events, EventKind::NodeFinish);
    // First occurrence passes through, the rotated value is masked.
    assert_eq!(finishes[0].payload["outputs"]["token"], "tok-1");
    assert_eq!(finishes[1].payload["outputs"]["token"], "***");
}

#[tokio::test]
async fn jsonl_sink_writes_one_flat_object_per_line() {
    use graphloom::event_bus::JsonlSink;
    use graphloom::runtimes::{RunOptions, Workflow};

    let dir = std::env::temp_dir().join(format!("graphloom-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("run.jsonl");
    let _ = std::fs::remove_file(&path);

    let workflow = Workflow::from_document(&mixed_document(), fixture_factories()).unwrap();
    workflow.add_sink(JsonlSink::create(&path).unwrap());
    let result = workflow.run(RunOptions::default()).await;
    workflow.close().await;
    assert_eq!(result.status, RunStatus::Success);

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert!(lines.len() >= 4);
    let first: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["event"], "graph.start");
    assert_eq!(first["sequence"], 0);
    let last: Value = serde_json::from_str(lines.last().unwrap()).unwrap();
    assert_eq!(last["event"], "graph.finish");
    let _ = std::fs::remove_file(&path);
}
