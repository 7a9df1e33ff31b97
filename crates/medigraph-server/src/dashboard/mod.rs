pub mod handlers;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use medigraph_common::EdgeRow;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

const DEFAULT_NODE_COLOUR: &str = "#38bdf8";

pub fn label_colour(label: &str) -> &'static str {
    match label {
        "Patient" => "#22d3ee",
        "Encounter" => "#4ade80",
        "Condition" => "#f97316",
        "Medication" => "#a855f7",
        "Provider" => "#facc15",
        "Guideline" => "#f97316",
        _ => DEFAULT_NODE_COLOUR,
    }
}

fn node_id(label: &str, key: &str) -> String {
    format!("{}:{}", label, key)
}

/// Nodes and edges for the browser graph view.
///
/// Node ids carry the label so that keys shared across labels stay distinct.
pub fn graph_view(edges: &[EdgeRow]) -> Value {
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    let mut relation_dist: BTreeMap<&str, usize> = BTreeMap::new();

    let mut add_node = |label: &str, key: &str| {
        let id = node_id(label, key);
        if seen.insert(id.clone()) {
            nodes.push(json!({
                "id": id,
                "key": key,
                "label": label,
                "title": format!("{} {}", label, key),
                "color": label_colour(label),
            }));
        }
    };

    let edge_data: Vec<Value> = edges
        .iter()
        .map(|e| {
            add_node(&e.start_label, &e.start_id);
            add_node(&e.end_label, &e.end_id);
            *relation_dist.entry(e.relationship_type.as_str()).or_default() += 1;
            json!({
                "source": node_id(&e.start_label, &e.start_id),
                "target": node_id(&e.end_label, &e.end_id),
                "relation": e.relationship_type,
            })
        })
        .collect();

    json!({
        "stats": {
            "node_count": nodes.len(),
            "edge_count": edge_data.len(),
            "relation_distribution": relation_dist,
        },
        "nodes": nodes,
        "edges": edge_data,
    })
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}
