//! HTTP/JSON shim: `/service/method` requests are translated into quests
//! and rendered back through the same answer pipeline.

use crate::big_servant::BigServant;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use xic::{Current, Quest, Servant, Value};

pub fn build_router(big: Arc<BigServant>) -> axum::Router {
    axum::Router::new()
        .route("/:service/:method", any(handle))
        .with_state(big)
}

/// Query-string values that look like integers arrive as integers.
fn query_value(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(n) if !raw.is_empty() => Value::Int(n),
        _ => Value::String(raw.to_string()),
    }
}

async fn handle(
    State(big): State<Arc<BigServant>>,
    Path((service, method)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let mut quest = Quest::new(service.clone(), method.clone(), Default::default());
    quest.txid = 1;

    if !body.is_empty() {
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(map)) => {
                for (k, v) in &map {
                    quest.args.insert(k.clone(), xic::from_json(v));
                }
            }
            Ok(_) => {
                return (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "request body must be a JSON object"})),
                );
            }
            Err(err) => {
                return (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("invalid JSON body: {err}")})),
                );
            }
        }
    }
    for (k, v) in &query {
        quest.args.insert(k.clone(), query_value(v));
    }

    if let Some(cache) = headers
        .get("XiProxy-Cache")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    {
        quest.ctx.insert("CACHE".to_string(), Value::Int(cache));
    }
    if let Some(hint) = headers.get("Xic-Hint").and_then(|v| v.to_str().ok()) {
        quest.ctx.insert("HINT".to_string(), Value::from(hint));
    }
    quest
        .ctx
        .insert("HTTP2XIC".to_string(), Value::from(peer.ip().to_string()));

    let current = Current {
        con_info: format!("http/-/{peer}"),
        peer,
    };

    let answer = match big.process(quest, &current).await {
        Ok(answer) => answer,
        Err(err) => xic::Answer::from_anyhow(&err, &service, &method),
    };

    let args = match answer.args.to_dict() {
        Ok(dict) => xic::to_json(&Value::Dict(dict)),
        Err(err) => serde_json::json!({"error": format!("undecodable answer: {err}")}),
    };
    (
        axum::http::StatusCode::OK,
        Json(serde_json::json!({
            "status": answer.status,
            "answer": args,
        })),
    )
}
