use axum::http::header as axum_header;
use axum::routing::get;
use axum::Router;
use fetchgate_mcp::config::Config;
use fetchgate_mcp::http::{self, HttpState};
use fetchgate_mcp::service::FetchService;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn serve_fixture() -> SocketAddr {
    let app = Router::new().route(
        "/doc",
        get(|| async {
            (
                [(axum_header::CONTENT_TYPE, "text/html")],
                "<html><head><title>HTTP Doc</title></head>\
                 <body><p>streamable body</p></body></html>",
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Boot the streamable front in-process; returns its base URL.
async fn serve_mcp() -> (String, Arc<HttpState>) {
    let config = Config {
        allow_local_fetch: true,
        ..Config::default()
    };
    let service = Arc::new(FetchService::new(config));
    let state = HttpState::new(service.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(http::run_cache_fanout(state.clone(), cancel));

    let app = http::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/mcp"), state)
}

fn rpc(id: u64, method: &str, params: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

async fn initialize(client: &reqwest::Client, base: &str) -> String {
    let resp = client
        .post(base)
        .header("accept", "application/json, text/event-stream")
        .json(&rpc(
            1,
            "initialize",
            serde_json::json!({
                "protocolVersion": http::PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "contract-test", "version": "0" },
            }),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let session_id = resp
        .headers()
        .get("mcp-session-id")
        .expect("session id header")
        .to_str()
        .unwrap()
        .to_string();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["serverInfo"]["name"], "fetchgate");

    // Complete the handshake.
    let resp = client
        .post(base)
        .header("mcp-session-id", &session_id)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    session_id
}

async fn post_rpc(
    client: &reqwest::Client,
    base: &str,
    session_id: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    let resp = client
        .post(base)
        .header("mcp-session-id", session_id)
        .header("mcp-protocol-version", http::PROTOCOL_VERSION)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "rpc {body}");
    resp.json().await.unwrap()
}

#[tokio::test]
async fn initialize_handshake_and_header_rules() {
    let (base, _state) = serve_mcp().await;
    let client = reqwest::Client::new();

    // Accept must offer both media types.
    let resp = client
        .post(&base)
        .header("accept", "application/json")
        .json(&rpc(1, "initialize", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 406);

    let session_id = initialize(&client, &base).await;

    // notifications/initialized must be a notification.
    let resp = client
        .post(&base)
        .header("mcp-session-id", &session_id)
        .json(&rpc(7, "notifications/initialized", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // After initialize, requests need the protocol-version header.
    let resp = client
        .post(&base)
        .header("mcp-session-id", &session_id)
        .json(&rpc(2, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Duplicated sensitive single-value headers are rejected.
    let mut headers = reqwest::header::HeaderMap::new();
    headers.append("authorization", "Bearer a".parse().unwrap());
    headers.append("authorization", "Bearer b".parse().unwrap());
    let resp = client
        .post(&base)
        .headers(headers)
        .header("mcp-session-id", &session_id)
        .header("mcp-protocol-version", http::PROTOCOL_VERSION)
        .json(&rpc(3, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown session ids are rejected.
    let resp = client
        .post(&base)
        .header("mcp-session-id", "nope")
        .header("mcp-protocol-version", http::PROTOCOL_VERSION)
        .json(&rpc(4, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // With the right headers the method dispatches.
    let body = post_rpc(&client, &base, &session_id, rpc(5, "tools/list", serde_json::json!({}))).await;
    assert_eq!(body["result"]["tools"][0]["name"], "fetch-url");

    // Unknown methods are -32601.
    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(6, "prompts/list", serde_json::json!({})),
    )
    .await;
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn tools_call_and_resource_read_round_trip() {
    let fixture = serve_fixture().await;
    let (base, _state) = serve_mcp().await;
    let client = reqwest::Client::new();
    let session_id = initialize(&client, &base).await;

    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(
            2,
            "tools/call",
            serde_json::json!({
                "name": "fetch-url",
                "arguments": { "url": format!("http://{fixture}/doc") },
            }),
        ),
    )
    .await;
    let result = &body["result"];
    assert_eq!(result["isError"], false);
    let payload = &result["structuredContent"];
    assert!(payload["markdown"].as_str().unwrap().contains("streamable body"));
    assert_eq!(payload["title"], "HTTP Doc");
    let uri = payload["cacheResourceUri"].as_str().unwrap().to_string();

    // The cached document is readable as a resource.
    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(3, "resources/read", serde_json::json!({ "uri": uri })),
    )
    .await;
    let contents = &body["result"]["contents"][0];
    assert_eq!(contents["mimeType"], "text/markdown");
    assert!(contents["text"].as_str().unwrap().contains("streamable body"));

    // Unknown tool names are invalid params.
    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(
            4,
            "tools/call",
            serde_json::json!({ "name": "nope", "arguments": {} }),
        ),
    )
    .await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn task_methods_round_trip() {
    let fixture = serve_fixture().await;
    let (base, _state) = serve_mcp().await;
    let client = reqwest::Client::new();
    let session_id = initialize(&client, &base).await;

    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(
            2,
            "tools/call",
            serde_json::json!({
                "name": "fetch-url",
                "arguments": {
                    "url": format!("http://{fixture}/doc"),
                    "task": { "ttl": 30_000 },
                },
            }),
        ),
    )
    .await;
    let task_id = body["result"]["task"]["taskId"].as_str().unwrap().to_string();
    assert_eq!(
        body["result"]["_meta"]["io.modelcontextprotocol/related-task"]["taskId"],
        task_id.as_str()
    );

    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(3, "tasks/result", serde_json::json!({ "taskId": task_id })),
    )
    .await;
    let payload = &body["result"]["structuredContent"];
    assert!(payload["markdown"].as_str().unwrap().contains("streamable body"));

    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(4, "tasks/list", serde_json::json!({})),
    )
    .await;
    assert_eq!(body["result"]["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(body["result"]["tasks"][0]["status"], "completed");

    let body = post_rpc(
        &client,
        &base,
        &session_id,
        rpc(5, "tasks/get", serde_json::json!({ "taskId": "missing" })),
    )
    .await;
    assert_eq!(body["error"]["code"], -32002);
}

#[tokio::test]
async fn subscriptions_fan_out_on_the_sse_channel() {
    let fixture = serve_fixture().await;
    let (base, _state) = serve_mcp().await;
    let client = reqwest::Client::new();
    let session_id = initialize(&client, &base).await;

    // Subscribe to the resource the fetch will create.
    let url = format!("http://{fixture}/doc");
    let uri = format!(
        "internal://cache/fetch-url/{}",
        fetchgate_mcp::cache::url_hash(&url)
    );
    post_rpc(
        &client,
        &base,
        &session_id,
        rpc(2, "resources/subscribe", serde_json::json!({ "uri": uri })),
    )
    .await;

    // Attach the SSE channel.
    let sse = client
        .get(&base)
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(sse.status(), 200);
    let mut stream = sse.bytes_stream();

    // Trigger the cache insert.
    post_rpc(
        &client,
        &base,
        &session_id,
        rpc(
            3,
            "tools/call",
            serde_json::json!({ "name": "fetch-url", "arguments": { "url": url } }),
        ),
    )
    .await;

    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("sse event before deadline")
            .expect("stream open")
            .expect("chunk");
        seen.push_str(&String::from_utf8_lossy(&chunk));
        if seen.contains("notifications/resources/updated") {
            break;
        }
    }
    assert!(seen.contains(&uri));
}

#[tokio::test]
async fn delete_tears_the_session_down() {
    let (base, state) = serve_mcp().await;
    let client = reqwest::Client::new();
    let session_id = initialize(&client, &base).await;
    assert_eq!(state.sessions.len(), 1);

    let resp = client
        .delete(&base)
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(state.sessions.len(), 0);

    // No session at all: 204.
    let resp = client.delete(&base).send().await.unwrap();
    assert_eq!(resp.status(), 204);

    // The dead session no longer dispatches.
    let resp = client
        .post(&base)
        .header("mcp-session-id", &session_id)
        .header("mcp-protocol-version", http::PROTOCOL_VERSION)
        .json(&rpc(9, "tools/list", serde_json::json!({})))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
