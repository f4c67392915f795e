use std::{collections::HashSet, time::Duration};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use warden_process::{ComponentId, RunId};

use crate::settings::HubSettings;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
enum WardenToHubFrame {
    #[serde(rename = "hello")]
    Hello { agent: String, agent_version: String },
    #[serde(rename = "shutdown_request")]
    ShutdownRequest {
        component: String,
        port: u16,
        run_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type")]
enum HubToWardenFrame {
    #[serde(rename = "ack")]
    Ack { component: Option<String> },
    #[serde(other)]
    Unknown,
}

/// Announces a shutdown to the routing hub over its persistent socket. Resolves to `true` when
/// the hub acknowledged the request before `timeout`.
pub async fn announce_shutdown(
    ws_url: &str,
    component: &ComponentId,
    port: u16,
    run_id: &RunId,
    timeout: Duration,
) -> anyhow::Result<bool> {
    tokio::time::timeout(timeout, announce_inner(ws_url, component, port, run_id))
        .await
        .with_context(|| format!("hub socket did not answer within {}ms", timeout.as_millis()))?
}

async fn announce_inner(
    ws_url: &str,
    component: &ComponentId,
    port: u16,
    run_id: &RunId,
) -> anyhow::Result<bool> {
    let req = ws_url.into_client_request()?;
    let (ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .with_context(|| format!("connect hub socket {ws_url}"))?;
    let (mut sink, mut stream) = ws.split();

    let hello = WardenToHubFrame::Hello {
        agent: "warden".to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    sink.send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
        .await?;

    let request = WardenToHubFrame::ShutdownRequest {
        component: component.to_string(),
        port,
        run_id: run_id.0.clone(),
        reason: "warden stop".to_string(),
    };
    sink.send(WsMessage::Text(serde_json::to_string(&request)?.into()))
        .await?;

    let mut acked = false;
    while let Some(msg) = stream.next().await {
        match msg? {
            WsMessage::Text(text) => {
                let frame = serde_json::from_str::<HubToWardenFrame>(&text)
                    .unwrap_or(HubToWardenFrame::Unknown);
                if let HubToWardenFrame::Ack { component: acked_id } = frame
                    && acked_id.as_deref().is_none_or(|c| c == component.as_str())
                {
                    acked = true;
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    let _ = sink.send(WsMessage::Close(None)).await;
    Ok(acked)
}

/// Component ids the hub currently routes to. Accepts a bare array, or an object with a
/// `components` array; items are strings or objects carrying `id` or `name`.
pub async fn fetch_registered(
    client: &reqwest::Client,
    settings: &HubSettings,
) -> anyhow::Result<HashSet<String>> {
    let base = settings
        .url
        .as_deref()
        .context("hub url is not configured")?;
    let url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        settings.registry_path.trim_start_matches('/')
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    let body: serde_json::Value = resp.json().await.context("decode hub registry")?;
    Ok(parse_registered(&body))
}

pub(crate) fn parse_registered(body: &serde_json::Value) -> HashSet<String> {
    let items = match body {
        serde_json::Value::Array(a) => a.as_slice(),
        serde_json::Value::Object(m) => match m.get("components") {
            Some(serde_json::Value::Array(a)) => a.as_slice(),
            Some(serde_json::Value::Object(by_id)) => {
                return by_id.keys().cloned().collect();
            }
            _ => &[],
        },
        _ => &[],
    };
    items
        .iter()
        .filter_map(|i| match i {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(o) => o
                .get("id")
                .or_else(|| o.get("name"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, routing::get};
    use serde_json::json;

    use super::*;
    use crate::test_support::serve;

    #[test]
    fn registry_shapes() {
        let a = parse_registered(&json!(["bus", {"id": "memory"}, {"name": "search"}, 3]));
        assert_eq!(a.len(), 3);
        assert!(a.contains("memory") && a.contains("search"));

        let b = parse_registered(&json!({"components": {"bus": {}, "memory": {}}}));
        assert!(b.contains("bus") && b.contains("memory"));

        assert!(parse_registered(&json!({"unexpected": true})).is_empty());
    }

    #[tokio::test]
    async fn fetches_registered_components_over_http() {
        let app = Router::new().route(
            "/components",
            get(|| async { Json(json!({"components": [{"id": "message-bus"}, {"id": "vector-store"}]})) }),
        );
        let port = serve(app).await;
        let settings = HubSettings {
            url: Some(format!("http://127.0.0.1:{port}/")),
            ..HubSettings::default()
        };
        let ids = fetch_registered(&reqwest::Client::new(), &settings).await.unwrap();
        assert!(ids.contains("vector-store"));
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn missing_hub_url_is_an_error() {
        let err = fetch_registered(&reqwest::Client::new(), &HubSettings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn shutdown_request_is_acknowledged() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hub = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut frames = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                    let is_shutdown = v["type"] == "shutdown_request";
                    frames.push(v);
                    if is_shutdown {
                        let ack = json!({"type": "ack", "component": "vector-store"}).to_string();
                        ws.send(WsMessage::Text(ack.into())).await.unwrap();
                        break;
                    }
                }
            }
            frames
        });

        let acked = announce_shutdown(
            &format!("ws://127.0.0.1:{port}/ws"),
            &ComponentId::from("vector-store"),
            8301,
            &RunId::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(acked);

        let frames = hub.await.unwrap();
        assert_eq!(frames[0]["type"], "hello");
        assert_eq!(frames[1]["component"], "vector-store");
        assert_eq!(frames[1]["port"], 8301);
    }

    #[tokio::test]
    async fn unreachable_hub_socket_errors() {
        let port = crate::test_support::closed_port().await;
        let res = announce_shutdown(
            &format!("ws://127.0.0.1:{port}/ws"),
            &ComponentId::from("x"),
            1,
            &RunId::new(),
            Duration::from_secs(2),
        )
        .await;
        assert!(res.is_err());
    }
}
