use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use reqwest::{header::AUTHORIZATION, Method, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::{Host, Url};

use super::{TaskContext, TaskError};

pub(super) async fn http(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let raw_url = ctx.required_string("url")?;
    let url = Url::parse(raw_url.trim()).map_err(|e| TaskError::BadParam {
        name: "url",
        reason: e.to_string(),
    })?;
    if !ctx.bool("allowUnrestrictedNetworkAccess", false)? {
        check_restricted(&url)?;
    }
    let method = match ctx.string("method")? {
        None => Method::GET,
        Some(m) => match m.trim().to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            other => {
                return Err(TaskError::BadParam {
                    name: "method",
                    reason: format!("{other} is not supported"),
                })
            }
        },
    };
    let body = ctx.json("requestData")?;
    let headers = headers(ctx.json("headers")?)?;

    send(ctx, || {
        let mut req = ctx.env.http.request(method.clone(), url.clone());
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &body {
            req = req.json(body);
        }
        req
    })
    .await
    .map(Value::String)
}

pub(super) async fn bridge(ctx: &TaskContext<'_>) -> Result<Value, TaskError> {
    let name = ctx.required_string("name")?;
    let bridge = ctx
        .env
        .bridges
        .bridge(name.trim())
        .await
        .map_err(|e| TaskError::Http(e.to_string()))?
        .ok_or_else(|| TaskError::BadParam {
            name: "name",
            reason: format!("bridge {name:?} is not registered"),
        })?;
    let body = json!({
        "id": ctx.run_id.to_string(),
        "data": ctx.json("requestData")?.unwrap_or_else(|| json!({})),
        "meta": ctx.vars.get("jobRun.meta").cloned().unwrap_or(Value::Null),
    });
    send(ctx, || {
        ctx.env
            .http
            .post(bridge.url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", bridge.outgoing_token))
            .json(&body)
    })
    .await
    .map(Value::String)
}

fn headers(value: Option<Value>) -> Result<Vec<(String, String)>, TaskError> {
    let bad = |reason: &str| TaskError::BadParam {
        name: "headers",
        reason: reason.into(),
    };
    match value {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                _ => Err(bad("header values must be strings")),
            })
            .collect(),
        // flat list of name, value pairs
        Some(Value::Array(items)) => {
            if items.len() % 2 != 0 {
                return Err(bad("expected name and value pairs"));
            }
            items
                .chunks(2)
                .map(|pair| match pair {
                    [Value::String(k), Value::String(v)] => Ok((k.clone(), v.clone())),
                    _ => Err(bad("header names and values must be strings")),
                })
                .collect()
        }
        Some(_) => Err(bad("expected an object or a list")),
    }
}

async fn send(
    ctx: &TaskContext<'_>,
    build: impl Fn() -> RequestBuilder,
) -> Result<String, TaskError> {
    let config = &ctx.env.config;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetch(build().timeout(config.default_http_timeout), config.http_max_response_bytes)
            .await
        {
            Err(Fetch::Transport(e)) if attempt < config.http_max_attempts => {
                warn!(attempt, error = %e, "HTTP request failed, retrying");
                tokio::time::sleep(Duration::from_millis(100) * attempt).await;
            }
            Err(Fetch::Transport(e)) => return Err(TaskError::Http(e.to_string())),
            Err(Fetch::Rejected(msg)) => return Err(TaskError::Http(msg)),
            Ok(body) => return Ok(body),
        }
    }
}

enum Fetch {
    Transport(reqwest::Error),
    Rejected(String),
}

async fn fetch(req: RequestBuilder, max_bytes: usize) -> Result<String, Fetch> {
    let mut resp = req.send().await.map_err(Fetch::Transport)?;
    let status = resp.status();
    if resp.content_length().is_some_and(|l| l as usize > max_bytes) {
        return Err(Fetch::Rejected(format!(
            "response body exceeds {max_bytes} bytes"
        )));
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await.map_err(Fetch::Transport)? {
        if body.len() + chunk.len() > max_bytes {
            return Err(Fetch::Rejected(format!(
                "response body exceeds {max_bytes} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    let body = String::from_utf8_lossy(&body).into_owned();
    debug!(%status, bytes = body.len(), "HTTP response");
    if !status.is_success() {
        let excerpt: String = body.chars().take(200).collect();
        return Err(Fetch::Rejected(format!("status {status}: {excerpt}")));
    }
    Ok(body)
}

fn check_restricted(url: &Url) -> Result<(), TaskError> {
    let restricted = match url.host() {
        None => true,
        Some(Host::Domain(d)) => {
            let d = d.trim_end_matches('.').to_ascii_lowercase();
            d == "localhost" || d.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => restricted_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => restricted_ip(IpAddr::V6(ip)),
    };
    if restricted {
        return Err(TaskError::BadParam {
            name: "url",
            reason: format!(
                "{} is a local address, set allowUnrestrictedNetworkAccess to reach it",
                url.host_str().unwrap_or_default()
            ),
        });
    }
    Ok(())
}

fn restricted_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => restricted_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => restricted_v4(v4),
            None => restricted_v6(ip),
        },
    }
}

fn restricted_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
}

fn restricted_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // unique local fc00::/7 and link local fe80::/10
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::{
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        bridges::{create_bridge, NewBridge},
        tasks::{test_utils::*, TaskType},
        Vars,
    };

    async fn serve() -> SocketAddr {
        let app = Router::new()
            .route("/price", get(|| async { Json(json!({"data": {"price": "1.5"}})) }))
            .route(
                "/fail",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/big", get(|| async { "x".repeat(4096) }))
            .route("/echo", post(|Json(body): Json<Value>| async move { Json(body) }))
            .route(
                "/adapter",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_owned();
                    Json(json!({"auth": auth, "request": body}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    fn unrestricted(url: &str) -> Vec<(&'static str, String)> {
        vec![
            ("url", url.to_owned()),
            ("allowUnrestrictedNetworkAccess", "true".into()),
        ]
    }

    fn attrs<'a>(pairs: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
        pairs.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    #[tokio::test]
    async fn get_returns_the_body() {
        let addr = serve().await;
        let (env, _, _) = test_env().await;
        let pairs = unrestricted(&format!("http://{addr}/price"));
        let spec = spec(TaskType::Http, &attrs(&pairs));
        let vars = Vars::default();
        let out = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap();
        let body: Value = serde_json::from_str(out.as_str().unwrap()).unwrap();
        assert_eq!(body, json!({"data": {"price": "1.5"}}));
    }

    #[tokio::test]
    async fn post_sends_request_data() {
        let addr = serve().await;
        let (env, _, _) = test_env().await;
        let mut pairs = unrestricted(&format!("http://{addr}/echo"));
        pairs.push(("method", "POST".into()));
        pairs.push(("requestData", "{\"asset\": $(jobRun.asset)}".into()));
        let spec = spec(TaskType::Http, &attrs(&pairs));
        let vars = Vars::new(json!({"jobRun": {"asset": "\"ETH\""}}));
        let out = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(out.as_str().unwrap()).unwrap(),
            json!({"asset": "ETH"})
        );
    }

    #[tokio::test]
    async fn error_status_and_oversized_bodies_fail() {
        let addr = serve().await;
        let (mut env, _, _) = test_env().await;
        let vars = Vars::default();

        let pairs = unrestricted(&format!("http://{addr}/fail"));
        let spec = spec(TaskType::Http, &attrs(&pairs));
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert_eq!(
            err,
            TaskError::Http("status 500 Internal Server Error: boom".into())
        );

        env.config.http_max_response_bytes = 1024;
        let pairs = unrestricted(&format!("http://{addr}/big"));
        let spec = crate::tasks::test_utils::spec(TaskType::Http, &attrs(&pairs));
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert!(err.to_string().contains("exceeds 1024 bytes"));
    }

    #[tokio::test]
    async fn local_addresses_are_blocked_by_default() {
        let (env, _, _) = test_env().await;
        let vars = Vars::default();
        for url in [
            "http://127.0.0.1:1/x",
            "http://localhost/x",
            "http://10.1.2.3/x",
            "http://[::1]/x",
        ] {
            let spec = spec(TaskType::Http, &[("url", url)]);
            let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
            assert!(
                matches!(err, TaskError::BadParam { name: "url", .. }),
                "{url}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn unreachable_hosts_are_retried_then_fail() {
        let (mut env, _, _) = test_env().await;
        env.config.http_max_attempts = 2;
        env.config.default_http_timeout = Duration::from_millis(200);
        // nothing listens on port 1
        let pairs = unrestricted("http://127.0.0.1:1/x");
        let spec = spec(TaskType::Http, &attrs(&pairs));
        let vars = Vars::default();
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert!(matches!(err, TaskError::Http(_)));
    }

    #[tokio::test]
    async fn bridge_posts_with_the_outgoing_token() {
        let addr = serve().await;
        let (env, _, _) = test_env().await;
        let created = create_bridge(
            &*env.bridges,
            &NewBridge {
                name: "adapter".into(),
                url: format!("http://{addr}/adapter"),
                confirmations: 0,
                minimum_contract_payment: None,
            },
        )
        .await
        .unwrap();

        let spec = spec(
            TaskType::Bridge,
            &[("name", "adapter"), ("requestData", "{\"q\": 1}")],
        );
        let vars = Vars::new(json!({"jobRun": {"meta": {"oracle": "x"}}}));
        let out = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap();
        let body: Value = serde_json::from_str(out.as_str().unwrap()).unwrap();
        assert_eq!(
            body["auth"],
            json!(format!("Bearer {}", created.outgoing_token))
        );
        assert_eq!(body["request"]["id"], json!("1"));
        assert_eq!(body["request"]["data"], json!({"q": 1}));
        assert_eq!(body["request"]["meta"], json!({"oracle": "x"}));

        let spec = spec_named("missing");
        let err = value(&ctx(&env, &spec, &vars, vec![])).await.unwrap_err();
        assert!(matches!(err, TaskError::BadParam { name: "name", .. }));
    }

    fn spec_named(name: &str) -> crate::dag::TaskSpec {
        spec(TaskType::Bridge, &[("name", name)])
    }

    #[test]
    fn header_forms() {
        assert_eq!(
            headers(Some(json!({"X-A": "1"}))).unwrap(),
            vec![("X-A".to_owned(), "1".to_owned())]
        );
        assert_eq!(
            headers(Some(json!(["X-A", "1", "X-B", "2"]))).unwrap().len(),
            2
        );
        assert!(headers(Some(json!(["X-A"]))).is_err());
    }
}
