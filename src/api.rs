use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("ошибка соединения с API: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("API ответил статусом HTTP {0}")]
    Status(u16),
    #[error("не удалось разобрать ответ API: {0}")]
    Decode(String),
    #[error("API вернул ошибку {code}: {message} {data}")]
    Rpc {
        code: i64,
        message: String,
        data: String,
    },
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<String>,
}

/// Zabbix JSON-RPC 2.0 client authenticated with a bearer API token.
#[derive(Debug)]
pub struct ApiClient {
    client: Client,
    url: Url,
    token: String,
    next_id: AtomicU64,
}

impl ApiClient {
    pub fn new(client: Client, url: Url, token: String) -> Self {
        Self {
            client,
            url,
            token,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ApiError> {
        self.send(method, params, true).await
    }

    /// For methods that must be called without credentials, such as
    /// `user.checkAuthentication`.
    pub async fn call_anonymous<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ApiError> {
        self.send(method, params, false).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        with_token: bool,
    ) -> Result<T, ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let mut req = self.client.post(self.url.clone()).json(&payload);
        if with_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", self.token));
        }
        let resp = req.send().await.map_err(ApiError::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?;

        if let Some(err) = body.error {
            return Err(ApiError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data.unwrap_or_default(),
            });
        }

        let result = body
            .result
            .ok_or_else(|| ApiError::Decode(format!("в ответе на {method} нет поля result")))?;
        serde_json::from_value(result).map_err(|err| ApiError::Decode(err.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::spawn_server;
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    async fn rpc(headers: HeaderMap, Json(req): Json<Value>) -> Json<Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match req["method"].as_str() {
            Some("echo.auth") => Json(json!({"jsonrpc": "2.0", "result": auth, "id": req["id"]})),
            Some("fail") => Json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32602, "message": "Invalid params.", "data": "No permissions."},
                "id": req["id"],
            })),
            _ => Json(json!({"jsonrpc": "2.0", "id": req["id"]})),
        }
    }

    async fn client_for(app: Router) -> ApiClient {
        let addr = spawn_server(app).await;
        let url = Url::parse(&format!("http://{addr}/api_jsonrpc.php")).unwrap();
        ApiClient::new(Client::new(), url, "tok-123".to_string())
    }

    #[tokio::test]
    async fn call_sends_bearer_token() {
        let api = client_for(Router::new().route("/api_jsonrpc.php", post(rpc))).await;
        let auth: String = api.call("echo.auth", json!({})).await.unwrap();
        assert_eq!(auth, "Bearer tok-123");
    }

    #[tokio::test]
    async fn anonymous_call_omits_token() {
        let api = client_for(Router::new().route("/api_jsonrpc.php", post(rpc))).await;
        let auth: String = api.call_anonymous("echo.auth", json!({})).await.unwrap();
        assert_eq!(auth, "");
    }

    #[tokio::test]
    async fn rpc_error_object_is_surfaced() {
        let api = client_for(Router::new().route("/api_jsonrpc.php", post(rpc))).await;
        let err = api.call::<Value>("fail", json!({})).await.unwrap_err();
        match err {
            ApiError::Rpc { code, data, .. } => {
                assert_eq!(code, -32602);
                assert_eq!(data, "No permissions.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_result_is_decode_error() {
        let api = client_for(Router::new().route("/api_jsonrpc.php", post(rpc))).await;
        let err = api.call::<Value>("nothing", json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let app = Router::new().route(
            "/api_jsonrpc.php",
            post(|| async { StatusCode::BAD_GATEWAY }),
        );
        let api = client_for(app).await;
        let err = api.call::<Value>("host.get", json!({})).await.unwrap_err();
        assert!(matches!(err, ApiError::Status(502)));
    }
}
