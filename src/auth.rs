use crate::api::{ApiClient, ApiError};
use crate::config::WebCredentials;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const USER_AGENT: &str = concat!("graphgrab/", env!("CARGO_PKG_VERSION"));
const SESSION_COOKIE: &str = "zbx_session";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("не удалось создать HTTP-клиент: {0}")]
    Client(#[source] reqwest::Error),
    #[error("API отклонил токен: {0}")]
    Token(#[source] ApiError),
    #[error("ошибка входа в веб-интерфейс: {0}")]
    WebTransport(#[source] reqwest::Error),
    #[error("веб-интерфейс ответил на вход статусом HTTP {0}")]
    WebStatus(u16),
    #[error("веб-интерфейс не выдал cookie zbx_session: проверьте логин и пароль")]
    NoSession,
}

/// Authenticated state shared by enumeration and downloads.
#[derive(Debug)]
pub struct Session {
    pub client: Client,
    pub api: ApiClient,
    pub web_url: Url,
    pub web_login: bool,
}

pub fn build_client(jar: Arc<Jar>, request_timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .cookie_provider(jar)
        .timeout(request_timeout)
        .build()
}

/// Verifies the API token and, with web credentials, logs into the frontend so
/// the shared client carries a session cookie for `chart.php`.
pub async fn authenticate(
    api_url: Url,
    web_url: Url,
    token: String,
    credentials: Option<&WebCredentials>,
    request_timeout: Duration,
) -> Result<Session, AuthError> {
    let jar = Arc::new(Jar::default());
    let client = build_client(jar.clone(), request_timeout).map_err(AuthError::Client)?;
    let api = ApiClient::new(client.clone(), api_url, token);

    let user: Value = api
        .call_anonymous("user.checkAuthentication", json!({ "token": api.token() }))
        .await
        .map_err(AuthError::Token)?;
    info!(
        api = %api.url(),
        user = user["username"].as_str().unwrap_or("?"),
        "токен API принят"
    );

    let web_login = match credentials {
        Some(creds) => {
            web_login(&client, &jar, &web_url, creds).await?;
            info!(web = %web_url, user = %creds.username, "выполнен вход в веб-интерфейс");
            true
        }
        None => {
            warn!("web.username не задан: chart.php, скорее всего, вернёт страницу входа");
            false
        }
    };

    Ok(Session {
        client,
        api,
        web_url,
        web_login,
    })
}

async fn web_login(
    client: &Client,
    jar: &Jar,
    web_url: &Url,
    creds: &WebCredentials,
) -> Result<(), AuthError> {
    let mut login_url = web_url.clone();
    login_url.set_path(&format!("{}index.php", web_url.path()));

    let resp = client
        .post(login_url)
        .form(&[
            ("name", creds.username.as_str()),
            ("password", creds.password.as_str()),
            ("autologin", "1"),
            ("enter", "Sign in"),
        ])
        .send()
        .await
        .map_err(AuthError::WebTransport)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(AuthError::WebStatus(status.as_u16()));
    }

    let has_session = jar
        .cookies(web_url)
        .and_then(|v| v.to_str().map(|s| s.contains(SESSION_COOKIE)).ok())
        .unwrap_or(false);
    if !has_session {
        return Err(AuthError::NoSession);
    }
    Ok(())
}
