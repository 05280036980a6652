mod api;
mod auth;
mod config;
mod download;
mod graph;
mod items;
mod metrics;
mod report;

use auth::AuthError;
use clap::Parser;
use config::{Config, ConfigError};
use download::retry::RetryPolicy;
use download::Pipeline;
use graph::RequestParams;
use items::EnumerationError;
use metrics::Metrics;
use report::Summary;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_DOWNLOAD_FAILED: i32 = 1;
const EXIT_SETUP_FAILED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "graphgrab")]
#[command(version)]
#[command(about = "Bulk download of Zabbix graph images per host")]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Replaces the hosts list from the config. Repeatable.
    #[arg(long = "host")]
    hosts: Vec<String>,
    #[arg(long)]
    output_dir: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    /// Authenticate and enumerate, print URL and destination per graph, download nothing.
    #[arg(long)]
    dry_run: bool,
    /// Draw a progress bar on stderr while downloading.
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Error)]
enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("ошибка аутентификации: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
    #[error("не удалось инициализировать метрики: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(EXIT_SETUP_FAILED);
        }
    };
    apply_overrides(&mut cfg, &cli);

    match run(&cfg, cli.dry_run, cli.progress).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_DOWNLOAD_FAILED),
        Err(err) => {
            error!(error = %err, "запуск прерван");
            std::process::exit(EXIT_SETUP_FAILED);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_overrides(cfg: &mut Config, cli: &Cli) {
    if !cli.hosts.is_empty() {
        cfg.hosts = cli.hosts.clone();
    }
    if let Some(dir) = &cli.output_dir {
        cfg.output_dir = dir.clone();
    }
    if let Some(workers) = cli.workers {
        cfg.download.workers = workers;
    }
}

/// `Ok(true)` when every graph was saved.
async fn run(cfg: &Config, dry_run: bool, progress: bool) -> Result<bool, SetupError> {
    cfg.validate()?;
    let token = cfg.resolve_api_token()?;
    let credentials = cfg.resolve_web_credentials()?;
    let window = cfg.time_window()?;
    let api_url = Url::parse(&cfg.api_url)
        .map_err(|err| ConfigError::Validation(format!("api_url: {err}")))?;
    let web_url = cfg.web_base_url()?;
    let metrics = Metrics::new()?;

    info!(
        api = %api_url,
        web = %web_url,
        hosts = cfg.hosts.len(),
        from = %window.from_param(),
        till = %window.till_param(),
        workers = cfg.download.workers,
        retry_count = cfg.download.retry_count,
        output_dir = %cfg.output_dir,
        "запуск graphgrab"
    );
    let started = Instant::now();

    let session = auth::authenticate(
        api_url,
        web_url,
        token,
        credentials.as_ref(),
        Duration::from_millis(cfg.download.request_timeout_ms),
    )
    .await?;

    let hosts = items::enumerate(&session.api, &cfg.hosts, cfg.graphable_only).await?;
    let item_count: usize = hosts.iter().map(|(_, items)| items.len()).sum();
    metrics.set_enumeration(cfg.hosts.len(), item_count);
    info!(
        hosts = hosts.len(),
        items = item_count,
        web_login = session.web_login,
        "перечисление элементов данных завершено"
    );

    let built = graph::build_requests(
        &hosts,
        &RequestParams {
            web_url: session.web_url.clone(),
            window,
            width: cfg.image.width,
            height: cfg.image.height,
            output_dir: PathBuf::from(&cfg.output_dir),
            skip_existing: cfg.skip_existing,
        },
    );
    for path in &built.skipped {
        info!(path = %path.display(), "файл уже существует, пропускаем");
    }
    metrics.add_skipped(built.skipped.len());

    if dry_run {
        for req in &built.requests {
            println!("{}\t{}", req.url, req.destination.display());
        }
        info!(requests = built.requests.len(), "пробный запуск, загрузка не выполнялась");
        return Ok(true);
    }

    if built.requests.is_empty() {
        warn!("нет графиков для загрузки");
    } else {
        info!(requests = built.requests.len(), "начинаем загрузку графиков");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
            return;
        }
        info!("получен Ctrl+C, выполняется остановка");
        let _ = shutdown_tx.send(true);
    });

    let pipeline = Pipeline::new(
        session.client.clone(),
        RetryPolicy::from_config(&cfg.download),
        cfg.download.workers,
        Duration::from_millis(cfg.download.shutdown_grace_ms),
        metrics.clone(),
    )
    .with_progress(download::progress_bar(progress));
    let results = pipeline.run(built.requests, shutdown_rx).await;
    signal_task.abort();

    let summary = Summary::new(&results, built.skipped.len(), started.elapsed());
    metrics.finish_run(summary.elapsed);
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        "загрузка завершена"
    );
    print!("{summary}");

    if let Some(path) = &cfg.metrics_file {
        if let Err(err) = metrics.write_to_file(Path::new(path)) {
            error!(path = %path, error = %err, "не удалось записать файл метрик");
        }
    }

    Ok(summary.all_succeeded())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::spawn_server;
    use axum::extract::Query;
    use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn rpc(Json(req): Json<Value>) -> Json<Value> {
        let result = match req["method"].as_str() {
            Some("user.checkAuthentication") => json!({"userid": "1", "username": "Admin"}),
            Some("host.get") => match req["params"]["filter"]["host"][0].as_str() {
                Some("A") => json!([{"hostid": "1"}]),
                Some("B") => json!([{"hostid": "2"}]),
                _ => json!([]),
            },
            Some("item.get") => match req["params"]["hostids"].as_str() {
                Some("1") => json!([
                    {"itemid": "11", "name": "CPU load"},
                    {"itemid": "12", "name": "Free memory"},
                    {"itemid": "404", "name": "Gone"},
                ]),
                _ => json!([]),
            },
            _ => Value::Null,
        };
        Json(json!({"jsonrpc": "2.0", "result": result, "id": req["id"]}))
    }

    async fn chart(Query(q): Query<HashMap<String, String>>) -> Response {
        match q.get("itemids[0]").map(String::as_str) {
            Some("404") => axum::http::StatusCode::NOT_FOUND.into_response(),
            _ => ([(CONTENT_TYPE, "image/png")], "png-bytes").into_response(),
        }
    }

    async fn zabbix() -> String {
        let app = Router::new()
            .route("/api_jsonrpc.php", post(rpc))
            .route(
                "/index.php",
                post(|| async { ([(SET_COOKIE, "zbx_session=s1; Path=/")], "ok") }),
            )
            .route("/chart.php", get(chart));
        let addr = spawn_server(app).await;
        format!("http://{addr}/api_jsonrpc.php")
    }

    fn config(api_url: String, output_dir: &Path) -> Config {
        let mut cfg: Config = serde_yaml::from_str(Config::example_yaml()).unwrap();
        cfg.api_url = api_url;
        cfg.api_token_env = "GRAPHGRAB_MAIN_TEST_TOKEN_UNSET".to_string();
        cfg.api_token = Some("tok".to_string());
        cfg.web.password_env = "GRAPHGRAB_MAIN_TEST_PASSWORD_UNSET".to_string();
        cfg.web.password = Some("zabbix".to_string());
        cfg.hosts = vec!["A".to_string(), "B".to_string()];
        cfg.output_dir = output_dir.display().to_string();
        cfg.download.retry_count = 1;
        cfg.download.retry_base_delay_ms = 1;
        cfg.download.retry_max_delay_ms = 2;
        cfg
    }

    #[tokio::test]
    async fn end_to_end_run_reports_partial_failure() {
        let out = tempfile::tempdir().unwrap();
        let metrics_file = out.path().join("graphgrab.prom");
        let mut cfg = config(zabbix().await, &out.path().join("graphs"));
        cfg.metrics_file = Some(metrics_file.display().to_string());

        let all_ok = run(&cfg, false, false).await.expect("запуск");

        assert!(!all_ok);
        let host_dir = out.path().join("graphs").join("A");
        assert!(host_dir.join("11_CPU load.png").exists());
        assert!(host_dir.join("12_Free memory.png").exists());
        assert!(!host_dir.join("404_Gone.png").exists());
        assert!(!out.path().join("graphs").join("B").exists());

        let text = std::fs::read_to_string(metrics_file).unwrap();
        assert!(text.contains("graphgrab_requests_total{status=\"success\"} 2"));
        assert!(text.contains("graphgrab_requests_total{status=\"failed\"} 1"));
    }

    #[tokio::test]
    async fn dry_run_downloads_nothing() {
        let out = tempfile::tempdir().unwrap();
        let cfg = config(zabbix().await, &out.path().join("graphs"));

        assert!(run(&cfg, true, false).await.expect("запуск"));
        assert!(!out.path().join("graphs").exists());
    }

    #[tokio::test]
    async fn invalid_config_is_setup_error() {
        let out = tempfile::tempdir().unwrap();
        let mut cfg = config(zabbix().await, out.path());
        cfg.image.width = 0;

        let err = run(&cfg, false, false).await.unwrap_err();
        assert!(matches!(err, SetupError::Config(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn unreachable_api_is_setup_error() {
        let out = tempfile::tempdir().unwrap();
        let cfg = config("http://127.0.0.1:1/api_jsonrpc.php".to_string(), out.path());

        let err = run(&cfg, false, false).await.unwrap_err();
        assert!(matches!(err, SetupError::Auth(_)));
    }

    #[test]
    fn cli_overrides_replace_config_values() {
        let out = tempfile::tempdir().unwrap();
        let mut cfg = config("http://127.0.0.1:1/api_jsonrpc.php".to_string(), out.path());
        let cli = Cli::parse_from([
            "graphgrab",
            "--host",
            "x",
            "--host",
            "y",
            "--workers",
            "3",
            "--output-dir",
            "/tmp/g",
            "--progress",
        ]);
        apply_overrides(&mut cfg, &cli);

        assert_eq!(cfg.hosts, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(cfg.download.workers, 3);
        assert_eq!(cfg.output_dir, "/tmp/g");
        assert!(cli.progress);
        assert!(!cli.dry_run);
    }
}
