pub mod retry;
pub mod writer;

use crate::graph::{GraphRequest, DEFAULT_EXTENSION, IMAGE_EXTENSIONS};
use crate::metrics::Metrics;
use crate::report::{sort_results, DownloadResult};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use retry::{is_transient_status, NextAction, Outcome, RetryPolicy};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("ошибка соединения: {0}")]
    Transport(String),
    #[error("таймаут запроса")]
    Timeout,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("пустой ответ")]
    EmptyBody,
    #[error("ответ не является изображением (Content-Type: {0}), вероятно, нет сессии веб-интерфейса")]
    NotImage(String),
    #[error("ошибка записи {path}: {message}")]
    Filesystem { path: String, message: String },
    #[error("загрузка прервана")]
    Cancelled,
}

impl DownloadError {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Transport(_) | Self::Timeout | Self::EmptyBody => Outcome::Transient,
            Self::Status(code) if is_transient_status(*code) => Outcome::Transient,
            Self::Status(_) | Self::NotImage(_) | Self::Filesystem { .. } | Self::Cancelled => {
                Outcome::Permanent
            }
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

const PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec}, {eta}) {msg}";

/// Terminal progress bar for the pipeline, or a hidden one when disabled.
pub fn progress_bar(enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
        Ok(style) => bar.set_style(style.progress_chars("=> ")),
        Err(err) => warn!(error = %err, "некорректный шаблон индикатора прогресса"),
    }
    bar
}

#[derive(Debug)]
struct Payload {
    body: Vec<u8>,
    extension: &'static str,
}

/// Fixed-size worker pool over a pre-filled queue.
pub struct Pipeline {
    client: Client,
    policy: RetryPolicy,
    workers: usize,
    shutdown_grace: Duration,
    metrics: Arc<Metrics>,
    progress: ProgressBar,
}

impl Pipeline {
    pub fn new(
        client: Client,
        policy: RetryPolicy,
        workers: usize,
        shutdown_grace: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            policy,
            workers: workers.max(1),
            shutdown_grace,
            metrics,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Returns exactly one result per request, sorted by host and item.
    /// Requests still queued when `shutdown` flips are reported as cancelled.
    pub async fn run(
        &self,
        requests: Vec<GraphRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<DownloadResult> {
        let total = requests.len();
        self.progress.set_length(total as u64);
        let queue = Arc::new(Mutex::new(VecDeque::from(requests)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers.min(total) {
            let worker = Worker {
                id: worker_id,
                client: self.client.clone(),
                policy: self.policy,
                shutdown_grace: self.shutdown_grace,
                metrics: self.metrics.clone(),
                queue: queue.clone(),
                results: tx.clone(),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            self.metrics.record_result(&result);
            self.progress.inc(1);
            self.progress
                .set_message(format!("{} / {}", result.request.host, result.request.item.name));
            self.progress.suspend(|| {
                info!(
                    done = results.len() + 1,
                    total,
                    host = %result.request.host,
                    item = %result.request.item.name,
                    status = ?result.status,
                    attempts = result.attempts_used,
                    path = ?result.path,
                    "прогресс загрузки"
                )
            });
            results.push(result);
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "рабочая задача загрузки завершилась аварийно");
            }
        }

        let leftover: Vec<GraphRequest> = queue.lock().await.drain(..).collect();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "загрузка остановлена, оставшиеся запросы не выполнены");
        }
        for request in leftover {
            let result = fail(request, 0, DownloadError::Cancelled).await;
            self.metrics.record_result(&result);
            self.progress.inc(1);
            results.push(result);
        }
        self.progress.finish_and_clear();

        sort_results(&mut results);
        results
    }
}

struct Worker {
    id: usize,
    client: Client,
    policy: RetryPolicy,
    shutdown_grace: Duration,
    metrics: Arc<Metrics>,
    queue: Arc<Mutex<VecDeque<GraphRequest>>>,
    results: mpsc::UnboundedSender<DownloadResult>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        loop {
            if *self.shutdown.borrow() {
                debug!(worker = self.id, "получен сигнал остановки, новые запросы не берём");
                break;
            }
            let Some(request) = self.queue.lock().await.pop_front() else {
                break;
            };
            let result = self.process(request).await;
            if self.results.send(result).is_err() {
                break;
            }
        }
    }

    /// Drives one request from PENDING to SUCCESS or FAILED.
    async fn process(&self, request: GraphRequest) -> DownloadResult {
        debug!(
            worker = self.id,
            host = %request.host,
            item = %request.item.id,
            from = %request.window.from_param(),
            till = %request.window.till_param(),
            width = request.width,
            height = request.height,
            "запрос графика"
        );
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            self.metrics.attempt_started();
            let attempt = self.attempt(&request.url).await;
            self.metrics.attempt_finished(match &attempt {
                Ok(_) => Outcome::Success,
                Err(err) => err.outcome(),
            });

            let err = match attempt {
                Ok(payload) => return self.store(request, attempts, payload).await,
                Err(err) => err,
            };

            match self.policy.next_action(err.outcome(), attempts) {
                NextAction::Retry(delay) => {
                    warn!(
                        host = %request.host,
                        item = %request.item.name,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts(),
                        delay = %humantime::format_duration(delay),
                        error = %err,
                        "ошибка загрузки графика, повтор"
                    );
                    if !self.backoff(delay).await {
                        return fail(request, attempts, DownloadError::Cancelled).await;
                    }
                }
                NextAction::Fail | NextAction::Complete => {
                    warn!(
                        host = %request.host,
                        item = %request.item.name,
                        attempts,
                        error = %err,
                        "не удалось загрузить график"
                    );
                    return fail(request, attempts, err).await;
                }
            }
        }
    }

    /// One HTTP attempt. After shutdown it may run on for the grace period only.
    async fn attempt(&self, url: &Url) -> Result<Payload, DownloadError> {
        let mut shutdown = self.shutdown.clone();
        let grace = self.shutdown_grace;
        tokio::select! {
            res = fetch_graph(&self.client, url) => res,
            _ = async {
                wait_for_shutdown(&mut shutdown).await;
                tokio::time::sleep(grace).await;
            } => Err(DownloadError::Cancelled),
        }
    }

    /// `false` when shutdown interrupted the wait.
    async fn backoff(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_shutdown(&mut shutdown) => false,
        }
    }

    async fn store(&self, request: GraphRequest, attempts: u32, payload: Payload) -> DownloadResult {
        let path = request.destination.with_extension(payload.extension);
        match writer::write_atomic(&path, &payload.body).await {
            Ok(()) => {
                debug!(path = %path.display(), bytes = payload.body.len(), "график сохранён");
                let bytes = payload.body.len() as u64;
                DownloadResult::succeeded(request, attempts, path, bytes)
            }
            Err(err) => {
                error!(
                    host = %request.host,
                    path = %path.display(),
                    error = %err,
                    "ошибка файловой системы при сохранении графика"
                );
                let err = DownloadError::Filesystem {
                    path: path.display().to_string(),
                    message: err.to_string(),
                };
                fail(request, attempts, err).await
            }
        }
    }
}

/// Builds a FAILED result and makes sure nothing is left at the destination,
/// whatever image extension an earlier run saved it under.
async fn fail(request: GraphRequest, attempts: u32, err: DownloadError) -> DownloadResult {
    for ext in IMAGE_EXTENSIONS {
        let path = request.destination.with_extension(ext);
        if let Err(io_err) = writer::discard(&path).await {
            warn!(
                path = %path.display(),
                error = %io_err,
                "не удалось удалить файл неудачной загрузки"
            );
        }
    }
    DownloadResult::failed(request, attempts, err)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // sender gone without a signal: never cancel
            std::future::pending::<()>().await;
        }
    }
}

async fn fetch_graph(client: &Client, url: &Url) -> Result<Payload, DownloadError> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .map_err(DownloadError::from_reqwest)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::Status(status.as_u16()));
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.bytes().await.map_err(DownloadError::from_reqwest)?;
    if body.is_empty() {
        return Err(DownloadError::EmptyBody);
    }

    let extension = match content_type {
        Some(ct) => image_extension(&ct).ok_or(DownloadError::NotImage(ct))?,
        None => DEFAULT_EXTENSION,
    };

    Ok(Payload {
        body: body.to_vec(),
        extension,
    })
}

fn image_extension(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/svg+xml" => Some("svg"),
        "image/webp" => Some("webp"),
        other if other.starts_with("image/") => Some(DEFAULT_EXTENSION),
        _ => None,
    }
}
