use crate::download::DownloadError;
use crate::graph::GraphRequest;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub request: GraphRequest,
    pub status: DownloadStatus,
    pub attempts_used: u32,
    pub error: Option<DownloadError>,
    /// Final file location; the extension may differ from the request's default.
    pub path: Option<PathBuf>,
    pub bytes: u64,
}

impl DownloadResult {
    pub fn succeeded(request: GraphRequest, attempts_used: u32, path: PathBuf, bytes: u64) -> Self {
        Self {
            request,
            status: DownloadStatus::Success,
            attempts_used,
            error: None,
            path: Some(path),
            bytes,
        }
    }

    pub fn failed(request: GraphRequest, attempts_used: u32, error: DownloadError) -> Self {
        Self {
            request,
            status: DownloadStatus::Failed,
            attempts_used,
            error: Some(error),
            path: None,
            bytes: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DownloadStatus::Success
    }
}

/// Deterministic report order: host, item name, item id.
pub fn sort_results(results: &mut [DownloadResult]) {
    results.sort_by(|a, b| {
        (&a.request.host, &a.request.item.name, &a.request.item.id).cmp(&(
            &b.request.host,
            &b.request.item.name,
            &b.request.item.id,
        ))
    });
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub failures: Vec<DownloadResult>,
}

impl Summary {
    pub fn new(results: &[DownloadResult], skipped: usize, elapsed: Duration) -> Self {
        let failures: Vec<DownloadResult> = results
            .iter()
            .filter(|r| !r.is_success())
            .cloned()
            .collect();
        Self {
            total: results.len(),
            succeeded: results.len() - failures.len(),
            failed: failures.len(),
            skipped,
            bytes: results.iter().map(|r| r.bytes).sum(),
            elapsed,
            failures,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = Duration::from_secs(self.elapsed.as_secs());
        writeln!(
            f,
            "Итого: {} запросов, успешно {}, с ошибкой {}, пропущено {} ({} байт за {})",
            self.total,
            self.succeeded,
            self.failed,
            self.skipped,
            self.bytes,
            humantime::format_duration(elapsed)
        )?;
        if !self.failures.is_empty() {
            writeln!(f, "Не загружены:")?;
            for r in &self.failures {
                let error = r
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                writeln!(
                    f,
                    "  {} / {} [{}] попыток: {}: {}",
                    r.request.host, r.request.item.name, r.request.item.id, r.attempts_used, error
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{chart_url, TimeWindow};
    use crate::items::Item;
    use reqwest::Url;

    fn request(host: &str, id: &str, name: &str) -> GraphRequest {
        let window = TimeWindow::parse("2024-01-01 00:00:00", "2024-01-02 00:00:00").unwrap();
        let base = Url::parse("http://zabbix.local/").unwrap();
        GraphRequest {
            host: host.to_string(),
            item: Item {
                id: id.to_string(),
                name: name.to_string(),
            },
            window,
            width: 10,
            height: 10,
            url: chart_url(&base, id, &window, 10, 10),
            destination: PathBuf::from(format!("/out/{host}/{id}.png")),
        }
    }

    #[test]
    fn results_sort_by_host_then_item() {
        let mut results = vec![
            DownloadResult::failed(request("b", "1", "cpu"), 1, DownloadError::Status(404)),
            DownloadResult::succeeded(request("a", "2", "mem"), 1, "/out/a/2.png".into(), 5),
            DownloadResult::succeeded(request("a", "3", "cpu"), 2, "/out/a/3.png".into(), 5),
        ];
        sort_results(&mut results);
        let order: Vec<&str> = results.iter().map(|r| r.request.item.id.as_str()).collect();
        assert_eq!(order, vec!["3", "2", "1"]);
    }

    #[test]
    fn summary_counts_and_lists_failures() {
        let results = vec![
            DownloadResult::succeeded(request("a", "1", "cpu"), 1, "/out/a/1.png".into(), 100),
            DownloadResult::failed(request("a", "2", "mem"), 1, DownloadError::Status(404)),
            DownloadResult::failed(request("b", "3", "disk"), 0, DownloadError::Cancelled),
        ];
        let summary = Summary::new(&results, 4, Duration::from_millis(2500));

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.bytes, 100);
        assert!(!summary.all_succeeded());

        let text = summary.to_string();
        assert!(text.contains("успешно 1, с ошибкой 2"));
        assert!(text.contains("a / mem [2] попыток: 1: HTTP 404"));
        assert!(text.contains("b / disk [3] попыток: 0"));
    }
}
