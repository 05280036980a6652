use crate::items::Item;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const FORBIDDEN_SYMBOLS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
pub const DEFAULT_EXTENSION: &str = "png";
/// Every extension the downloader may save a graph under.
pub const IMAGE_EXTENSIONS: [&str; 5] = [DEFAULT_EXTENSION, "jpg", "gif", "svg", "webp"];

/// Inclusive graph window. Both ends are wall-clock times as the frontend expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: SystemTime,
    pub till: SystemTime,
}

impl TimeWindow {
    pub fn parse(from: &str, till: &str) -> Result<Self, String> {
        let from_ts = humantime::parse_rfc3339_weak(from.trim()).map_err(|err| {
            format!("time_from '{from}' не в формате YYYY-MM-DD HH:MM:SS: {err}")
        })?;
        let till_ts = humantime::parse_rfc3339_weak(till.trim()).map_err(|err| {
            format!("time_till '{till}' не в формате YYYY-MM-DD HH:MM:SS: {err}")
        })?;
        if till_ts < from_ts {
            return Err(format!("time_till ({till}) раньше, чем time_from ({from})"));
        }
        Ok(Self {
            from: from_ts,
            till: till_ts,
        })
    }

    pub fn from_param(&self) -> String {
        render_timestamp(self.from)
    }

    pub fn till_param(&self) -> String {
        render_timestamp(self.till)
    }
}

fn render_timestamp(ts: SystemTime) -> String {
    // 2024-12-23T00:00:00Z -> 2024-12-23 00:00:00
    humantime::format_rfc3339_seconds(ts)
        .to_string()
        .replace('T', " ")
        .trim_end_matches('Z')
        .to_string()
}

/// One image to fetch: a single item over the configured window.
#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub host: String,
    pub item: Item,
    pub window: TimeWindow,
    pub width: u32,
    pub height: u32,
    pub url: Url,
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RequestParams {
    pub web_url: Url,
    pub window: TimeWindow,
    pub width: u32,
    pub height: u32,
    pub output_dir: PathBuf,
    pub skip_existing: bool,
}

#[derive(Debug, Default)]
pub struct BuiltRequests {
    pub requests: Vec<GraphRequest>,
    pub skipped: Vec<PathBuf>,
}

pub fn chart_url(
    web_url: &Url,
    item_id: &str,
    window: &TimeWindow,
    width: u32,
    height: u32,
) -> Url {
    let mut url = web_url.clone();
    let path = if url.path().ends_with('/') {
        format!("{}chart.php", url.path())
    } else {
        format!("{}/chart.php", url.path())
    };
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("from", &window.from_param())
        .append_pair("to", &window.till_param())
        .append_pair("itemids[0]", item_id)
        .append_pair("type", "0")
        .append_pair("profileIdx", "web.item.graph.filter")
        .append_pair("profileIdx2", item_id)
        .append_pair("width", &width.to_string())
        .append_pair("height", &height.to_string());
    url
}

pub fn host_dir(output_dir: &Path, host: &str) -> PathBuf {
    let name = sanitize_filename(host);
    if name.is_empty() {
        output_dir.join("_")
    } else {
        output_dir.join(name)
    }
}

/// `<output_dir>/<host>/<item id>_<item name>.png`
pub fn destination(output_dir: &Path, host: &str, item: &Item) -> PathBuf {
    host_dir(output_dir, host).join(format!("{}.{DEFAULT_EXTENSION}", file_stem(item)))
}

pub fn file_stem(item: &Item) -> String {
    let id = sanitize_filename(&item.id);
    let name = sanitize_filename(&item.name);
    if name.is_empty() {
        id
    } else {
        format!("{id}_{name}")
    }
}

/// The graph already saved for this destination, under any image extension.
pub fn existing_output(destination: &Path) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| destination.with_extension(ext))
        .find(|path| path.is_file())
}

pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN_SYMBOLS.contains(c) && !c.is_control())
        .collect();
    cleaned
        .trim()
        .trim_end_matches(['.', ' '])
        .to_string()
}

pub fn build_requests(hosts: &[(String, Vec<Item>)], params: &RequestParams) -> BuiltRequests {
    let mut built = BuiltRequests::default();
    for (host, items) in hosts {
        for item in items {
            let destination = destination(&params.output_dir, host, item);
            if params.skip_existing {
                if let Some(existing) = existing_output(&destination) {
                    built.skipped.push(existing);
                    continue;
                }
            }
            built.requests.push(GraphRequest {
                host: host.clone(),
                item: item.clone(),
                window: params.window,
                width: params.width,
                height: params.height,
                url: chart_url(
                    &params.web_url,
                    &item.id,
                    &params.window,
                    params.width,
                    params.height,
                ),
                destination,
            });
        }
    }
    built
}
