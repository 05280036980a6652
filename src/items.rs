use crate::api::{ApiClient, ApiError};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

/// Numeric float and numeric unsigned; the only value types chart.php draws.
const GRAPHABLE_VALUE_TYPES: [&str; 2] = ["0", "3"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Item {
    #[serde(rename = "itemid")]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct HostRef {
    hostid: String,
}

#[derive(Debug, Error)]
#[error("не удалось получить элементы данных хоста {host}: {source}")]
pub struct EnumerationError {
    pub host: String,
    #[source]
    pub source: ApiError,
}

/// Items per host, in configured host order. Unknown hosts and hosts without
/// items map to an empty list.
pub async fn enumerate(
    api: &ApiClient,
    hosts: &[String],
    graphable_only: bool,
) -> Result<Vec<(String, Vec<Item>)>, EnumerationError> {
    let mut out = Vec::with_capacity(hosts.len());
    for host in hosts {
        let items = host_items(api, host, graphable_only)
            .await
            .map_err(|source| EnumerationError {
                host: host.clone(),
                source,
            })?;
        out.push((host.clone(), items));
    }
    Ok(out)
}

async fn host_items(api: &ApiClient, host: &str, graphable_only: bool) -> Result<Vec<Item>, ApiError> {
    let found: Vec<HostRef> = api
        .call(
            "host.get",
            json!({
                "output": ["hostid"],
                "filter": {"host": [host]},
            }),
        )
        .await?;

    let Some(host_ref) = found.into_iter().next() else {
        warn!(host = %host, "хост не найден, пропускаем");
        return Ok(Vec::new());
    };

    let mut params = json!({
        "output": ["itemid", "name"],
        "hostids": host_ref.hostid,
        "sortfield": "name",
    });
    if graphable_only {
        params["filter"] = json!({"value_type": GRAPHABLE_VALUE_TYPES});
    }

    let items: Vec<Item> = api.call("item.get", params).await?;
    if items.is_empty() {
        warn!(host = %host, "у хоста нет элементов данных с графиками");
    } else {
        info!(host = %host, items = items.len(), "получен список элементов данных");
    }
    Ok(items)
}
