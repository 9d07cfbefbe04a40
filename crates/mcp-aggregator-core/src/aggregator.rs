//! Capability aggregation: queries each Ready upstream's tools/resources/
//! prompts and maintains the unified, namespaced view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::future::join_all;
use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};
use serde::{Deserialize, Serialize};

use crate::config::NAMESPACE_SEPARATOR;
use crate::errors::RouterError;
use crate::upstream::ReadyClient;

/// `U _1mcp_ C` → `(upstream, original)`. Injective by construction: upstream
/// names are rejected at config load if they contain the separator.
pub fn namespace(upstream: &str, capability: &str) -> String {
    format!("{upstream}{NAMESPACE_SEPARATOR}{capability}")
}

pub fn denamespace(namespaced: &str) -> Result<(String, String), RouterError> {
    match namespaced.split_once(NAMESPACE_SEPARATOR) {
        Some((upstream, original)) if !upstream.is_empty() && !original.is_empty() => {
            Ok((upstream.to_string(), original.to_string()))
        }
        _ => Err(RouterError::InvalidParams(format!(
            "`{namespaced}` is not a validly namespaced name"
        ))),
    }
}

pub fn namespace_resource_uri(upstream: &str, uri: &str) -> String {
    format!("{upstream}://{uri}")
}

pub fn denamespace_resource_uri(namespaced: &str) -> Result<(String, String), RouterError> {
    match namespaced.split_once("://") {
        Some((upstream, rest)) => Ok((upstream.to_string(), rest.to_string())),
        None => Err(RouterError::InvalidParams(format!(
            "`{namespaced}` is not a namespaced resource uri"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub upstream: String,
    pub inner: Option<String>,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

const PER_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of the aggregate capability set over one set of admitted, Ready
/// upstreams at a point in time.
pub struct AggregateNamespace;

impl AggregateNamespace {
    /// Fans out `tools/list` to each admitted upstream, namespaces, and
    /// flattens. Upstreams that time out or error are silently dropped from
    /// the result; callers that need partial-failure detail should consult
    /// the connection manager's summary separately.
    pub async fn list_tools(admitted: &BTreeMap<String, Arc<ReadyClient>>) -> Vec<Tool> {
        let futs = admitted.iter().map(|(name, client)| {
            let name = name.clone();
            let client = client.clone();
            async move {
                let res = tokio::time::timeout(PER_UPSTREAM_TIMEOUT, client.service.list_all_tools())
                    .await
                    .ok()?
                    .ok()?;
                Some((name, res))
            }
        });
        let mut out = Vec::new();
        for result in join_all(futs).await {
            if let Some((upstream, tools)) = result {
                for t in tools {
                    out.push(rename_tool(&upstream, t));
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn list_resources(
        admitted: &BTreeMap<String, Arc<ReadyClient>>,
    ) -> Vec<Resource> {
        let futs = admitted.iter().map(|(name, client)| {
            let name = name.clone();
            let client = client.clone();
            async move {
                let res =
                    tokio::time::timeout(PER_UPSTREAM_TIMEOUT, client.service.list_all_resources())
                        .await
                        .ok()?
                        .ok()?;
                Some((name, res))
            }
        });
        let mut out = Vec::new();
        for result in join_all(futs).await {
            if let Some((upstream, resources)) = result {
                for mut r in resources {
                    r.uri = namespace_resource_uri(&upstream, &r.uri);
                    out.push(r);
                }
            }
        }
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        out
    }

    pub async fn list_resource_templates(
        admitted: &BTreeMap<String, Arc<ReadyClient>>,
    ) -> Vec<ResourceTemplate> {
        let futs = admitted.iter().map(|(name, client)| {
            let name = name.clone();
            let client = client.clone();
            async move {
                let res = tokio::time::timeout(
                    PER_UPSTREAM_TIMEOUT,
                    client.service.list_all_resource_templates(),
                )
                .await
                .ok()?
                .ok()?;
                Some((name, res))
            }
        });
        let mut out = Vec::new();
        for result in join_all(futs).await {
            if let Some((upstream, templates)) = result {
                for mut t in templates {
                    t.uri_template = namespace_resource_uri(&upstream, &t.uri_template);
                    out.push(t);
                }
            }
        }
        out
    }

    pub async fn list_prompts(admitted: &BTreeMap<String, Arc<ReadyClient>>) -> Vec<Prompt> {
        let futs = admitted.iter().map(|(name, client)| {
            let name = name.clone();
            let client = client.clone();
            async move {
                let res =
                    tokio::time::timeout(PER_UPSTREAM_TIMEOUT, client.service.list_all_prompts())
                        .await
                        .ok()?
                        .ok()?;
                Some((name, res))
            }
        });
        let mut out = Vec::new();
        for result in join_all(futs).await {
            if let Some((upstream, prompts)) = result {
                for mut p in prompts {
                    p.name = namespace(&upstream, &p.name);
                    out.push(p);
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Paginates an already-flattened, sorted list by slicing it into
    /// upstream-ordered pages. `page_size` bounds each page.
    pub fn paginate_tools(
        all: &[Tool],
        cursor: Option<&str>,
        page_size: usize,
    ) -> (Vec<Tool>, Option<String>) {
        paginate_slice(all, cursor, page_size)
    }

    pub fn paginate_resources(
        all: &[Resource],
        cursor: Option<&str>,
        page_size: usize,
    ) -> (Vec<Resource>, Option<String>) {
        paginate_slice(all, cursor, page_size)
    }

    pub fn paginate_resource_templates(
        all: &[ResourceTemplate],
        cursor: Option<&str>,
        page_size: usize,
    ) -> (Vec<ResourceTemplate>, Option<String>) {
        paginate_slice(all, cursor, page_size)
    }

    pub fn paginate_prompts(
        all: &[Prompt],
        cursor: Option<&str>,
        page_size: usize,
    ) -> (Vec<Prompt>, Option<String>) {
        paginate_slice(all, cursor, page_size)
    }
}

/// Offset-based pagination shared by every `list_*` method: the cursor's
/// `inner` field carries the flattened union's next start offset, `upstream`
/// is reserved but unused (see `aggregator.rs` module docs on the
/// eager-fetch simplification).
fn paginate_slice<T: Clone>(
    all: &[T],
    cursor: Option<&str>,
    page_size: usize,
) -> (Vec<T>, Option<String>) {
    let start = match cursor {
        None => 0,
        Some(raw) => match Cursor::decode(raw).and_then(|c| c.inner) {
            Some(inner) => inner.parse::<usize>().unwrap_or(0),
            None => 0,
        },
    };
    let end = (start + page_size).min(all.len());
    let page = all[start.min(all.len())..end].to_vec();
    let next = if end < all.len() {
        Some(
            Cursor {
                upstream: String::new(),
                inner: Some(end.to_string()),
            }
            .encode(),
        )
    } else {
        None
    };
    (page, next)
}

fn rename_tool(upstream: &str, mut tool: Tool) -> Tool {
    tool.name = namespace(upstream, &tool.name).into();
    tool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_round_trips() {
        let n = namespace("math", "add");
        assert_eq!(n, "math_1mcp_add");
        let (u, c) = denamespace(&n).unwrap();
        assert_eq!(u, "math");
        assert_eq!(c, "add");
    }

    #[test]
    fn denamespace_rejects_unnamespaced_input() {
        assert!(denamespace("add").is_err());
    }

    #[test]
    fn cursor_round_trips_through_base64() {
        let c = Cursor {
            upstream: "math".into(),
            inner: Some("17".into()),
        };
        let encoded = c.encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded.upstream, "math");
        assert_eq!(decoded.inner, Some("17".into()));
    }

    #[test]
    fn pagination_terminates_when_cursor_empty() {
        let tools: Vec<Tool> = (0..5)
            .map(|i| Tool {
                name: format!("t{i}").into(),
                description: None,
                input_schema: Arc::new(serde_json::Map::new()),
                annotations: None,
                output_schema: None,
                title: None,
                icons: None,
            })
            .collect();
        let (page1, next1) = AggregateNamespace::paginate_tools(&tools, None, 2);
        assert_eq!(page1.len(), 2);
        assert!(next1.is_some());
        let (page2, next2) = AggregateNamespace::paginate_tools(&tools, next1.as_deref(), 2);
        assert_eq!(page2.len(), 2);
        assert!(next2.is_some());
        let (page3, next3) = AggregateNamespace::paginate_tools(&tools, next2.as_deref(), 2);
        assert_eq!(page3.len(), 1);
        assert!(next3.is_none());
    }
}
