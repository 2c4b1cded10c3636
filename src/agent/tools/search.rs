use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use tracing::debug;

use super::{Tool, ToolContext, ToolError};

const NO_RESULTS: &str = "No good search result was found";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) threadchat/0.1";

pub struct SearchTool;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[allow(clippy::expect_used)]
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));

fn collapse_ws(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

/// Extracts hits from a DuckDuckGo HTML results page.
pub fn parse_results(html: &str, max: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let (Ok(result_sel), Ok(title_sel), Ok(snippet_sel)) = (
        Selector::parse(".result"),
        Selector::parse(".result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };
    doc.select(&result_sel)
        .filter_map(|node| {
            let title_el = node.select(&title_sel).next()?;
            let title = collapse_ws(&title_el.text().collect::<String>());
            let url = title_el.value().attr("href").unwrap_or_default().to_string();
            let snippet = node
                .select(&snippet_sel)
                .next()
                .map(|s| collapse_ws(&s.text().collect::<String>()))
                .unwrap_or_default();
            (!title.is_empty()).then_some(SearchHit { title, snippet, url })
        })
        .take(max)
        .collect()
}

pub fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return NO_RESULTS.to_string();
    }
    hits.iter()
        .map(|h| format!("{}: {} ({})", h.title, h.snippet, h.url))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str { "search" }

    fn description(&self) -> &'static str {
        "Search the web. Useful for current events and facts you do not know. Input should be a search query."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": {"type": "string", "description": "search query"} },
            "required": ["query"],
        })
    }

    async fn run(&self, ctx: ToolContext<'_>, args: Value) -> anyhow::Result<Value> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or(ToolError::MissingArgument("query"))?;
        let url = url::Url::parse_with_params(&ctx.settings.search_endpoint, &[("q", query)])?;
        debug!(thread_id = ctx.thread_id, %url, "search request");
        let resp = ctx.http.get(url).header(reqwest::header::USER_AGENT, USER_AGENT).send().await?;
        if !resp.status().is_success() {
            return Err(ToolError::Provider(resp.status()).into());
        }
        let body = resp.text().await?;
        let hits = parse_results(&body, ctx.settings.search_max_results);
        Ok(Value::String(render_hits(&hits)))
    }
}
