//! 网页工具：web_fetch（域名白名单、超时、结果大小限制）与 web_search（DuckDuckGo HTML）
//!
//! web_fetch 仅允许配置中的域名；HTML 响应用 html2text 提取可读文本；
//! 响应超过 max_result_chars 时截断并追加 ...[truncated]。

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::WebSection;
use crate::tools::{required_str, ParamType, Tool, ToolContext, ToolError, ToolParameter};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; drone/0.1; +https://github.com/drone-agent)";
const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const MAX_SEARCH_RESULTS: usize = 5;

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head: String = s.chars().take(512).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.contains("<head")
}

fn html_to_text(html: &str) -> String {
    from_read(html.as_bytes(), 120).unwrap_or_else(|_| html.to_string())
}

/// 从 URL 中取出 host（小写），仅接受 http / https
fn extract_domain(url: &str) -> Result<String, ToolError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| ToolError::InvalidArguments(format!("Invalid URL '{}': {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ToolError::InvalidArguments(format!(
            "Unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    parsed
        .host_str()
        .map(|h| h.to_lowercase())
        .ok_or_else(|| ToolError::InvalidArguments(format!("URL has no host: {}", url)))
}

fn truncate_chars(text: String, max: usize) -> (String, bool) {
    if text.chars().count() > max {
        (text.chars().take(max).collect::<String>() + "\n...[truncated]", true)
    } else {
        (text, false)
    }
}

/// web_fetch：抓取 URL 内容，仅允许白名单域名
pub struct WebFetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

impl WebFetchTool {
    pub fn new(web: &WebSection) -> Self {
        Self {
            client: build_client(Duration::from_secs(web.timeout_secs)),
            allowed_domains: web
                .allowed_domains
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            max_result_chars: web.max_result_chars,
        }
    }

    fn check_allowed(&self, url: &str) -> Result<(), ToolError> {
        let domain = extract_domain(url)?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(ToolError::InvalidArguments(format!(
                "Domain not in allowlist: {}",
                domain
            )))
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page from an allow-listed domain and return its readable text"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required(
            "url",
            ParamType::String,
            "http(s) URL to fetch",
        )]
    }

    async fn invoke(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = required_str(args, "url")?.trim();
        self.check_allowed(url)?;
        ctx.span.in_scope(|| tracing::info!(url = %url, "web fetch"));

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Network(format!("Request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(ToolError::Network(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ToolError::Network(format!("Read body: {}", e)))?;
        let body = body.trim_start_matches('\u{FEFF}');

        let text = if looks_like_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        let (content, truncated) = truncate_chars(text, self.max_result_chars);
        Ok(json!({
            "url": url,
            "content": content,
            "truncated": truncated,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

static RESULT_LINK_RE: OnceLock<Regex> = OnceLock::new();
static RESULT_SNIPPET_RE: OnceLock<Regex> = OnceLock::new();

fn inline_text(fragment: &str) -> String {
    let text = from_read(fragment.as_bytes(), 10_000).unwrap_or_else(|_| fragment.to_string());
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// DuckDuckGo 的跳转链接 `//duckduckgo.com/l/?uddg=<encoded>` 还原为目标 URL
fn resolve_result_url(href: &str) -> String {
    let href = href.replace("&amp;", "&");
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.clone()
    };
    Url::parse(&absolute)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(absolute)
}

/// 解析 DuckDuckGo HTML 结果页，最多返回 limit 条
pub fn parse_search_results(html: &str, limit: usize) -> Vec<SearchResult> {
    let link_re = RESULT_LINK_RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap()
    });
    let snippet_re = RESULT_SNIPPET_RE.get_or_init(|| {
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</(?:a|div|td)>"#).unwrap()
    });
    let snippets: Vec<String> = snippet_re
        .captures_iter(html)
        .map(|c| inline_text(&c[1]))
        .collect();
    link_re
        .captures_iter(html)
        .enumerate()
        .filter_map(|(i, c)| {
            let title = inline_text(&c[2]);
            let url = resolve_result_url(&c[1]);
            (!title.is_empty() && !url.is_empty()).then(|| SearchResult {
                title,
                url,
                snippet: snippets.get(i).cloned().unwrap_or_default(),
            })
        })
        .take(limit)
        .collect()
}

/// web_search：DuckDuckGo HTML 搜索（无需 API key）
pub struct WebSearchTool {
    client: Client,
    endpoint: String,
}

impl WebSearchTool {
    pub fn new(web: &WebSection) -> Self {
        Self {
            client: build_client(Duration::from_secs(web.timeout_secs)),
            endpoint: SEARCH_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return the top results (title, url, snippet)"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required("query", ParamType::String, "Search query")]
    }

    async fn invoke(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = required_str(args, "query")?.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments("empty query".to_string()));
        }
        let limit = ctx
            .config
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(MAX_SEARCH_RESULTS);

        let html = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ToolError::Network(format!("Web search failed: {}", e)))?
            .text()
            .await
            .map_err(|e| ToolError::Network(format!("Web search failed: {}", e)))?;

        let results = parse_search_results(&html, limit);
        ctx.span.in_scope(|| tracing::info!(query = %query, count = results.len(), "web search"));
        serde_json::to_value(results).map_err(|e| ToolError::Execution(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"
        <div class="result results_links">
          <h2 class="result__title">
            <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fdoc.rust-lang.org%2Fbook%2F&amp;rut=abc">The Rust <b>Programming</b> Language</a>
          </h2>
          <a class="result__snippet" href="//duckduckgo.com/l/?uddg=x">Learn <b>Rust</b> &amp; have fun.</a>
        </div>
        <div class="result results_links">
          <h2 class="result__title">
            <a rel="nofollow" class="result__a" href="https://crates.io/">crates.io</a>
          </h2>
          <a class="result__snippet" href="https://crates.io/">The Rust package registry</a>
        </div>
    "#;

    #[test]
    fn test_parse_search_results() {
        let results = parse_search_results(RESULTS_PAGE, 5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://doc.rust-lang.org/book/");
        assert!(results[0].title.contains("Programming"));
        assert!(results[0].snippet.contains("have fun"));
        assert_eq!(results[1].url, "https://crates.io/");

        assert_eq!(parse_search_results(RESULTS_PAGE, 1).len(), 1);
    }

    #[test]
    fn test_domain_allow_list() {
        let tool = WebFetchTool::new(&WebSection::default());
        assert!(tool.check_allowed("https://docs.rs/tokio").is_ok());
        assert!(tool.check_allowed("https://DOCS.RS/serde").is_ok());
        assert!(tool.check_allowed("https://evil.example.com/").is_err());
        assert!(tool.check_allowed("ftp://docs.rs/").is_err());
        assert!(tool.check_allowed("not a url").is_err());
    }

    #[test]
    fn test_truncate_chars() {
        let (text, truncated) = truncate_chars("abcdef".to_string(), 3);
        assert_eq!(text, "abc\n...[truncated]");
        assert!(truncated);
        assert!(!truncate_chars("abc".to_string(), 3).1);
    }

    #[tokio::test]
    async fn test_fetch_rejects_unlisted_domain() {
        let tool = WebFetchTool::new(&WebSection::default());
        let mut args = Map::new();
        args.insert("url".into(), json!("https://example.invalid/"));
        let err = tool.invoke(&args, &ToolContext::new(".")).await.unwrap_err();
        assert!(err.to_string().contains("Domain not in allowlist"));
    }
}
