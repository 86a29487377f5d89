//! Web search and page browsing.
//!
//! Search scrapes DuckDuckGo's HTML endpoint (no API key needed); browse
//! fetches each URL with a per-URL timeout and reduces the page to plain
//! text: drop script/style/noscript, turn block tags into newlines, strip
//! the rest, collapse whitespace.

use std::time::Duration;

use scraper::Html;
use scraper::Selector;
use serde::Serialize;
use tracing::debug;

use super::truncate_for_model;
use pilot_protocol::WebSearchKind;
use pilot_protocol::WebSearchRequest;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const MAX_CITATIONS_PER_QUERY: usize = 20;
const BROWSE_TIMEOUT: Duration = Duration::from_secs(15);
/// Character cap per browsed page.
pub const BROWSE_CHAR_CAP: usize = 20_000;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub index: usize,
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

pub fn search_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

/// Run every query, dedupe by (url, title) and return at most
/// `min(limit, 20)` citations per query. A failed query degrades into a
/// single synthetic citation describing the error.
pub async fn web_search(client: &reqwest::Client, request: &WebSearchRequest) -> Vec<Citation> {
    let per_query_limit = request
        .limit
        .unwrap_or(MAX_CITATIONS_PER_QUERY)
        .min(MAX_CITATIONS_PER_QUERY);

    let mut citations: Vec<Citation> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for query in &request.queries {
        let effective_query = match request.kind {
            WebSearchKind::Text => query.clone(),
            // The HTML endpoint has no news vertical; bias the query.
            WebSearchKind::News => format!("{query} news"),
        };
        match run_query(client, &effective_query).await {
            Ok(hits) => {
                let mut taken = 0;
                for hit in hits {
                    if taken == per_query_limit {
                        break;
                    }
                    if !seen.insert((hit.url.clone(), hit.title.clone())) {
                        continue;
                    }
                    taken += 1;
                    citations.push(Citation {
                        index: citations.len() + 1,
                        title: hit.title,
                        url: hit.url,
                        snippet: hit.snippet,
                        source: None,
                        date: None,
                    });
                }
            }
            Err(error) => {
                citations.push(Citation {
                    index: citations.len() + 1,
                    title: format!("search failed: {query}"),
                    url: String::new(),
                    snippet: error,
                    source: Some("error".to_string()),
                    date: None,
                });
            }
        }
    }
    citations
}

struct SearchHit {
    title: String,
    url: String,
    snippet: String,
}

async fn run_query(client: &reqwest::Client, query: &str) -> Result<Vec<SearchHit>, String> {
    let url = format!("{SEARCH_ENDPOINT}?q={}", urlencoding::encode(query));
    debug!("web search: {url}");
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("search returned {}", response.status()));
    }
    let html = response
        .text()
        .await
        .map_err(|e| format!("failed to read response: {e}"))?;
    Ok(parse_search_results(&html))
}

fn parse_search_results(html: &str) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let Ok(result_selector) = Selector::parse(".result") else {
        return Vec::new();
    };
    let Ok(title_selector) = Selector::parse(".result__a") else {
        return Vec::new();
    };
    let Ok(snippet_selector) = Selector::parse(".result__snippet") else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for result in document.select(&result_selector) {
        let Some(anchor) = result.select(&title_selector).next() else {
            continue;
        };
        let title = anchor.text().collect::<String>().trim().to_string();
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let snippet = result
            .select(&snippet_selector)
            .next()
            .map(|node| node.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        hits.push(SearchHit {
            title,
            url: clean_redirect_url(href),
            snippet,
        });
    }
    hits
}

/// DuckDuckGo wraps results in `/l/?uddg=<encoded>` redirects.
fn clean_redirect_url(href: &str) -> String {
    if href.contains("duckduckgo.com/l/") || href.starts_with("//duckduckgo.com/l/") {
        let absolute = if href.starts_with("//") {
            format!("https:{href}")
        } else {
            href.to_string()
        };
        if let Ok(parsed) = url::Url::parse(&absolute)
            && let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg")
        {
            return target.into_owned();
        }
    }
    href.to_string()
}

pub fn format_citations(citations: &[Citation]) -> String {
    let mut out = String::new();
    for citation in citations {
        out.push_str(&format!(
            "[{}] {}\n    {}\n    {}\n",
            citation.index, citation.title, citation.url, citation.snippet
        ));
    }
    out
}

/// Fetch each URL (15 s each) and return title + plain text blocks.
pub async fn web_browse(client: &reqwest::Client, urls: &[String]) -> String {
    let mut out = String::new();
    for url in urls {
        out.push_str(&format!("=== {url} ===\n"));
        match browse_one(client, url).await {
            Ok((title, text)) => {
                if let Some(title) = title {
                    out.push_str(&format!("Title: {title}\n"));
                }
                out.push_str(&truncate_for_model(&text, BROWSE_CHAR_CAP));
                out.push('\n');
            }
            Err(error) => out.push_str(&format!("[error] {error}\n")),
        }
    }
    out
}

async fn browse_one(
    client: &reqwest::Client,
    url: &str,
) -> Result<(Option<String>, String), String> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err("only http:// and https:// URLs are supported".to_string());
    }
    let response = tokio::time::timeout(BROWSE_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| format!("timed out after {}s", BROWSE_TIMEOUT.as_secs()))?
        .map_err(|e| format!("request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("fetch returned {}", response.status()));
    }
    let html = tokio::time::timeout(BROWSE_TIMEOUT, response.text())
        .await
        .map_err(|_| format!("timed out after {}s", BROWSE_TIMEOUT.as_secs()))?
        .map_err(|e| format!("failed to read body: {e}"))?;
    Ok(html_to_text(&html))
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6", "br",
    "section", "article", "header", "footer", "blockquote", "pre",
];

/// Reduce HTML to `(title, text)`.
pub fn html_to_text(html: &str) -> (Option<String>, String) {
    let title = extract_title(html);
    let mut stripped = html.to_string();
    for element in ["script", "style", "noscript", "title"] {
        stripped = remove_element(&stripped, element);
    }

    let mut text = String::with_capacity(stripped.len() / 2);
    let mut rest = stripped.as_str();
    while let Some(open) = rest.find('<') {
        text.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let tag = &rest[open + 1..open + close];
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if BLOCK_TAGS.contains(&name.as_str()) {
            text.push('\n');
        }
        rest = &rest[open + close + 1..];
    }
    text.push_str(rest);

    let decoded = decode_entities(&text);
    (title, collapse_whitespace(&decoded))
}

fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let open_end = lower[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    let title = collapse_whitespace(&decode_entities(&html[open_end..close]));
    if title.is_empty() { None } else { Some(title) }
}

/// Remove `<element ...> ... </element>` pairs, case-insensitively.
fn remove_element(html: &str, element: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let open_tag = format!("<{element}");
    let close_tag = format!("</{element}>");

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(&open_tag).map(|i| cursor + i) {
        out.push_str(&html[cursor..found]);
        match lower[found..].find(&close_tag) {
            Some(end) => cursor = found + end + close_tag.len(),
            None => {
                cursor = html.len();
                break;
            }
        }
    }
    out.push_str(&html[cursor..]);
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let collapsed: Vec<&str> = line.split_whitespace().collect();
        if collapsed.is_empty() {
            continue;
        }
        out.push_str(&collapsed.join(" "));
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn redirect_urls_are_unwrapped() {
        let wrapped = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fdocs&rut=abc";
        assert_eq!(clean_redirect_url(wrapped), "https://example.com/docs");
        assert_eq!(
            clean_redirect_url("https://example.com/direct"),
            "https://example.com/direct"
        );
    }

    #[test]
    fn html_reduces_to_readable_text() {
        let html = "<html><head><title>My  Page</title><style>body{}</style></head>\
                    <body><script>alert(1)</script><h1>Head</h1><p>One &amp; two</p>\
                    <div>three</div></body></html>";
        let (title, text) = html_to_text(html);
        assert_eq!(title.as_deref(), Some("My Page"));
        assert_eq!(text, "Head\nOne & two\nthree");
    }

    #[test]
    fn unclosed_script_is_dropped_to_the_end() {
        let html = "<p>keep</p><script>var x = 1;";
        let (_, text) = html_to_text(html);
        assert_eq!(text, "keep");
    }

    #[test]
    fn empty_results_page_parses_to_nothing() {
        let hits = parse_search_results("<html><body></body></html>");
        assert!(hits.is_empty());
    }

    #[test]
    fn result_markup_is_scraped() {
        let html = r#"<div class="result"><a class="result__a" href="https://example.com/a">Alpha</a>
            <a class="result__snippet">A snippet</a></div>
            <div class="result"><a class="result__a" href="https://example.com/a">Alpha</a></div>"#;
        let hits = parse_search_results(html);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Alpha");
        assert_eq!(hits[0].snippet, "A snippet");
    }

    #[tokio::test]
    async fn failed_query_becomes_a_synthetic_citation() {
        // A 1ms client timeout guarantees the request fails regardless of
        // network availability.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(1))
            .build()
            .expect("client");
        let request = WebSearchRequest {
            queries: vec!["anything".to_string()],
            kind: WebSearchKind::Text,
            limit: Some(5),
        };
        let citations = web_search(&client, &request).await;
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source.as_deref(), Some("error"));
        assert!(citations[0].title.contains("search failed"));
    }
}
