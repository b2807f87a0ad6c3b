use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ScraperSettings;
use crate::download::read_body_capped;
use crate::models::{ImageDescriptor, Scope};

// ── Constants ────────────────────────────────────────────────────────────────

/// Content regions tried, in order, for article-scoped extraction.
const ARTICLE_SELECTORS: &[&str] = &[
    "article",
    ".article-content",
    ".post-content",
    ".entry-content",
    "#content",
    "main",
];

const CAPTION_SIBLING_TAGS: &[&str] = &["p", "div", "span"];

// ── Lazy statics ─────────────────────────────────────────────────────────────

static IMG_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static FIGCAPTION_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("figcaption").unwrap());

static ARTICLE_SELS: Lazy<Vec<(&'static str, Selector)>> = Lazy::new(|| {
    ARTICLE_SELECTORS
        .iter()
        .map(|s| (*s, Selector::parse(s).unwrap()))
        .collect()
});

static SVG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.svg").unwrap());

static CAPTION_CLASS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)caption").unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("URL did not return HTML")]
    NotHtml,
    #[error("Upstream returned an error")]
    Upstream,
    #[error("{0}")]
    Request(String),
}

// ── Page fetcher ─────────────────────────────────────────────────────────────

/// Fetches pages and turns them into image descriptors.
pub struct PageFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl PageFetcher {
    pub fn new(settings: &ScraperSettings) -> Result<Self, ExtractionError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.9"),
        );

        let mut builder = reqwest::ClientBuilder::new()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(settings.timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(settings.user_agent.as_str())
            .default_headers(headers);

        if settings.insecure_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ExtractionError::Request(e.to_string()))?;

        Ok(Self {
            client,
            max_bytes: settings.max_bytes,
        })
    }

    /// Fetch `url` and extract its images for the given scope.
    pub async fn scrape_images(
        &self,
        url: &str,
        scope: Scope,
    ) -> Result<Vec<ImageDescriptor>, ExtractionError> {
        let base = validate_url(url)?;
        info!(url = %base, ?scope, "scraping images");
        let html = self.fetch_html(base.as_str()).await?;
        Ok(extract_images(&html, &base, scope))
    }

    /// Page `<title>`, or an empty string if anything goes wrong.
    pub async fn page_title(&self, url: &str) -> String {
        let result = match validate_url(url) {
            Ok(base) => self.fetch_html(base.as_str()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(html) => extract_title(&html),
            Err(e) => {
                warn!(url, error = %e, "page title unavailable");
                String::new()
            }
        }
    }

    pub async fn fetch_html(&self, url: &str) -> Result<String, ExtractionError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractionError::Request(format!("TimeoutError: {}", e))
            } else if e.is_connect() {
                ExtractionError::Request(format!("ConnectError: {}", e))
            } else {
                ExtractionError::Request(format!("RequestError: {}", e))
            }
        })?;

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "page fetch rejected");
            return Err(ExtractionError::Upstream);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        // A missing header is tolerated; an explicit non-HTML type is not.
        if !content_type.is_empty() && !content_type.contains("html") {
            return Err(ExtractionError::NotHtml);
        }

        let body = read_body_capped(response, self.max_bytes)
            .await
            .map_err(|e| ExtractionError::Request(e.to_string()))?;
        let html = String::from_utf8_lossy(&body).into_owned();
        debug!(url, bytes = html.len(), "page fetched");
        Ok(html)
    }
}

// ── URL validation ───────────────────────────────────────────────────────────

pub fn validate_url(url: &str) -> Result<Url, ExtractionError> {
    let parsed = Url::parse(url.trim())
        .map_err(|_| ExtractionError::InvalidUrl("Invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ExtractionError::InvalidUrl(
            "Only http and https URLs are allowed".to_string(),
        ));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ExtractionError::InvalidUrl("URL has no host".to_string()));
    }
    Ok(parsed)
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Collect image descriptors from `html` in document order.
///
/// Every `<img>` in the scanned region consumes a sequence index, including
/// the ones that are skipped for lacking a source or filtered out as SVG,
/// data URI or non-http. Indices of survivors therefore stay stable no matter
/// which neighbours are dropped.
pub fn extract_images(html: &str, base_url: &Url, scope: Scope) -> Vec<ImageDescriptor> {
    let document = Html::parse_document(html);

    let region = match scope {
        Scope::Page => document.root_element(),
        Scope::Article => find_article_region(&document),
    };

    let mut images = Vec::new();
    let mut seen = 0usize;

    for img in region.select(&IMG_SEL) {
        seen += 1;
        let sequence_index = seen;

        let raw = match pick_img_source(img) {
            Some(raw) => raw,
            None => {
                debug!(sequence_index, "img without source skipped");
                continue;
            }
        };

        let url = match resolve_image_url(raw, base_url) {
            Some(url) => url,
            None => continue,
        };

        let nearby_caption = match scope {
            Scope::Article => find_nearby_caption(img),
            Scope::Page => String::new(),
        };

        images.push(ImageDescriptor {
            url,
            alt_text: attr_text(img, "alt"),
            title: attr_text(img, "title"),
            nearby_caption,
            sequence_index,
        });
    }

    info!(found = seen, kept = images.len(), "image elements extracted");
    images
}

/// Trimmed, whitespace-collapsed `<title>` text.
pub fn extract_title(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .select(&TITLE_SEL)
        .next()
        .map(|el| normalize_text(collect_text(el)))
        .unwrap_or_default()
}

fn find_article_region(document: &Html) -> ElementRef<'_> {
    for (name, sel) in ARTICLE_SELS.iter() {
        if let Some(el) = document.select(sel).next() {
            info!(selector = *name, "article content found");
            return el;
        }
    }
    warn!("no article content found, using entire page");
    document.root_element()
}

// ── Image helpers ────────────────────────────────────────────────────────────

/// Priority: src → data-src → first candidate of srcset.
fn pick_img_source<'a>(el: ElementRef<'a>) -> Option<&'a str> {
    let v = el.value();
    ["src", "data-src"]
        .iter()
        .filter_map(|a| v.attr(a))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .or_else(|| v.attr("srcset").and_then(first_src_from_srcset))
}

fn first_src_from_srcset(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .next()
        .and_then(|candidate| candidate.split_whitespace().next())
}

/// Absolute http(s) URL for `raw`, or `None` when the reference must be
/// excluded.
fn resolve_image_url(raw: &str, base_url: &Url) -> Option<String> {
    if raw.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("data:")) {
        debug!("data URI skipped");
        return None;
    }

    // Absolute http(s) references are kept byte-for-byte; only relative and
    // protocol-relative ones are rebuilt.
    let url = match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => raw.to_string(),
        Ok(url) => {
            debug!(scheme = url.scheme(), "non-http image URL skipped");
            return None;
        }
        Err(_) => {
            let resolved = if raw.starts_with("//") {
                Url::parse(&format!("https:{}", raw))
            } else {
                base_url.join(raw)
            };
            match resolved {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url.to_string(),
                Ok(url) => {
                    debug!(url = %url, "non-http image URL skipped");
                    return None;
                }
                Err(e) => {
                    debug!(raw, error = %e, "unresolvable image URL skipped");
                    return None;
                }
            }
        }
    };

    if SVG_RE.is_match(&url) {
        debug!(url = %url, "SVG skipped");
        return None;
    }

    Some(url)
}

/// Caption text next to an article image: the enclosing `<figure>`'s
/// `<figcaption>` first, then a following sibling with a caption class.
fn find_nearby_caption(img: ElementRef<'_>) -> String {
    let figure = img
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "figure");

    if let Some(figure) = figure {
        if let Some(fc) = figure.select(&FIGCAPTION_SEL).next() {
            let text = normalize_text(collect_text(fc));
            if !text.is_empty() {
                return text;
            }
        }
    }

    let sibling = img.next_siblings().find_map(ElementRef::wrap);
    if let Some(sib) = sibling {
        let tag_ok = CAPTION_SIBLING_TAGS.contains(&sib.value().name());
        let class_ok = sib.value().classes().any(|c| CAPTION_CLASS_RE.is_match(c));
        if tag_ok && class_ok {
            return normalize_text(collect_text(sib));
        }
    }

    String::new()
}

fn attr_text(el: ElementRef<'_>, name: &str) -> String {
    el.value()
        .attr(name)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

/// Recursively collect all text from an element and its descendants.
fn collect_text(el: ElementRef<'_>) -> String {
    use scraper::node::Node;
    let mut parts = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => parts.push((&*text.text).to_string()),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    parts.push(collect_text(child_el));
                }
            }
            _ => {}
        }
    }
    parts.join("")
}

/// Collapse runs of whitespace and trim.
fn normalize_text(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base() -> Url {
        Url::parse("https://example.com/page").unwrap()
    }

    fn settings() -> ScraperSettings {
        ScraperSettings {
            timeout_secs: 5,
            user_agent: crate::config::BROWSER_USER_AGENT.to_string(),
            insecure_ssl: false,
            max_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn root_relative_src_resolves_against_base() {
        let html = r#"<html><body><img src="/logo.png" alt="Logo"></body></html>"#;
        let images = extract_images(html, &base(), Scope::Page);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "https://example.com/logo.png");
        assert_eq!(images[0].alt_text, "Logo");
        assert_eq!(images[0].sequence_index, 1);
    }

    #[test]
    fn svg_images_are_dropped() {
        let html = r#"<img src="pic.svg"><img src="/icons/sprite.SVG#a"><img src="/x.svgz">"#;
        assert!(extract_images(html, &base(), Scope::Page).is_empty());
    }

    #[test]
    fn data_uris_and_non_http_schemes_are_dropped() {
        let html = r#"
            <img src="data:image/png;base64,iVBORw0KGgo=">
            <img src="DATA:image/gif;base64,R0lGOD">
            <img src="javascript:void(0)">
            <img src="ftp://example.com/a.png">
        "#;
        assert!(extract_images(html, &base(), Scope::Page).is_empty());
    }

    #[test]
    fn url_forms_resolve() {
        let html = r#"
            <img src="//cdn.example.net/a.jpg">
            <img src="img/b.jpg">
            <img src="http://other.org/c.jpg">
        "#;
        let urls: Vec<_> = extract_images(html, &base(), Scope::Page)
            .into_iter()
            .map(|d| d.url)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.example.net/a.jpg",
                "https://example.com/img/b.jpg",
                "http://other.org/c.jpg",
            ]
        );
    }

    #[test]
    fn absolute_urls_pass_through_unchanged() {
        let html = r#"
            <img src="https://CDN.Example.com/Photos/a%20b.JPG?w=640&amp;h=480">
            <img src="http://example.org">
        "#;
        let urls: Vec<_> = extract_images(html, &base(), Scope::Page)
            .into_iter()
            .map(|d| d.url)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://CDN.Example.com/Photos/a%20b.JPG?w=640&h=480",
                "http://example.org",
            ]
        );
    }

    #[test]
    fn source_priority_is_src_then_data_src_then_srcset() {
        let html = r#"
            <img src="/a.jpg" data-src="/ignored.jpg">
            <img src="" data-src="/b.jpg">
            <img srcset="/c-small.jpg 480w, /c-large.jpg 1080w">
            <img alt="no source at all">
        "#;
        let images = extract_images(html, &base(), Scope::Page);
        let urls: Vec<_> = images.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/a.jpg",
                "https://example.com/b.jpg",
                "https://example.com/c-small.jpg",
            ]
        );
    }

    #[test]
    fn filtered_elements_still_consume_an_index() {
        let html = r#"
            <img src="/one.png">
            <img src="/two.svg">
            <img>
            <img src="data:image/png;base64,AAAA">
            <img src="/five.png">
        "#;
        let indices: Vec<_> = extract_images(html, &base(), Scope::Page)
            .iter()
            .map(|d| d.sequence_index)
            .collect();
        assert_eq!(indices, vec![1, 5]);
    }

    #[test]
    fn page_scope_leaves_nearby_caption_empty() {
        let html = r#"<figure><img src="/a.png"><figcaption>Hello</figcaption></figure>"#;
        let images = extract_images(html, &base(), Scope::Page);
        assert_eq!(images[0].nearby_caption, "");
    }

    #[test]
    fn article_scope_uses_first_matching_selector() {
        let html = r#"
            <body>
              <img src="/header.png">
              <main><img src="/main.png"></main>
              <div class="post-content"><img src="/post.png"><img src="/post2.png"></div>
            </body>
        "#;
        let images = extract_images(html, &base(), Scope::Article);
        let urls: Vec<_> = images.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://example.com/post.png", "https://example.com/post2.png"]
        );
        assert_eq!(images[0].sequence_index, 1);
        assert_eq!(images[1].sequence_index, 2);
    }

    #[test]
    fn article_scope_falls_back_to_whole_page() {
        let html = r#"<body><div><img src="/a.png"></div><img src="/b.png"></body>"#;
        let images = extract_images(html, &base(), Scope::Article);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn article_captions_from_figure_and_sibling() {
        let html = r#"
            <article>
              <figure>
                <a href="/full"><img src="/fig.png"></a>
                <figcaption>  A   figure caption </figcaption>
              </figure>
              <div>
                <img src="/sib.png"><p class="wp-caption-text">Sibling caption</p>
              </div>
              <div><img src="/none.png"><p class="lead">Not a caption</p></div>
            </article>
        "#;
        let images = extract_images(html, &base(), Scope::Article);
        let captions: Vec<_> = images.iter().map(|d| d.nearby_caption.as_str()).collect();
        assert_eq!(captions, vec!["A figure caption", "Sibling caption", ""]);
    }

    #[test]
    fn every_emitted_url_is_absolute_http() {
        let html = r#"
            <img src="a.png"><img src="../b.png"><img src="?c=1"><img src="mailto:x@y.z">
            <img src="https://example.com/d.png"><img src="//e.org/e.png">
        "#;
        let images = extract_images(html, &base(), Scope::Page);
        assert_eq!(images.len(), 5);
        let mut last = 0;
        for image in &images {
            let url = Url::parse(&image.url).unwrap();
            assert!(matches!(url.scheme(), "http" | "https"));
            assert!(image.sequence_index > last);
            last = image.sequence_index;
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let html = r#"<article><img src="/a.png" title="A"><img src="/b.jpg"></article>"#;
        let first = extract_images(html, &base(), Scope::Article);
        let second = extract_images(html, &base(), Scope::Article);
        assert_eq!(first, second);
        assert_eq!(first[0].title, "A");
    }

    #[test]
    fn title_is_trimmed() {
        let html = "<html><head><title>\n  My   Page \n</title></head></html>";
        assert_eq!(extract_title(html), "My Page");
        assert_eq!(extract_title("<html><body></body></html>"), "");
    }

    #[test]
    fn validate_url_rejects_bad_input() {
        assert!(matches!(
            validate_url("not a url"),
            Err(ExtractionError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://example.com/"),
            Err(ExtractionError::InvalidUrl(_))
        ));
        assert!(validate_url("http://example.com/").is_ok());
    }

    #[tokio::test]
    async fn scrape_images_fetches_and_extracts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"<html><body><img src="/photo.jpg" alt="Photo"></body></html>"#,
                "text/html; charset=utf-8",
            ))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&settings()).unwrap();
        let url = format!("{}/article", server.uri());
        let images = fetcher.scrape_images(&url, Scope::Page).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, format!("{}/photo.jpg", server.uri()));
    }

    #[tokio::test]
    async fn oversized_pages_are_rejected() {
        let server = MockServer::start().await;
        let page = format!("<html><body>{}</body></html>", "x".repeat(4096));
        Mock::given(method("GET"))
            .and(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(page, "text/html"))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&ScraperSettings {
            max_bytes: 1024,
            ..settings()
        })
        .unwrap();
        let err = fetcher
            .fetch_html(&format!("{}/huge", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Request(ref msg) if msg.contains("exceeds 1024 bytes")));
    }

    #[tokio::test]
    async fn upstream_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&settings()).unwrap();
        let missing = fetcher
            .scrape_images(&format!("{}/missing", server.uri()), Scope::Page)
            .await;
        assert!(matches!(missing, Err(ExtractionError::Upstream)));

        let json = fetcher
            .scrape_images(&format!("{}/json", server.uri()), Scope::Page)
            .await;
        assert!(matches!(json, Err(ExtractionError::NotHtml)));
    }

    #[tokio::test]
    async fn page_title_degrades_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<title>Hello</title>", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = PageFetcher::new(&settings()).unwrap();
        assert_eq!(fetcher.page_title(&format!("{}/ok", server.uri())).await, "Hello");
        assert_eq!(fetcher.page_title(&format!("{}/down", server.uri())).await, "");
        assert_eq!(fetcher.page_title("nonsense").await, "");
    }
}
