//! The bundled `links` spider: follows every `<a href>` it finds and emits
//! one item per page.

use scraper::{Html, Selector};
use serde::Serialize;
use spider_engine::prelude::*;
use url::Url;

#[derive(Debug, Clone, Serialize)]
pub struct PageItem {
    pub url: String,
    pub status: u16,
    pub title: Option<String>,
    pub links: usize,
}

/// Start URLs come from the `START_URLS` setting.
pub struct LinksSpider;

struct Extracted {
    title: Option<String>,
    links: Vec<Url>,
}

fn extract(html: &str, base: &Url) -> Result<Extracted, SpiderError> {
    let selector = |css: &str| {
        Selector::parse(css)
            .map_err(|e| SpiderError::GeneralError(format!("bad selector '{}': {}", css, e)))
    };
    let document = Html::parse_document(html);
    let title = document
        .select(&selector("title")?)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());
    let links = document
        .select(&selector("a[href]")?)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .collect();
    Ok(Extracted { title, links })
}

#[async_trait]
impl Spider for LinksSpider {
    type Item = PageItem;

    fn name(&self) -> &str {
        "links"
    }

    async fn parse(&self, response: Response) -> Result<ParseOutput<PageItem>, SpiderError> {
        let mut output = ParseOutput::new();
        let is_html = response
            .headers
            .get("content-type")
            .map_or(true, |ct| ct.to_ascii_lowercase().contains("html"));
        let extracted = if is_html {
            extract(&response.text(), &response.url)?
        } else {
            Extracted {
                title: None,
                links: Vec::new(),
            }
        };

        output.add_item(PageItem {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            title: extracted.title,
            links: extracted.links.len(),
        });
        output.add_requests(extracted.links.into_iter().map(|mut url| {
            url.set_fragment(None);
            Request::new(url)
        }));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title_and_absolute_links() {
        let base = Url::parse("http://site.test/dir/page").unwrap();
        let html = r#"<html><head><title> Home </title></head><body>
            <a href="/a">a</a><a href="b#top">b</a><a href="mailto:x@y">m</a><a>none</a>
        </body></html>"#;
        let extracted = extract(html, &base).unwrap();
        assert_eq!(extracted.title.as_deref(), Some("Home"));
        let links: Vec<_> = extracted.links.iter().map(Url::as_str).collect();
        assert_eq!(links, vec!["http://site.test/a", "http://site.test/dir/b#top"]);
    }
}
