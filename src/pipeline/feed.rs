//! Feed exports.
//!
//! Writes every item that reaches this pipeline to a feed in one of four
//! formats. The feed URI may contain `%(name)s` (spider name) and `%(time)s`
//! (UTC start time, `:` replaced by `-`). Supported targets are `stdout:` or
//! `-`, `file://` URIs and plain paths.
//!
//! The target is opened on the first item, so an empty crawl leaves no file
//! behind unless `store_empty` is set. Output is streamed through a buffered
//! writer as items arrive.

use super::Pipeline;
use crate::error::{PipelineError, SpiderError};
use crate::item::ScrapedItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedFormat {
    #[default]
    JsonLines,
    Json,
    Csv,
    Xml,
}

impl FeedFormat {
    /// Formats a resumed crawl can keep appending to.
    fn appendable(self) -> bool {
        matches!(self, FeedFormat::JsonLines | FeedFormat::Csv)
    }
}

impl FromStr for FeedFormat {
    type Err = SpiderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonlines" | "jsonl" | "jl" => Ok(FeedFormat::JsonLines),
            "json" => Ok(FeedFormat::Json),
            "csv" => Ok(FeedFormat::Csv),
            "xml" => Ok(FeedFormat::Xml),
            other => Err(SpiderError::ConfigurationError(format!(
                "unknown feed format '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeedFormat::JsonLines => "jsonlines",
            FeedFormat::Json => "json",
            FeedFormat::Csv => "csv",
            FeedFormat::Xml => "xml",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedSettings {
    pub uri: String,
    pub format: FeedFormat,
    pub store_empty: bool,
    /// Fields to export, in order. Defaults to the fields of the first item.
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FeedTarget {
    Stdout,
    File(PathBuf),
}

/// Expands `%(name)s` and `%(time)s` in a feed URI.
pub fn render_feed_uri(template: &str, spider_name: &str, started: DateTime<Utc>) -> String {
    let time = started
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
        .replace(':', "-");
    template
        .replace("%(name)s", spider_name)
        .replace("%(time)s", &time)
}

fn parse_target(uri: &str) -> Result<FeedTarget, SpiderError> {
    if uri == "-" || uri == "stdout:" || uri.starts_with("stdout:") {
        return Ok(FeedTarget::Stdout);
    }
    if uri.starts_with("file:") {
        let url = Url::parse(uri)?;
        return url.to_file_path().map(FeedTarget::File).map_err(|_| {
            SpiderError::ConfigurationError(format!("feed URI '{}' is not a local path", uri))
        });
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(SpiderError::ConfigurationError(format!(
            "unsupported feed storage scheme '{}'",
            scheme
        )));
    }
    Ok(FeedTarget::File(PathBuf::from(uri)))
}

/// Writes items in one feed format.
struct Exporter {
    format: FeedFormat,
    fields: Option<Vec<String>>,
    header_written: bool,
}

impl Exporter {
    fn start(&mut self, out: &mut dyn Write) -> io::Result<()> {
        match self.format {
            FeedFormat::Json => out.write_all(b"["),
            FeedFormat::Xml => out.write_all(b"<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<items>"),
            FeedFormat::JsonLines | FeedFormat::Csv => Ok(()),
        }
    }

    fn export(&mut self, out: &mut dyn Write, item: &Value, index: usize) -> Result<(), PipelineError> {
        match self.format {
            FeedFormat::JsonLines => {
                serde_json::to_writer(&mut *out, item)?;
                out.write_all(b"\n")?;
            }
            FeedFormat::Json => {
                out.write_all(if index == 0 { b"\n" } else { b",\n" })?;
                serde_json::to_writer(&mut *out, item)?;
            }
            FeedFormat::Csv => {
                let fields = self.fields.get_or_insert_with(|| field_names(item));
                if !self.header_written {
                    write_csv_row(out, fields.iter().map(|f| f.as_str().into()))?;
                    self.header_written = true;
                }
                let row = fields.iter().map(|field| match item {
                    Value::Object(map) => csv_cell(map.get(field).unwrap_or(&Value::Null)),
                    other if field == "value" => csv_cell(other),
                    _ => String::new(),
                });
                write_csv_row(out, row)?;
            }
            FeedFormat::Xml => {
                out.write_all(b"\n  <item>")?;
                match item {
                    Value::Object(map) => {
                        let selected: Vec<(&str, &Value)> = match &self.fields {
                            Some(fields) => fields
                                .iter()
                                .filter_map(|f| map.get(f).map(|v| (f.as_str(), v)))
                                .collect(),
                            None => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
                        };
                        for (name, value) in selected {
                            write_xml_element(out, name, value)?;
                        }
                    }
                    other => write_xml_element(out, "value", other)?,
                }
                out.write_all(b"</item>")?;
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut dyn Write, items: usize) -> io::Result<()> {
        match self.format {
            FeedFormat::Json if items > 0 => out.write_all(b"\n]\n"),
            FeedFormat::Json => out.write_all(b"]\n"),
            FeedFormat::Xml if items > 0 => out.write_all(b"\n</items>\n"),
            FeedFormat::Xml => out.write_all(b"</items>\n"),
            FeedFormat::JsonLines | FeedFormat::Csv => Ok(()),
        }
    }
}

fn field_names(item: &Value) -> Vec<String> {
    match item {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => vec!["value".to_string()],
    }
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_csv_row<I>(out: &mut dyn Write, cells: I) -> io::Result<()>
where
    I: IntoIterator<Item = String>,
{
    let line = cells
        .into_iter()
        .map(|cell| {
            if cell.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Maps an item field name to a well-formed XML element name.
fn xml_element_name(field: &str) -> String {
    let mut name: String = field
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

fn write_xml_element(out: &mut dyn Write, field: &str, value: &Value) -> io::Result<()> {
    let name = xml_element_name(field);
    write!(out, "<{}>", name)?;
    match value {
        Value::Null => {}
        Value::String(s) => out.write_all(xml_escape(s).as_bytes())?,
        Value::Array(values) => {
            for v in values {
                write_xml_element(out, "value", v)?;
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                write_xml_element(out, k, v)?;
            }
        }
        other => out.write_all(other.to_string().as_bytes())?,
    }
    write!(out, "</{}>", name)
}

struct FeedSlot {
    writer: Option<Box<dyn Write + Send>>,
    exporter: Exporter,
    items: usize,
    /// Items already in an appendable file from a previous run.
    resumed_items: usize,
}

pub struct FeedExportPipeline<I> {
    uri: String,
    target: FeedTarget,
    format: FeedFormat,
    store_empty: bool,
    slot: Mutex<FeedSlot>,
    _item: PhantomData<fn(I)>,
}

impl<I: ScrapedItem> FeedExportPipeline<I> {
    pub fn new(settings: FeedSettings, spider_name: &str) -> Result<Self, SpiderError> {
        Self::with_start_time(settings, spider_name, Utc::now())
    }

    pub fn with_start_time(
        settings: FeedSettings,
        spider_name: &str,
        started: DateTime<Utc>,
    ) -> Result<Self, SpiderError> {
        if settings.uri.trim().is_empty() {
            return Err(SpiderError::ConfigurationError("FEED_URI is empty".into()));
        }
        let uri = render_feed_uri(settings.uri.trim(), spider_name, started);
        let target = parse_target(&uri)?;
        debug!("Feed export to {} as {}", uri, settings.format);
        Ok(FeedExportPipeline {
            uri,
            target,
            format: settings.format,
            store_empty: settings.store_empty,
            slot: Mutex::new(FeedSlot {
                writer: None,
                exporter: Exporter {
                    format: settings.format,
                    fields: settings.fields,
                    header_written: false,
                },
                items: 0,
                resumed_items: 0,
            }),
            _item: PhantomData,
        })
    }

    /// The URI after templating.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn item_count(&self) -> usize {
        self.slot.lock().items
    }

    fn open(&self, slot: &mut FeedSlot) -> Result<(), PipelineError> {
        let writer: Box<dyn Write + Send> = match &self.target {
            FeedTarget::Stdout => Box::new(BufWriter::new(io::stdout())),
            FeedTarget::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let resume = slot.resumed_items > 0 && self.format.appendable() && path.exists();
                if slot.resumed_items > 0 && !resume {
                    warn!(
                        "Cannot append {} feed {:?}; it will be rewritten from scratch",
                        self.format, path
                    );
                    slot.resumed_items = 0;
                }
                let file = if resume {
                    OpenOptions::new().append(true).open(path)?
                } else {
                    File::create(path)?
                };
                Box::new(BufWriter::new(file))
            }
        };
        slot.writer = Some(writer);
        if slot.resumed_items > 0 {
            slot.items = slot.resumed_items;
            slot.exporter.header_written = true;
            info!("Appending to feed {} after {} items", self.uri, slot.items);
            return Ok(());
        }
        if let Some(writer) = slot.writer.as_mut() {
            slot.exporter.start(writer.as_mut())?;
        }
        Ok(())
    }
}

#[async_trait]
impl<I: ScrapedItem> Pipeline<I> for FeedExportPipeline<I> {
    fn name(&self) -> &str {
        "FeedExportPipeline"
    }

    async fn process_item(&self, item: I) -> Result<Option<I>, PipelineError> {
        let value = serde_json::to_value(&item)?;
        let mut slot = self.slot.lock();
        if slot.writer.is_none() {
            self.open(&mut slot)?;
        }
        let index = slot.items;
        let FeedSlot { writer, exporter, .. } = &mut *slot;
        if let Some(writer) = writer.as_mut() {
            exporter.export(writer.as_mut(), &value, index)?;
        }
        slot.items += 1;
        Ok(Some(item))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        let mut slot = self.slot.lock();
        if slot.writer.is_none() {
            if !self.store_empty {
                info!("No items scraped; {} feed not stored in {}", self.format, self.uri);
                return Ok(());
            }
            self.open(&mut slot)?;
        }
        let items = slot.items;
        let FeedSlot { writer, exporter, .. } = &mut *slot;
        if let Some(mut writer) = writer.take() {
            exporter.finish(writer.as_mut(), items)?;
            writer.flush()?;
        }
        info!("Stored {} feed ({} items) in: {}", self.format, items, self.uri);
        Ok(())
    }

    async fn get_state(&self) -> Result<Option<Value>, SpiderError> {
        let slot = self.slot.lock();
        Ok(Some(json!({ "uri": self.uri, "items": slot.items })))
    }

    async fn restore_state(&self, state: Value) -> Result<(), SpiderError> {
        let same_target = state.get("uri").and_then(Value::as_str) == Some(self.uri.as_str());
        let items = state.get("items").and_then(Value::as_u64).unwrap_or(0) as usize;
        if same_target && items > 0 {
            self.slot.lock().resumed_items = items;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize)]
    struct Quote {
        text: String,
        author: String,
        tags: Vec<String>,
    }

    fn quote(text: &str, author: &str) -> Quote {
        Quote {
            text: text.into(),
            author: author.into(),
            tags: vec!["a".into(), "b".into()],
        }
    }

    fn pipeline(dir: &tempfile::TempDir, name: &str, format: FeedFormat) -> (FeedExportPipeline<Quote>, PathBuf) {
        let path = dir.path().join(name);
        let settings = FeedSettings {
            uri: path.to_string_lossy().into_owned(),
            format,
            ..Default::default()
        };
        (FeedExportPipeline::new(settings, "quotes").unwrap(), path)
    }

    async fn export(p: &FeedExportPipeline<Quote>, quotes: Vec<Quote>) {
        for q in quotes {
            p.process_item(q).await.unwrap();
        }
        p.close().await.unwrap();
    }

    #[test]
    fn uri_templating() {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        assert_eq!(
            render_feed_uri("out/%(name)s-%(time)s.json", "books", started),
            "out/books-2024-05-01T12-30-05.json"
        );
    }

    #[test]
    fn targets() {
        assert_eq!(parse_target("-").unwrap(), FeedTarget::Stdout);
        assert_eq!(parse_target("stdout:").unwrap(), FeedTarget::Stdout);
        assert_eq!(
            parse_target("file:///tmp/feed.jl").unwrap(),
            FeedTarget::File(PathBuf::from("/tmp/feed.jl"))
        );
        assert!(matches!(
            parse_target("s3://bucket/key"),
            Err(SpiderError::ConfigurationError(_))
        ));
        assert!("yaml".parse::<FeedFormat>().is_err());
        assert_eq!("JL".parse::<FeedFormat>().unwrap(), FeedFormat::JsonLines);
    }

    #[tokio::test]
    async fn json_lines_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let (jl, jl_path) = pipeline(&dir, "q.jl", FeedFormat::JsonLines);
        export(&jl, vec![quote("x", "A"), quote("y", "B")]).await;
        let lines: Vec<Value> = fs::read_to_string(&jl_path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["author"], "B");

        let (json, json_path) = pipeline(&dir, "q.json", FeedFormat::Json);
        export(&json, vec![quote("x", "A"), quote("y", "B")]).await;
        let parsed: Vec<Value> = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["tags"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn csv_quotes_and_orders_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (csv, path) = pipeline(&dir, "q.csv", FeedFormat::Csv);
        export(&csv, vec![quote("hello, \"world\"", "A")]).await;
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "text,author,tags\n\"hello, \"\"world\"\"\",A,\"[\"\"a\"\",\"\"b\"\"]\"\n"
        );
    }

    #[test]
    fn xml_field_names_are_made_well_formed() {
        assert_eq!(xml_element_name("title"), "title");
        assert_eq!(xml_element_name("unit price"), "unit_price");
        assert_eq!(xml_element_name("2nd"), "_2nd");
        assert_eq!(xml_element_name(""), "_");
        assert_eq!(xml_element_name("a<b>"), "a_b_");

        let mut out = Vec::new();
        write_xml_element(&mut out, "1 tag", &json!({"x y": 1})).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "<_1_tag><x_y>1</x_y></_1_tag>");
    }

    #[tokio::test]
    async fn xml_escapes_text() {
        let dir = tempfile::tempdir().unwrap();
        let (xml, path) = pipeline(&dir, "q.xml", FeedFormat::Xml);
        export(&xml, vec![quote("1 < 2 & 3", "A")]).await;
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<items>"));
        assert!(text.contains("<text>1 &lt; 2 &amp; 3</text>"));
        assert!(text.contains("<tags><value>a</value><value>b</value></tags>"));
        assert!(text.ends_with("</items>\n"));
    }

    #[tokio::test]
    async fn empty_feed_is_not_stored_unless_asked() {
        let dir = tempfile::tempdir().unwrap();
        let (feed, path) = pipeline(&dir, "empty.json", FeedFormat::Json);
        feed.close().await.unwrap();
        assert!(!path.exists());

        let settings = FeedSettings {
            uri: path.to_string_lossy().into_owned(),
            format: FeedFormat::Json,
            store_empty: true,
            fields: None,
        };
        let feed = FeedExportPipeline::<Quote>::new(settings, "quotes").unwrap();
        feed.close().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[]\n");
    }

    #[tokio::test]
    async fn resumed_json_lines_feed_appends() {
        let dir = tempfile::tempdir().unwrap();
        let (first, path) = pipeline(&dir, "q.jl", FeedFormat::JsonLines);
        export(&first, vec![quote("x", "A")]).await;
        let state = first.get_state().await.unwrap().unwrap();

        let (second, _) = pipeline(&dir, "q.jl", FeedFormat::JsonLines);
        second.restore_state(state).await.unwrap();
        export(&second, vec![quote("y", "B")]).await;

        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        assert_eq!(second.item_count(), 2);
    }
}
