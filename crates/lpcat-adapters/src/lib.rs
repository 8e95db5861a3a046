//! Collaborator contracts + fixture-first implementations: record streams, the fetch
//! collaborator and the page annotator.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lpcat_core::{
    is_redirect_status, CatalogueRecord, EvidenceRef, FetchResult, Field, NormalizedKey,
    PageAnnotation, RawUrlRecord, Scalar, SourceId, ATTR_BUSINESS_STATUS, ATTR_CATEGORY,
    ATTR_EXTERNAL_ID, ATTR_PROPERTY, ATTR_SESSION_COUNT, ATTR_UPDATED_AT, ATTR_VERTICAL,
};
use lpcat_reconcile::Reconciler;
use scraper::{Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "lpcat-adapters";

/// Rows inspected when guessing which CSV column holds the URL.
pub const URL_COLUMN_SAMPLE_ROWS: usize = 200;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("no column with http(s) URLs found in {0}")]
    NoUrlColumn(PathBuf),
    #[error("annotator failed for {url}: {message}")]
    Annotation { url: String, message: String },
    #[error("stream {stream}: {kind} records cannot be read from {format:?}")]
    UnsupportedFormat {
        stream: String,
        kind: SourceId,
        format: StreamFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    Json,
    Csv,
}

/// One entry of the stream registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub id: String,
    pub source: SourceId,
    pub format: StreamFormat,
    pub path: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StreamSpec {
    pub fn extension(&self) -> &'static str {
        match self.format {
            StreamFormat::Json => "json",
            StreamFormat::Csv => "csv",
        }
    }
}

/// Expands warehouse page paths into full URLs based on the reporting property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathExpansion {
    /// Lower-cased property-name fragment -> host. First match in key order wins.
    pub property_hosts: BTreeMap<String, String>,
    pub default_host: String,
}

impl Default for PathExpansion {
    fn default() -> Self {
        Self {
            property_hosts: BTreeMap::new(),
            default_host: "www.forbes.com".to_string(),
        }
    }
}

impl PathExpansion {
    pub fn host_for(&self, property: Option<&str>) -> &str {
        let property = property.unwrap_or_default().to_ascii_lowercase();
        self.property_hosts
            .iter()
            .find(|(fragment, _)| !fragment.is_empty() && property.contains(fragment.as_str()))
            .map(|(_, host)| host.as_str())
            .unwrap_or(self.default_host.as_str())
    }

    /// Full URLs pass through untouched.
    pub fn expand(&self, path_or_url: &str, property: Option<&str>) -> String {
        let trimmed = path_or_url.trim();
        if trimmed.contains("://") {
            return trimmed.to_string();
        }
        let host = self.host_for(property);
        if trimmed.starts_with('/') {
            format!("https://{host}{trimmed}")
        } else {
            format!("https://{host}/{trimmed}")
        }
    }
}

/// Category -> vertical lookup used when the source of record leaves vertical blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerticalMap(BTreeMap<String, String>);

impl VerticalMap {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn vertical_for(&self, category: &str) -> Option<&str> {
        let category = category.trim();
        self.0
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(category))
            .map(|(_, vertical)| vertical.as_str())
    }

    pub fn fill(&self, record: &mut RawUrlRecord) {
        if record.attr(ATTR_VERTICAL).is_some() {
            return;
        }
        let Some(vertical) = record.text_attr(ATTR_CATEGORY).and_then(|c| self.vertical_for(c)) else {
            return;
        };
        let vertical = vertical.to_string();
        record.attributes.insert(ATTR_VERTICAL.to_string(), Scalar::Text(vertical));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub path_expansion: PathExpansion,
    pub vertical_map: VerticalMap,
}

#[async_trait]
pub trait RecordStream: Send + Sync {
    fn id(&self) -> &str;
    fn source(&self) -> SourceId;
    fn path(&self) -> &Path;
    async fn load(&self) -> Result<Vec<RawUrlRecord>, AdapterError>;
}

/// Build the stream implementation for a registry entry. Paths resolve against `root`.
///
/// Only the source of record has a spreadsheet export; a CSV entry for any other
/// source is rejected rather than read with the wrong parser.
pub fn open_stream(
    spec: &StreamSpec,
    root: &Path,
    options: &StreamOptions,
) -> Result<Box<dyn RecordStream>, AdapterError> {
    let path = if spec.path.is_absolute() {
        spec.path.clone()
    } else {
        root.join(&spec.path)
    };
    let id = spec.id.clone();
    let stream: Box<dyn RecordStream> = match (spec.source, spec.format) {
        (SourceId::SourceOfRecord, StreamFormat::Json) => Box::new(SourceOfRecordJsonStream {
            id,
            source: SourceId::SourceOfRecord,
            path,
            vertical_map: options.vertical_map.clone(),
        }),
        (SourceId::SourceOfRecord, StreamFormat::Csv) => Box::new(CsvSheetStream {
            id,
            source: SourceId::SourceOfRecord,
            path,
            vertical_map: options.vertical_map.clone(),
        }),
        (SourceId::Warehouse, StreamFormat::Json) => Box::new(WarehouseJsonStream {
            id,
            path,
            expansion: options.path_expansion.clone(),
        }),
        (SourceId::Crawl, StreamFormat::Json) => Box::new(CrawlUpdateJsonStream { id, path }),
        (kind, format) => {
            return Err(AdapterError::UnsupportedFormat {
                stream: id,
                kind,
                format,
            })
        }
    };
    Ok(stream)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, AdapterError> {
    tokio::fs::read(path).await.map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, AdapterError> {
    let raw = read_file(path).await?;
    serde_json::from_slice(&raw).map_err(|err| AdapterError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOfRecordBundle {
    pub stream_id: String,
    pub exported_at: DateTime<Utc>,
    pub rows: Vec<SourceOfRecordRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOfRecordRow {
    pub url: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub business_status: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub vertical: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Scalar>,
}

impl SourceOfRecordRow {
    fn into_record(self, source: SourceId) -> RawUrlRecord {
        let mut record = RawUrlRecord::new(source, self.url);
        record.attributes = self.extra;
        record
            .with_attr(ATTR_EXTERNAL_ID, self.external_id)
            .with_attr(ATTR_BUSINESS_STATUS, self.business_status)
            .with_attr(ATTR_CATEGORY, self.category)
            .with_attr(ATTR_VERTICAL, self.vertical)
    }
}

#[derive(Debug, Clone)]
pub struct SourceOfRecordJsonStream {
    id: String,
    source: SourceId,
    path: PathBuf,
    vertical_map: VerticalMap,
}

#[async_trait]
impl RecordStream for SourceOfRecordJsonStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> SourceId {
        self.source
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawUrlRecord>, AdapterError> {
        let bundle: SourceOfRecordBundle = read_json_file(&self.path).await?;
        debug!(stream = %self.id, rows = bundle.rows.len(), "loaded source-of-record bundle");
        Ok(bundle
            .rows
            .into_iter()
            .map(|row| {
                let mut record = row.into_record(self.source);
                self.vertical_map.fill(&mut record);
                record
            })
            .collect())
    }
}

/// Spreadsheet export of the source of record. Column names become attribute names.
#[derive(Debug, Clone)]
pub struct CsvSheetStream {
    id: String,
    source: SourceId,
    path: PathBuf,
    vertical_map: VerticalMap,
}

fn attribute_name(header: &str) -> String {
    let snake = header
        .trim()
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    match snake.as_str() {
        "status" | "page_status" => ATTR_BUSINESS_STATUS.to_string(),
        "id" | "record_id" => ATTR_EXTERNAL_ID.to_string(),
        _ => snake,
    }
}

fn looks_like_url(cell: &str) -> bool {
    let cell = cell.trim().trim_matches('"').to_ascii_lowercase();
    cell.starts_with("http://") || cell.starts_with("https://")
}

/// Index of the column with the most http(s) values in the sampled rows. Ties go left.
pub fn detect_url_column(rows: &[csv::StringRecord]) -> Option<usize> {
    let mut counts: Vec<usize> = Vec::new();
    for row in rows.iter().take(URL_COLUMN_SAMPLE_ROWS) {
        if counts.len() < row.len() {
            counts.resize(row.len(), 0);
        }
        for (idx, cell) in row.iter().enumerate() {
            if looks_like_url(cell) {
                counts[idx] += 1;
            }
        }
    }
    counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .max_by(|(ia, a), (ib, b)| a.cmp(b).then_with(|| ib.cmp(ia)))
        .map(|(idx, _)| idx)
}

pub fn parse_sheet(
    bytes: &[u8],
    path: &Path,
    source: SourceId,
    vertical_map: &VerticalMap,
) -> Result<Vec<RawUrlRecord>, AdapterError> {
    let parse_error = |err: csv::Error| AdapterError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers().map_err(parse_error)?.clone();
    let rows = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(parse_error)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let url_column = detect_url_column(&rows).ok_or_else(|| AdapterError::NoUrlColumn(path.to_path_buf()))?;
    let names = headers.iter().map(attribute_name).collect::<Vec<_>>();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(url) = row.get(url_column).filter(|cell| !cell.is_empty()) else {
            continue;
        };
        let mut record = RawUrlRecord::new(source, url);
        for (idx, cell) in row.iter().enumerate() {
            if idx == url_column {
                continue;
            }
            let Some(name) = names.get(idx).filter(|name| !name.is_empty()) else {
                continue;
            };
            let value = if cell.is_empty() {
                Scalar::Null
            } else {
                Scalar::Text(cell.to_string())
            };
            record.attributes.insert(name.clone(), value);
        }
        vertical_map.fill(&mut record);
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl RecordStream for CsvSheetStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> SourceId {
        self.source
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawUrlRecord>, AdapterError> {
        let bytes = read_file(&self.path).await?;
        parse_sheet(&bytes, &self.path, self.source, &self.vertical_map)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseBundle {
    pub stream_id: String,
    pub queried_at: DateTime<Utc>,
    pub rows: Vec<WarehouseRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseRow {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub page_path: Option<String>,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub session_count: Scalar,
}

#[derive(Debug, Clone)]
pub struct WarehouseJsonStream {
    id: String,
    path: PathBuf,
    expansion: PathExpansion,
}

impl WarehouseJsonStream {
    fn row_to_record(&self, row: WarehouseRow) -> Option<RawUrlRecord> {
        let raw_url = match (row.url, row.page_path) {
            (Some(url), _) if !url.trim().is_empty() => url,
            (_, Some(path)) if !path.trim().is_empty() => {
                self.expansion.expand(&path, row.property.as_deref())
            }
            _ => return None,
        };
        Some(
            RawUrlRecord::new(SourceId::Warehouse, raw_url)
                .with_attr(ATTR_SESSION_COUNT, row.session_count)
                .with_attr(ATTR_PROPERTY, row.property),
        )
    }
}

#[async_trait]
impl RecordStream for WarehouseJsonStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> SourceId {
        SourceId::Warehouse
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawUrlRecord>, AdapterError> {
        let bundle: WarehouseBundle = read_json_file(&self.path).await?;
        let total = bundle.rows.len();
        let records = bundle
            .rows
            .into_iter()
            .filter_map(|row| self.row_to_record(row))
            .collect::<Vec<_>>();
        if records.len() < total {
            warn!(stream = %self.id, skipped = total - records.len(), "warehouse rows without url or page_path");
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlUpdateBundle {
    pub stream_id: String,
    pub crawled_at: DateTime<Utc>,
    pub rows: Vec<CrawlUpdateRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlUpdateRow {
    pub url: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Pages the site crawler saw change since its previous pass.
#[derive(Debug, Clone)]
pub struct CrawlUpdateJsonStream {
    id: String,
    path: PathBuf,
}

#[async_trait]
impl RecordStream for CrawlUpdateJsonStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> SourceId {
        SourceId::Crawl
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawUrlRecord>, AdapterError> {
        let bundle: CrawlUpdateBundle = read_json_file(&self.path).await?;
        debug!(stream = %self.id, rows = bundle.rows.len(), crawled_at = %bundle.crawled_at, "loaded crawl updates");
        Ok(bundle
            .rows
            .into_iter()
            .filter(|row| !row.url.trim().is_empty())
            .map(|row| {
                RawUrlRecord::new(SourceId::Crawl, row.url)
                    .with_attr(ATTR_UPDATED_AT, row.updated_at.map(|at| at.to_rfc3339()))
            })
            .collect())
    }
}

/// Observes one URL without following redirects. Failures come back as status `0`.
#[async_trait]
pub trait FetchCollaborator: Send + Sync {
    async fn fetch(&self, requested_url: &str) -> FetchResult;
}

/// Reports every fetch as failed; records stay eligible for a later run.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFetcher;

#[async_trait]
impl FetchCollaborator for NoopFetcher {
    async fn fetch(&self, requested_url: &str) -> FetchResult {
        FetchResult::failed(requested_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFixtureBundle {
    pub fixture_id: String,
    pub captured_at: DateTime<Utc>,
    pub pages: Vec<FetchFixturePage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFixturePage {
    pub url: String,
    pub initial_status_code: u16,
    #[serde(default)]
    pub resolved_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub detected_reliably: bool,
    #[serde(default)]
    pub html: Option<String>,
}

/// Canned fetch results keyed by URL, normalized with the run's reconciliation rules.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    reconciler: Arc<Reconciler>,
    pages: HashMap<NormalizedKey, FetchFixturePage>,
}

impl FixtureFetcher {
    pub fn new(reconciler: Arc<Reconciler>, pages: impl IntoIterator<Item = FetchFixturePage>) -> Self {
        let pages = pages
            .into_iter()
            .map(|page| (reconciler.normalize_key(&page.url), page))
            .collect();
        Self { reconciler, pages }
    }

    pub async fn from_path(path: impl AsRef<Path>, reconciler: Arc<Reconciler>) -> Result<Self, AdapterError> {
        let bundle: FetchFixtureBundle = read_json_file(path.as_ref()).await?;
        Ok(Self::new(reconciler, bundle.pages))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[async_trait]
impl FetchCollaborator for FixtureFetcher {
    async fn fetch(&self, requested_url: &str) -> FetchResult {
        let Some(page) = self.pages.get(&self.reconciler.normalize_key(requested_url)) else {
            debug!(requested_url, "no fetch fixture; reporting failed fetch");
            return FetchResult::failed(requested_url);
        };
        let declared = match (&page.resolved_url, &page.html) {
            (None, Some(html)) if !is_redirect_status(page.initial_status_code) => {
                extract_declared_canonical(html, requested_url)
            }
            _ => None,
        };
        FetchResult {
            requested_url: requested_url.to_string(),
            initial_status_code: page.initial_status_code,
            resolved_url: page.resolved_url.clone().or(declared),
            detected_reliably: page.detected_reliably,
        }
    }
}

/// `<link rel="canonical" href>` of a page, resolved against the requested URL.
pub fn extract_declared_canonical(html: &str, requested_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("link[rel][href]").ok()?;
    let href = document
        .select(&selector)
        .find(|link| {
            link.value()
                .attr("rel")
                .is_some_and(|rel| rel.split_ascii_whitespace().any(|t| t.eq_ignore_ascii_case("canonical")))
        })
        .and_then(|link| link.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())?;
    match Url::parse(requested_url).and_then(|base| base.join(href)) {
        Ok(resolved) => Some(resolved.to_string()),
        Err(_) => Some(href.to_string()),
    }
}

#[async_trait]
pub trait PageAnnotator: Send + Sync {
    async fn annotate(&self, record: &CatalogueRecord) -> Result<PageAnnotation, AdapterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnnotator;

#[async_trait]
impl PageAnnotator for NoopAnnotator {
    async fn annotate(&self, _record: &CatalogueRecord) -> Result<PageAnnotation, AdapterError> {
        Ok(PageAnnotation {
            extractor_version: "noop".to_string(),
            ..PageAnnotation::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationFixtureBundle {
    pub extractor_version: String,
    pub extracted_at: DateTime<Utc>,
    pub pages: Vec<AnnotationFixturePage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationFixturePage {
    pub url: String,
    #[serde(default)]
    pub template_type: FixtureField<String>,
    #[serde(default)]
    pub has_coupons: FixtureField<bool>,
    #[serde(default)]
    pub has_promotions: FixtureField<bool>,
    #[serde(default)]
    pub brand_list: FixtureField<Vec<String>>,
    #[serde(default)]
    pub product_list: FixtureField<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureField<T> {
    pub value: Option<T>,
    #[serde(default)]
    pub selector_or_pointer: String,
    #[serde(default)]
    pub snippet: String,
}

impl<T> Default for FixtureField<T> {
    fn default() -> Self {
        Self {
            value: None,
            selector_or_pointer: String::new(),
            snippet: String::new(),
        }
    }
}

/// Annotations replayed from a captured extractor run.
#[derive(Debug, Clone)]
pub struct FixtureAnnotator {
    reconciler: Arc<Reconciler>,
    extractor_version: String,
    extracted_at: DateTime<Utc>,
    pages: HashMap<NormalizedKey, AnnotationFixturePage>,
}

impl FixtureAnnotator {
    pub fn new(bundle: AnnotationFixtureBundle, reconciler: Arc<Reconciler>) -> Self {
        let pages = bundle
            .pages
            .into_iter()
            .map(|page| (reconciler.normalize_key(&page.url), page))
            .collect();
        Self {
            reconciler,
            extractor_version: bundle.extractor_version,
            extracted_at: bundle.extracted_at,
            pages,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>, reconciler: Arc<Reconciler>) -> Result<Self, AdapterError> {
        Ok(Self::new(read_json_file(path.as_ref()).await?, reconciler))
    }

    fn field<T: Clone>(&self, fixture: &FixtureField<T>, source_url: &str) -> Field<T> {
        match &fixture.value {
            Some(value) => Field::with_value_and_evidence(
                value.clone(),
                EvidenceRef {
                    source_url: source_url.to_string(),
                    selector_or_pointer: fixture.selector_or_pointer.clone(),
                    snippet: fixture.snippet.clone(),
                    extracted_at: self.extracted_at,
                    extractor_version: self.extractor_version.clone(),
                },
            ),
            None => Field::empty(),
        }
    }
}

#[async_trait]
impl PageAnnotator for FixtureAnnotator {
    async fn annotate(&self, record: &CatalogueRecord) -> Result<PageAnnotation, AdapterError> {
        let mut annotation = PageAnnotation {
            extractor_version: self.extractor_version.clone(),
            ..PageAnnotation::default()
        };
        let page = self
            .pages
            .get(&self.reconciler.normalize_key(&record.canonical_url))
            .or_else(|| self.pages.get(&self.reconciler.normalize_key(&record.url)));
        if let Some(page) = page {
            annotation.template_type = self.field(&page.template_type, &record.url);
            annotation.has_coupons = self.field(&page.has_coupons, &record.url);
            annotation.has_promotions = self.field(&page.has_promotions, &record.url);
            annotation.brand_list = self.field(&page.brand_list, &record.url);
            annotation.product_list = self.field(&page.product_list, &record.url);
        }
        Ok(annotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpcat_core::ATTR_PAGE_ID;
    use lpcat_reconcile::ReconcileConfig;

    fn aliased_reconciler() -> Arc<Reconciler> {
        Arc::new(Reconciler::new(ReconcileConfig {
            host_aliases: BTreeMap::from([("forbes.com".to_string(), "www.forbes.com".to_string())]),
            ..ReconcileConfig::default()
        }))
    }

    fn verticals() -> VerticalMap {
        VerticalMap::new([
            ("Car Insurance".to_string(), "Insurance".to_string()),
            ("Personal Loans".to_string(), "Finance".to_string()),
        ])
    }

    #[test]
    fn url_column_is_detected_by_content_not_header() {
        let csv = "Record ID,Title,Landing Page,Category\n\
                   rec1,Best loans,https://www.forbes.com/advisor/loans/,Personal Loans\n\
                   rec2,Cheap cover,http://forbes.com/advisor/car-insurance,Car Insurance\n\
                   rec3,Note,see https://x.com,\n";
        let records = parse_sheet(csv.as_bytes(), Path::new("sheet.csv"), SourceId::SourceOfRecord, &verticals())
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].raw_url, "https://www.forbes.com/advisor/loans/");
        assert_eq!(records[0].text_attr(ATTR_EXTERNAL_ID), Some("rec1"));
        assert_eq!(records[1].text_attr(ATTR_VERTICAL), Some("Insurance"));
        assert_eq!(records[2].raw_url, "see https://x.com");
        assert!(records[2].attr(ATTR_CATEGORY).is_none());
    }

    #[test]
    fn sheet_without_urls_is_rejected() {
        let csv = "a,b\n1,2\n";
        let err = parse_sheet(csv.as_bytes(), Path::new("s.csv"), SourceId::SourceOfRecord, &VerticalMap::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::NoUrlColumn(_)));
    }

    #[test]
    fn status_header_maps_to_business_status() {
        assert_eq!(attribute_name("Status"), ATTR_BUSINESS_STATUS);
        assert_eq!(attribute_name(" Record ID "), ATTR_EXTERNAL_ID);
        assert_eq!(attribute_name("Page Title"), "page_title");
        assert_eq!(attribute_name("page_id"), ATTR_PAGE_ID);
    }

    #[test]
    fn path_expansion_uses_property_rules() {
        let expansion = PathExpansion {
            property_hosts: BTreeMap::from([("expertise".to_string(), "www.expertise.com".to_string())]),
            default_host: "www.forbes.com".to_string(),
        };
        assert_eq!(
            expansion.expand("/tx/austin/plumbing", Some("Expertise - Main")),
            "https://www.expertise.com/tx/austin/plumbing"
        );
        assert_eq!(
            expansion.expand("advisor/loans", Some("Forbes Advisor")),
            "https://www.forbes.com/advisor/loans"
        );
        assert_eq!(expansion.expand("https://a.com/x", Some("Expertise")), "https://a.com/x");
    }

    #[test]
    fn vertical_is_only_filled_when_missing() {
        let map = verticals();
        let mut blank = RawUrlRecord::new(SourceId::SourceOfRecord, "https://x.com/a")
            .with_attr(ATTR_CATEGORY, "car insurance")
            .with_attr(ATTR_VERTICAL, "");
        map.fill(&mut blank);
        assert_eq!(blank.text_attr(ATTR_VERTICAL), Some("Insurance"));

        let mut set = RawUrlRecord::new(SourceId::SourceOfRecord, "https://x.com/a")
            .with_attr(ATTR_CATEGORY, "Car Insurance")
            .with_attr(ATTR_VERTICAL, "Auto");
        map.fill(&mut set);
        assert_eq!(set.text_attr(ATTR_VERTICAL), Some("Auto"));
    }

    #[test]
    fn declared_canonical_is_read_from_link_tag() {
        let html = r#"<html><head><link rel="stylesheet" href="/s.css">
            <link rel="Canonical" href="/advisor/credit-cards/best-travel-credit-cards/"></head></html>"#;
        assert_eq!(
            extract_declared_canonical(html, "https://www.forbes.com/advisor/credit-cards/best-travel-cards"),
            Some("https://www.forbes.com/advisor/credit-cards/best-travel-credit-cards/".to_string())
        );
        assert_eq!(extract_declared_canonical("<html></html>", "https://x.com/"), None);
    }

    #[tokio::test]
    async fn fixture_fetcher_matches_normalized_urls_and_fails_unknown() {
        let fetcher = FixtureFetcher::new(Arc::new(Reconciler::default()), [
            FetchFixturePage {
                url: "https://x.com/old".into(),
                initial_status_code: 301,
                resolved_url: Some("https://x.com/new".into()),
                detected_reliably: true,
                html: None,
            },
            FetchFixturePage {
                url: "https://x.com/page".into(),
                initial_status_code: 200,
                resolved_url: None,
                detected_reliably: true,
                html: Some(r#"<link rel="canonical" href="https://x.com/page-2">"#.into()),
            },
        ]);

        let redirect = fetcher.fetch("http://X.com/old/").await;
        assert_eq!(redirect.initial_status_code, 301);
        assert_eq!(redirect.resolved_url.as_deref(), Some("https://x.com/new"));
        assert_eq!(redirect.requested_url, "http://X.com/old/");

        let declared = fetcher.fetch("https://x.com/page").await;
        assert_eq!(declared.resolved_url.as_deref(), Some("https://x.com/page-2"));

        let missing = fetcher.fetch("https://x.com/unknown").await;
        assert_eq!(missing, FetchResult::failed("https://x.com/unknown"));
    }

    #[tokio::test]
    async fn missing_stream_file_is_an_io_error() {
        let spec = StreamSpec {
            id: "warehouse".into(),
            source: SourceId::Warehouse,
            format: StreamFormat::Json,
            path: PathBuf::from("does/not/exist.json"),
            enabled: true,
        };
        let stream = open_stream(&spec, Path::new("/nonexistent-root"), &StreamOptions::default()).unwrap();
        assert_eq!(stream.source(), SourceId::Warehouse);
        let err = stream.load().await.unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }

    #[test]
    fn csv_is_only_accepted_for_the_source_of_record() {
        let spec = |source| StreamSpec {
            id: "export".into(),
            source,
            format: StreamFormat::Csv,
            path: PathBuf::from("export.csv"),
            enabled: true,
        };
        for source in [SourceId::Warehouse, SourceId::Crawl] {
            let err = open_stream(&spec(source), Path::new("."), &StreamOptions::default())
                .err()
                .expect("csv must be rejected");
            assert!(matches!(
                err,
                AdapterError::UnsupportedFormat { kind, format: StreamFormat::Csv, .. } if kind == source
            ));
        }
        let sheet = open_stream(&spec(SourceId::SourceOfRecord), Path::new("."), &StreamOptions::default()).unwrap();
        assert_eq!(sheet.source(), SourceId::SourceOfRecord);
    }

    #[tokio::test]
    async fn crawl_stream_yields_crawl_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("crawl.json"),
            r#"{"stream_id":"crawl","crawled_at":"2026-03-02T05:00:00Z","rows":[
                {"url":"https://www.forbes.com/advisor/loans/","updated_at":"2026-03-01T22:10:00Z"},
                {"url":"  "},
                {"url":"https://www.forbes.com/advisor/new-page"}]}"#,
        )
        .unwrap();
        let spec = StreamSpec {
            id: "crawl".into(),
            source: SourceId::Crawl,
            format: StreamFormat::Json,
            path: PathBuf::from("crawl.json"),
            enabled: true,
        };
        let records = open_stream(&spec, dir.path(), &StreamOptions::default())
            .unwrap()
            .load()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.source == SourceId::Crawl));
        assert_eq!(records[0].text_attr(ATTR_UPDATED_AT), Some("2026-03-01T22:10:00+00:00"));
        assert!(records[1].attr(ATTR_UPDATED_AT).is_none());
    }

    #[tokio::test]
    async fn fixtures_match_through_configured_host_aliases() {
        let page = FetchFixturePage {
            url: "https://www.forbes.com/advisor/loans/".into(),
            initial_status_code: 200,
            resolved_url: None,
            detected_reliably: true,
            html: None,
        };
        let aliased = FixtureFetcher::new(aliased_reconciler(), [page.clone()]);
        let fetched = aliased.fetch("http://forbes.com/advisor/loans").await;
        assert_eq!(fetched.initial_status_code, 200);

        let plain = FixtureFetcher::new(Arc::new(Reconciler::default()), [page]);
        assert_eq!(plain.fetch("http://forbes.com/advisor/loans").await.initial_status_code, 0);

        let annotator = FixtureAnnotator::new(
            AnnotationFixtureBundle {
                extractor_version: "fixture-1".into(),
                extracted_at: DateTime::parse_from_rfc3339("2026-03-02T06:00:00Z").unwrap().with_timezone(&Utc),
                pages: vec![AnnotationFixturePage {
                    url: "https://www.forbes.com/advisor/loans".into(),
                    template_type: FixtureField {
                        value: Some("listicle".into()),
                        selector_or_pointer: "h1".into(),
                        snippet: "Best Loans".into(),
                    },
                    has_coupons: FixtureField::default(),
                    has_promotions: FixtureField::default(),
                    brand_list: FixtureField::default(),
                    product_list: FixtureField::default(),
                }],
            },
            aliased_reconciler(),
        );
        let record = CatalogueRecord::observed(
            "p1",
            "http://forbes.com/advisor/loans",
            DateTime::parse_from_rfc3339("2026-03-02T06:00:00Z").unwrap().with_timezone(&Utc),
        );
        let annotation = annotator.annotate(&record).await.unwrap();
        assert_eq!(annotation.template_type.value.as_deref(), Some("listicle"));
    }
}
