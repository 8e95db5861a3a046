//! Core domain model for the landing page catalogue.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lpcat-core";

pub const ATTR_BUSINESS_STATUS: &str = "business_status";
pub const ATTR_CATEGORY: &str = "category";
pub const ATTR_VERTICAL: &str = "vertical";
pub const ATTR_EXTERNAL_ID: &str = "external_id";
pub const ATTR_SESSION_COUNT: &str = "session_count";
pub const ATTR_PROPERTY: &str = "property";
pub const ATTR_PAGE_ID: &str = "page_id";
pub const ATTR_UPDATED_AT: &str = "updated_at";

/// Initial statuses that mean the requested URL answered with a redirect.
pub const REDIRECT_STATUS_CODES: [u16; 5] = [301, 302, 303, 307, 308];

pub fn is_redirect_status(status_code: u16) -> bool {
    REDIRECT_STATUS_CODES.contains(&status_code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    SourceOfRecord,
    Warehouse,
    Crawl,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::SourceOfRecord => "source_of_record",
            SourceId::Warehouse => "warehouse",
            SourceId::Crawl => "crawl",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute value carried on a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Null and blank text both count as absent.
    pub fn is_null(&self) -> bool {
        match self {
            Scalar::Null => true,
            Scalar::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(text) if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            Scalar::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Scalar::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// One observed row from an external source. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUrlRecord {
    pub raw_url: String,
    pub source: SourceId,
    #[serde(default)]
    pub attributes: BTreeMap<String, Scalar>,
}

impl RawUrlRecord {
    pub fn new(source: SourceId, raw_url: impl Into<String>) -> Self {
        Self {
            raw_url: raw_url.into(),
            source,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<Scalar>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Attribute value, treating null and blank text as missing.
    pub fn attr(&self, name: &str) -> Option<&Scalar> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    pub fn text_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Scalar::as_text)
    }

    pub fn populated_attr_count(&self) -> usize {
        self.attributes.values().filter(|v| !v.is_null()).count()
    }

    /// Most specific identifier available for audit output.
    pub fn identifier(&self) -> String {
        self.attr(ATTR_EXTERNAL_ID)
            .or_else(|| self.attr(ATTR_PAGE_ID))
            .map(ToString::to_string)
            .unwrap_or_else(|| self.raw_url.clone())
    }
}

/// Comparison-only view of a URL. Two URLs with the same key are the same logical page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedKey(String);

impl NormalizedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NormalizedKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Degraded-input annotations. These ride along on output records; they never abort a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFlag {
    /// URL could not be parsed; the key is a best-effort lower-cased copy.
    MalformedInput,
    /// No status observed yet (`status_code == 0`); eligible for retry.
    IncompleteFetch,
    /// The fetch collaborator could not separate initial from final status.
    AmbiguousRedirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageStatus {
    Active,
    Inactive,
    Paused,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Active => "Active",
            PageStatus::Inactive => "Inactive",
            PageStatus::Paused => "Paused",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown page status '{0}'")]
pub struct UnknownPageStatus(pub String);

impl FromStr for PageStatus {
    type Err = UnknownPageStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "live" => Ok(PageStatus::Active),
            "inactive" | "dead" => Ok(PageStatus::Inactive),
            "paused" => Ok(PageStatus::Paused),
            _ => Err(UnknownPageStatus(s.to_string())),
        }
    }
}

/// Who last wrote `page_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusWriter {
    SourceOfRecordSync,
    ZeroSessionPolicy,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusWrite {
    Applied,
    Unchanged,
    Rejected,
}

/// Provenance pointer attached to annotator-extracted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub source_url: String,
    pub selector_or_pointer: String,
    pub snippet: String,
    pub extracted_at: DateTime<Utc>,
    pub extractor_version: String,
}

/// Annotated field wrapper with optional value + evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub evidence: Option<EvidenceRef>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            evidence: None,
        }
    }

    pub fn with_value_and_evidence(value: T, evidence: EvidenceRef) -> Self {
        Self {
            value: Some(value),
            evidence: Some(evidence),
        }
    }

    pub fn is_populated(&self) -> bool {
        self.value.is_some()
    }
}

/// Structured content returned by the page annotator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PageAnnotation {
    pub extractor_version: String,
    #[serde(default)]
    pub template_type: Field<String>,
    #[serde(default)]
    pub has_coupons: Field<bool>,
    #[serde(default)]
    pub has_promotions: Field<bool>,
    #[serde(default)]
    pub brand_list: Field<Vec<String>>,
    #[serde(default)]
    pub product_list: Field<Vec<String>>,
}

/// What the fetch collaborator observed for one requested URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub requested_url: String,
    /// Status before any redirect was followed. `0` when the fetch failed.
    pub initial_status_code: u16,
    pub resolved_url: Option<String>,
    pub detected_reliably: bool,
}

impl FetchResult {
    pub fn failed(requested_url: impl Into<String>) -> Self {
        Self {
            requested_url: requested_url.into(),
            initial_status_code: 0,
            resolved_url: None,
            detected_reliably: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    /// Initial status was a redirect; `canonical_url` is the navigable target.
    Redirect,
    /// Answered directly but declares a different canonical. Not navigable.
    DeclaredCanonical,
    Direct,
    FetchFailed,
    /// Initial and final status could not be separated.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFetch {
    pub status_code: u16,
    pub canonical_url: String,
    pub is_redirect: bool,
    pub redirect_detected_reliably: bool,
    pub kind: RedirectKind,
    #[serde(default)]
    pub flags: Vec<RecordFlag>,
}

/// Durable entity per distinct crawled page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueRecord {
    pub page_id: String,
    pub url: String,
    pub canonical_url: String,
    pub status_code: u16,
    pub page_status: Option<PageStatus>,
    #[serde(default)]
    pub page_status_writer: Option<StatusWriter>,
    /// Last business status seen from the source of record.
    #[serde(default)]
    pub upstream_status: Option<PageStatus>,
    /// Source of record re-activated a page the zero-session policy had deactivated.
    #[serde(default)]
    pub policy_override: bool,
    pub catalogued: bool,
    #[serde(default = "default_true")]
    pub redirect_detected_reliably: bool,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub vertical: Option<String>,
    #[serde(default)]
    pub annotation: Option<PageAnnotation>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl CatalogueRecord {
    /// Fresh record for a URL first observed in the source of record.
    pub fn observed(page_id: impl Into<String>, url: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        let url = url.into();
        Self {
            page_id: page_id.into(),
            canonical_url: url.clone(),
            url,
            status_code: 0,
            page_status: None,
            page_status_writer: None,
            upstream_status: None,
            policy_override: false,
            catalogued: false,
            redirect_detected_reliably: true,
            external_id: None,
            category: None,
            vertical: None,
            annotation: None,
            first_seen: seen_at,
            last_seen: seen_at,
            fetched_at: None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        is_redirect_status(self.status_code)
    }

    /// Status the policy should reason about: unreliable detections count as not yet fetched.
    pub fn effective_status_code(&self) -> u16 {
        if self.redirect_detected_reliably {
            self.status_code
        } else {
            0
        }
    }

    pub fn needs_fetch(&self) -> bool {
        self.status_code == 0 || !self.redirect_detected_reliably
    }

    pub fn apply_fetch(&mut self, fetch: &ResolvedFetch, fetched_at: DateTime<Utc>) {
        self.status_code = fetch.status_code;
        self.canonical_url = fetch.canonical_url.clone();
        self.redirect_detected_reliably = fetch.redirect_detected_reliably;
        self.fetched_at = Some(fetched_at);
    }

    pub fn mark_catalogued(&mut self, annotation: PageAnnotation) {
        self.annotation = Some(annotation);
        self.catalogued = true;
    }

    /// Send the page back through fetch and annotation after its content changed.
    /// Identity, attributes and status stay as they are. Returns `false` when the page
    /// was already waiting for a fetch and annotation.
    pub fn mark_for_recatalogue(&mut self) -> bool {
        let changed = self.status_code != 0 || self.catalogued;
        self.status_code = 0;
        self.catalogued = false;
        changed
    }

    /// Write `page_status` on behalf of `writer`, honouring single-owner rules.
    ///
    /// The source-of-record sync only writes when the upstream value actually changed
    /// since it was last seen, so a policy deactivation is not undone by an unchanged
    /// upstream row. An upstream re-activation of a policy-deactivated page sets
    /// `policy_override`, and the zero-session policy is rejected while it is set.
    pub fn apply_business_status(&mut self, status: PageStatus, writer: StatusWriter) -> StatusWrite {
        match writer {
            StatusWriter::SourceOfRecordSync => {
                let upstream_changed = self.upstream_status != Some(status);
                self.upstream_status = Some(status);
                if !upstream_changed || self.page_status == Some(status) {
                    if status != PageStatus::Active {
                        self.policy_override = false;
                    }
                    return StatusWrite::Unchanged;
                }
                let reactivating = status == PageStatus::Active
                    && self.page_status_writer == Some(StatusWriter::ZeroSessionPolicy)
                    && self.page_status.is_some_and(|s| s != PageStatus::Active);
                self.policy_override = reactivating;
                self.page_status = Some(status);
                self.page_status_writer = Some(writer);
                StatusWrite::Applied
            }
            StatusWriter::ZeroSessionPolicy => {
                if self.policy_override {
                    return StatusWrite::Rejected;
                }
                if self.page_status == Some(status) {
                    return StatusWrite::Unchanged;
                }
                self.page_status = Some(status);
                self.page_status_writer = Some(writer);
                StatusWrite::Applied
            }
            StatusWriter::Manual => {
                if status != PageStatus::Active {
                    self.policy_override = false;
                }
                if self.page_status == Some(status) {
                    return StatusWrite::Unchanged;
                }
                self.page_status = Some(status);
                self.page_status_writer = Some(writer);
                StatusWrite::Applied
            }
        }
    }
}

/// Automated actions a record may qualify for. Several may apply to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    EligibleForCataloguing,
    SkipRedirect,
    SkipAlreadyCatalogued,
    DeactivateZeroSessions,
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub page_id: String,
    pub url: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub flags: Vec<RecordFlag>,
}

impl Decision {
    pub fn has(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

/// One URL present (by normalized key) on one side only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub url: String,
    pub normalized_key: NormalizedKey,
    pub present_in_a: bool,
    pub present_in_b: bool,
    pub duplicate_count: usize,
    pub duplicate_ids: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Scalar>,
    #[serde(default)]
    pub flags: Vec<RecordFlag>,
}

/// Gap key pair that looks like the same page spelled differently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearMatch {
    pub a_key: NormalizedKey,
    pub b_key: NormalizedKey,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GapSummary {
    pub total_gaps: usize,
    pub a_only: usize,
    pub b_only: usize,
    pub matched: usize,
    pub a_keys: usize,
    pub b_keys: usize,
    pub a_duplicate_groups: usize,
    pub b_duplicate_groups: usize,
    pub excluded_records: usize,
    pub malformed_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GapReport {
    pub a_not_b: Vec<GapRecord>,
    pub b_not_a: Vec<GapRecord>,
    pub summary: GapSummary,
    #[serde(default)]
    pub near_matches: Vec<NearMatch>,
}
