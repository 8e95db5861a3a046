//! Reconciliation core: URL normalization, redirect resolution, duplicate grouping,
//! cross-source gap classification and the status policy.
//!
//! Everything in this crate is pure and synchronous. Shard-level results merge
//! commutatively, so callers may fan work out across tasks and fold the pieces back.

use std::borrow::Cow;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use lpcat_core::{
    is_redirect_status, Action, CatalogueRecord, Decision, FetchResult, GapRecord, GapReport,
    GapSummary, NearMatch, NormalizedKey, PageStatus, RawUrlRecord, RecordFlag, RedirectKind,
    ResolvedFetch, Scalar, ATTR_CATEGORY, ATTR_EXTERNAL_ID, ATTR_SESSION_COUNT, ATTR_VERTICAL,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;
use url::{form_urlencoded, Url};

pub const CRATE_NAME: &str = "lpcat-reconcile";

pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "msclkid", "aff_id", "aff_sub", "subid", "sid", "mc_cid", "mc_eid",
];
pub const DEFAULT_TRACKING_PREFIXES: &[&str] = &["utm_"];

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host alias chain starting at '{0}' loops back on itself")]
    AliasCycle(String),
    #[error("near_match_threshold must be within 0.0..=1.0, got {0}")]
    ThresholdOutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub tracking_params: BTreeSet<String>,
    pub tracking_prefixes: Vec<String>,
    /// Bare host -> canonical host, e.g. `forbes.com -> www.forbes.com`.
    pub host_aliases: BTreeMap<String, String>,
    pub excluded_hosts: BTreeSet<String>,
    pub near_match_threshold: f64,
    /// A page the warehouse never reports has zero observed sessions. `false` limits
    /// the policy to pages with an explicit zero row.
    pub treat_missing_as_zero: bool,
    pub deactivated_status: PageStatus,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tracking_params: DEFAULT_TRACKING_PARAMS.iter().map(|p| p.to_string()).collect(),
            tracking_prefixes: DEFAULT_TRACKING_PREFIXES.iter().map(|p| p.to_string()).collect(),
            host_aliases: BTreeMap::new(),
            excluded_hosts: BTreeSet::new(),
            near_match_threshold: 0.92,
            treat_missing_as_zero: true,
            deactivated_status: PageStatus::Inactive,
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.near_match_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.near_match_threshold));
        }
        let aliases = lowercase_map(&self.host_aliases);
        for start in aliases.keys() {
            let mut seen = BTreeSet::from([start.as_str()]);
            let mut current = start.as_str();
            while let Some(next) = aliases.get(current) {
                if !seen.insert(next.as_str()) {
                    return Err(ConfigError::AliasCycle(start.clone()));
                }
                current = next.as_str();
            }
        }
        Ok(())
    }

    fn lowercased(mut self) -> Self {
        self.tracking_params = self
            .tracking_params
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .collect();
        self.tracking_prefixes = self
            .tracking_prefixes
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self.host_aliases = lowercase_map(&self.host_aliases);
        self.excluded_hosts = self
            .excluded_hosts
            .iter()
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .collect();
        self
    }
}

fn lowercase_map(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_ascii_lowercase()))
        .collect()
}

/// Result of normalizing one raw URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedUrl {
    pub key: NormalizedKey,
    pub host: Option<String>,
    pub malformed: bool,
}

impl NormalizedUrl {
    fn malformed(trimmed: &str) -> Self {
        Self {
            key: NormalizedKey::new(trimmed.to_lowercase()),
            host: None,
            malformed: true,
        }
    }

    pub fn flags(&self) -> Vec<RecordFlag> {
        if self.malformed {
            vec![RecordFlag::MalformedInput]
        } else {
            Vec::new()
        }
    }
}

/// Caller-owned normalization cache. There is no process-wide cache.
pub type NormalizeMemo = HashMap<String, NormalizedUrl>;

/// Ranked completeness used to pick a group representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletenessTier {
    Bare,
    Identified,
    Categorised,
    Complete,
}

impl CompletenessTier {
    pub fn of(record: &RawUrlRecord) -> Self {
        let category = record.attr(ATTR_CATEGORY).is_some();
        let vertical = record.attr(ATTR_VERTICAL).is_some();
        if category && vertical {
            CompletenessTier::Complete
        } else if category || vertical {
            CompletenessTier::Categorised
        } else if record.attr(ATTR_EXTERNAL_ID).is_some() {
            CompletenessTier::Identified
        } else {
            CompletenessTier::Bare
        }
    }
}

/// Total order over group members: tier, then populated attributes, then first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RepresentativeRank {
    pub tier: CompletenessTier,
    pub populated: usize,
    pub first_seen: Reverse<usize>,
}

impl RepresentativeRank {
    pub fn of(ordinal: usize, record: &RawUrlRecord) -> Self {
        Self {
            tier: CompletenessTier::of(record),
            populated: record.populated_attr_count(),
            first_seen: Reverse(ordinal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub key: NormalizedKey,
    pub host: Option<String>,
    pub representative: RawUrlRecord,
    pub members: Vec<RawUrlRecord>,
    pub count: usize,
    pub malformed_members: usize,
    #[serde(skip)]
    ordinals: Vec<usize>,
}

impl DuplicateGroup {
    fn from_members(
        key: NormalizedKey,
        host: Option<String>,
        malformed_members: usize,
        mut members: Vec<(usize, RawUrlRecord)>,
    ) -> Option<Self> {
        members.sort_by_key(|(ordinal, _)| *ordinal);
        let representative = members
            .iter()
            .max_by_key(|(ordinal, record)| RepresentativeRank::of(*ordinal, record))
            .map(|(_, record)| record.clone())?;
        let (ordinals, members): (Vec<_>, Vec<_>) = members.into_iter().unzip();
        Some(Self {
            key,
            host,
            representative,
            count: members.len(),
            members,
            malformed_members,
            ordinals,
        })
    }

    pub fn is_duplicate(&self) -> bool {
        self.count > 1
    }

    /// Distinct member identifiers in first-seen order.
    pub fn member_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.members
            .iter()
            .map(RawUrlRecord::identifier)
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Combine two partial groups for the same key. Order of arguments does not matter.
    pub fn merge(self, other: DuplicateGroup) -> DuplicateGroup {
        let host = self.host.or(other.host);
        let malformed_members = self.malformed_members + other.malformed_members;
        let mut members = self
            .ordinals
            .into_iter()
            .zip(self.members)
            .chain(other.ordinals.into_iter().zip(other.members))
            .collect::<Vec<_>>();
        members.sort_by_key(|(ordinal, _)| *ordinal);
        let representative = members
            .iter()
            .max_by_key(|(ordinal, record)| RepresentativeRank::of(*ordinal, record))
            .map_or(self.representative, |(_, record)| record.clone());
        let (ordinals, members): (Vec<_>, Vec<_>) = members.into_iter().unzip();
        DuplicateGroup {
            key: self.key,
            host,
            representative,
            count: members.len(),
            members,
            malformed_members,
            ordinals,
        }
    }
}

pub type GroupMap = BTreeMap<NormalizedKey, DuplicateGroup>;

/// Grouping output for one shard of one source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardGroups {
    pub groups: GroupMap,
    pub excluded_records: usize,
}

impl ShardGroups {
    pub fn merge(mut self, other: ShardGroups) -> ShardGroups {
        for (key, group) in other.groups {
            let merged = match self.groups.remove(&key) {
                Some(existing) => existing.merge(group),
                None => group,
            };
            self.groups.insert(key, merged);
        }
        self.excluded_records += other.excluded_records;
        self
    }

    pub fn merge_all(shards: impl IntoIterator<Item = ShardGroups>) -> ShardGroups {
        shards.into_iter().fold(ShardGroups::default(), ShardGroups::merge)
    }

    pub fn malformed_records(&self) -> usize {
        self.groups.values().map(|g| g.malformed_members).sum()
    }
}

/// Caller-requested ordering for gap lists. Ties break by normalized key ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSort {
    pub attribute: String,
    #[serde(default)]
    pub descending: bool,
}

impl GapSort {
    pub fn sessions_desc() -> Self {
        Self {
            attribute: ATTR_SESSION_COUNT.to_string(),
            descending: true,
        }
    }
}

/// Highest observed session count per normalized key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIndex {
    sessions: BTreeMap<NormalizedKey, i64>,
}

impl SessionIndex {
    pub fn sessions_for(&self, key: &NormalizedKey) -> Option<i64> {
        self.sessions.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconcileConfig,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcileConfig::default())
    }
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config: config.lowercased(),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Map a raw URL to its comparison key. Never fails; unparsable input is flagged.
    pub fn normalize(&self, raw: &str) -> NormalizedUrl {
        let trimmed = strip_wrapping(raw);
        let candidate: Cow<'_, str> = if trimmed.contains("://") {
            Cow::Borrowed(trimmed)
        } else {
            match Url::parse(trimmed) {
                // `mailto:`, `tel:` and friends: a real scheme that is not a web page.
                Ok(url) if !url.scheme().contains('.') => {
                    debug!(raw, scheme = url.scheme(), "non-web url; using best-effort key");
                    return NormalizedUrl::malformed(trimmed);
                }
                _ => Cow::Owned(format!("https://{trimmed}")),
            }
        };

        let parsed = match Url::parse(&candidate) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => url,
            _ => {
                debug!(raw, "unparsable url; using best-effort key");
                return NormalizedUrl::malformed(trimmed);
            }
        };

        let host = self.canonical_host(parsed.host_str().unwrap_or_default());
        let mut key = String::with_capacity(candidate.len());
        key.push_str("https://");
        key.push_str(&host);
        if let Some(port) = parsed.port().filter(|p| *p != 80 && *p != 443) {
            key.push(':');
            key.push_str(&port.to_string());
        }
        key.push_str(&normalize_path(parsed.path()));
        if let Some(query) = self.normalize_query(&parsed) {
            key.push('?');
            key.push_str(&query);
        }

        NormalizedUrl {
            key: NormalizedKey::new(key),
            host: Some(host),
            malformed: false,
        }
    }

    pub fn normalize_key(&self, raw: &str) -> NormalizedKey {
        self.normalize(raw).key
    }

    pub fn normalize_memo(&self, raw: &str, memo: &mut NormalizeMemo) -> NormalizedUrl {
        if let Some(hit) = memo.get(raw) {
            return hit.clone();
        }
        let normalized = self.normalize(raw);
        memo.insert(raw.to_string(), normalized.clone());
        normalized
    }

    fn canonical_host(&self, host: &str) -> String {
        let mut current = host.trim_end_matches('.').to_ascii_lowercase();
        // Bounded walk; cycles are rejected by `ReconcileConfig::validate`.
        for _ in 0..=self.config.host_aliases.len() {
            match self.config.host_aliases.get(&current) {
                Some(next) if *next != current => current = next.clone(),
                _ => break,
            }
        }
        current
    }

    fn is_tracking_param(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.config.tracking_params.contains(&name)
            || self
                .config
                .tracking_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn normalize_query(&self, url: &Url) -> Option<String> {
        url.query()?;
        let mut pairs = url
            .query_pairs()
            .filter(|(name, _)| !self.is_tracking_param(name))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect::<Vec<_>>();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();
        Some(
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish(),
        )
    }

    /// Derive the stored `(status_code, canonical_url)` pair for one fetch.
    pub fn resolve(&self, initial_status: u16, resolved_url: &str, requested_url: &str) -> ResolvedFetch {
        let canonical_url = match resolved_url.trim() {
            "" => requested_url.trim(),
            resolved => resolved,
        }
        .to_string();
        let is_redirect = is_redirect_status(initial_status);

        let (kind, flags) = if initial_status == 0 {
            (RedirectKind::FetchFailed, vec![RecordFlag::IncompleteFetch])
        } else if is_redirect {
            (RedirectKind::Redirect, Vec::new())
        } else if self.normalize_key(&canonical_url) != self.normalize_key(requested_url) {
            (RedirectKind::DeclaredCanonical, Vec::new())
        } else {
            (RedirectKind::Direct, Vec::new())
        };

        ResolvedFetch {
            status_code: initial_status,
            canonical_url,
            is_redirect,
            redirect_detected_reliably: true,
            kind,
            flags,
        }
    }

    /// Like [`Reconciler::resolve`], but keeps the degraded mode visible when the
    /// collaborator followed redirects transparently.
    pub fn resolve_fetch(&self, fetch: &FetchResult) -> ResolvedFetch {
        let mut resolved = self.resolve(
            fetch.initial_status_code,
            fetch.resolved_url.as_deref().unwrap_or_default(),
            &fetch.requested_url,
        );
        if !fetch.detected_reliably {
            resolved.redirect_detected_reliably = false;
            resolved.flags.push(RecordFlag::AmbiguousRedirect);
            if resolved.kind != RedirectKind::FetchFailed {
                resolved.kind = RedirectKind::Unknown;
            }
        }
        resolved
    }

    /// Group one source's records by normalized key.
    pub fn group(&self, records: &[RawUrlRecord]) -> GroupMap {
        self.group_shard(records.iter().cloned().enumerate(), &BTreeSet::new())
            .groups
    }

    /// Group one shard. Ordinals are positions in the full source sequence so that
    /// representative tie-breaks survive sharding.
    pub fn group_shard(
        &self,
        records: impl IntoIterator<Item = (usize, RawUrlRecord)>,
        excluded_hosts: &BTreeSet<String>,
    ) -> ShardGroups {
        let excluded_hosts = excluded_hosts
            .iter()
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .collect::<BTreeSet<_>>();
        let mut memo = NormalizeMemo::new();
        let mut buckets: BTreeMap<NormalizedKey, (Option<String>, usize, Vec<(usize, RawUrlRecord)>)> =
            BTreeMap::new();
        let mut excluded_records = 0usize;

        for (ordinal, record) in records {
            let normalized = self.normalize_memo(&record.raw_url, &mut memo);
            if normalized
                .host
                .as_deref()
                .is_some_and(|host| host_is_excluded(host, &excluded_hosts))
            {
                excluded_records += 1;
                continue;
            }
            let bucket = buckets
                .entry(normalized.key)
                .or_insert_with(|| (normalized.host.clone(), 0, Vec::new()));
            if normalized.malformed {
                bucket.1 += 1;
            }
            bucket.2.push((ordinal, record));
        }

        let groups = buckets
            .into_iter()
            .filter_map(|(key, (host, malformed, members))| {
                DuplicateGroup::from_members(key.clone(), host, malformed, members).map(|g| (key, g))
            })
            .collect();

        ShardGroups {
            groups,
            excluded_records,
        }
    }

    /// Cross-reference two sources, dropping the configured excluded hosts.
    pub fn classify(&self, set_a: &[RawUrlRecord], set_b: &[RawUrlRecord]) -> GapReport {
        self.classify_with(set_a, set_b, &self.config.excluded_hosts, None)
    }

    pub fn classify_with(
        &self,
        set_a: &[RawUrlRecord],
        set_b: &[RawUrlRecord],
        excluded_hosts: &BTreeSet<String>,
        sort: Option<&GapSort>,
    ) -> GapReport {
        let a = self.group_shard(set_a.iter().cloned().enumerate(), excluded_hosts);
        let b = self.group_shard(set_b.iter().cloned().enumerate(), excluded_hosts);
        self.classify_groups(&a, &b, sort)
    }

    /// Gap classification over already grouped (and possibly shard-merged) inputs.
    pub fn classify_groups(&self, a: &ShardGroups, b: &ShardGroups, sort: Option<&GapSort>) -> GapReport {
        let a_only = a
            .groups
            .values()
            .filter(|g| !b.groups.contains_key(&g.key))
            .collect::<Vec<_>>();
        let b_only = b
            .groups
            .values()
            .filter(|g| !a.groups.contains_key(&g.key))
            .collect::<Vec<_>>();
        let matched = a.groups.len() - a_only.len();

        let near_matches = self.near_matches(&a_only, &b_only);

        let mut a_not_b = a_only.iter().map(|g| gap_record(g, true)).collect::<Vec<_>>();
        let mut b_not_a = b_only.iter().map(|g| gap_record(g, false)).collect::<Vec<_>>();
        if let Some(sort) = sort {
            sort_gaps(&mut a_not_b, sort);
            sort_gaps(&mut b_not_a, sort);
        }

        let summary = GapSummary {
            total_gaps: a_not_b.len() + b_not_a.len(),
            a_only: a_not_b.len(),
            b_only: b_not_a.len(),
            matched,
            a_keys: a.groups.len(),
            b_keys: b.groups.len(),
            a_duplicate_groups: a.groups.values().filter(|g| g.is_duplicate()).count(),
            b_duplicate_groups: b.groups.values().filter(|g| g.is_duplicate()).count(),
            excluded_records: a.excluded_records + b.excluded_records,
            malformed_records: a.malformed_records() + b.malformed_records(),
        };

        GapReport {
            a_not_b,
            b_not_a,
            summary,
            near_matches,
        }
    }

    fn near_matches(&self, a_only: &[&DuplicateGroup], b_only: &[&DuplicateGroup]) -> Vec<NearMatch> {
        let mut b_by_host: BTreeMap<&str, Vec<&DuplicateGroup>> = BTreeMap::new();
        for &group in b_only {
            if let Some(host) = group.host.as_deref() {
                b_by_host.entry(host).or_default().push(group);
            }
        }

        let threshold = self.config.near_match_threshold;
        let mut out = Vec::new();
        for a in a_only {
            let Some(candidates) = a.host.as_deref().and_then(|h| b_by_host.get(h)) else {
                continue;
            };
            let a_path = key_path(&a.key);
            let mut best: Option<(&DuplicateGroup, f64)> = None;
            for b in candidates.iter().copied() {
                let score = jaro_winkler(a_path, key_path(&b.key));
                if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                    best = Some((b, score));
                }
            }
            if let Some((b, score)) = best {
                out.push(NearMatch {
                    a_key: a.key.clone(),
                    b_key: b.key.clone(),
                    score,
                });
            }
        }
        out
    }

    /// Highest session count per key; warehouse duplicates collapse to their max.
    pub fn session_index(&self, warehouse: &[RawUrlRecord]) -> SessionIndex {
        let mut memo = NormalizeMemo::new();
        let mut sessions: BTreeMap<NormalizedKey, i64> = BTreeMap::new();
        for record in warehouse {
            let key = self.normalize_memo(&record.raw_url, &mut memo).key;
            let count = record
                .attr(ATTR_SESSION_COUNT)
                .and_then(Scalar::as_i64)
                .unwrap_or(0);
            sessions
                .entry(key)
                .and_modify(|current| *current = (*current).max(count))
                .or_insert(count);
        }
        SessionIndex { sessions }
    }

    /// Zero-session axis of the policy, independent of cataloguing eligibility.
    pub fn qualifies_for_zero_session_deactivation(
        &self,
        record: &CatalogueRecord,
        sessions: &SessionIndex,
    ) -> bool {
        if record.page_status != Some(PageStatus::Active) || record.policy_override {
            return false;
        }
        match sessions.sessions_for(&self.normalize_key(&record.url)) {
            Some(count) => count <= 0,
            None => self.config.treat_missing_as_zero,
        }
    }

    /// Every applicable action per record, both decision axes combined.
    pub fn decide_all(&self, records: &[CatalogueRecord], sessions: &SessionIndex) -> Vec<Decision> {
        records
            .iter()
            .map(|record| {
                let mut actions = Vec::with_capacity(2);
                let primary = decide(record);
                if primary != Action::NoAction {
                    actions.push(primary);
                }
                if self.qualifies_for_zero_session_deactivation(record, sessions) {
                    actions.push(Action::DeactivateZeroSessions);
                }
                if actions.is_empty() {
                    actions.push(Action::NoAction);
                }
                Decision {
                    page_id: record.page_id.clone(),
                    url: record.url.clone(),
                    actions,
                    flags: record_flags(record),
                }
            })
            .collect()
    }
}

/// Peel whitespace and quote layers until nothing changes, so nested wrappings
/// collapse in one pass.
fn strip_wrapping(raw: &str) -> &str {
    let mut current = raw;
    loop {
        let next = current.trim().trim_matches(|c| c == '"' || c == '\'');
        if next == current {
            return current;
        }
        current = next;
    }
}

fn normalize_path(path: &str) -> String {
    let mut collapsed = String::with_capacity(path.len());
    let mut previous_slash = false;
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        collapsed.push(c);
    }
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }
    if collapsed.is_empty() {
        collapsed.push('/');
    }
    collapsed
}

fn host_is_excluded(host: &str, excluded_hosts: &BTreeSet<String>) -> bool {
    excluded_hosts.iter().any(|excluded| {
        host == excluded
            || host
                .strip_suffix(excluded.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

fn key_path(key: &NormalizedKey) -> &str {
    let rest = key.as_str().strip_prefix("https://").unwrap_or(key.as_str());
    rest.find('/').map(|idx| &rest[idx..]).unwrap_or(rest)
}

fn gap_record(group: &DuplicateGroup, in_a: bool) -> GapRecord {
    GapRecord {
        url: group.representative.raw_url.clone(),
        normalized_key: group.key.clone(),
        present_in_a: in_a,
        present_in_b: !in_a,
        duplicate_count: group.count,
        duplicate_ids: group.member_ids(),
        attributes: group.representative.attributes.clone(),
        flags: if group.malformed_members > 0 {
            vec![RecordFlag::MalformedInput]
        } else {
            Vec::new()
        },
    }
}

#[derive(Debug)]
enum SortValue {
    Number(f64),
    Text(String),
}

impl SortValue {
    fn of(value: Option<&Scalar>) -> Option<Self> {
        let value = value.filter(|v| !v.is_null())?;
        Some(match value.as_f64() {
            Some(n) => SortValue::Number(n),
            None => SortValue::Text(value.to_string()),
        })
    }

    fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Number(_), SortValue::Text(_)) => Ordering::Less,
            (SortValue::Text(_), SortValue::Number(_)) => Ordering::Greater,
        }
    }
}

fn sort_gaps(records: &mut [GapRecord], sort: &GapSort) {
    records.sort_by(|x, y| {
        let vx = SortValue::of(x.attributes.get(&sort.attribute));
        let vy = SortValue::of(y.attributes.get(&sort.attribute));
        let by_value = match (vx, vy) {
            (None, None) => Ordering::Equal,
            // Missing values sink regardless of direction.
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) if sort.descending => b.total_cmp(&a),
            (Some(a), Some(b)) => a.total_cmp(&b),
        };
        by_value.then_with(|| x.normalized_key.cmp(&y.normalized_key))
    });
}

fn record_flags(record: &CatalogueRecord) -> Vec<RecordFlag> {
    let mut flags = Vec::new();
    if record.effective_status_code() == 0 {
        flags.push(RecordFlag::IncompleteFetch);
    }
    if !record.redirect_detected_reliably {
        flags.push(RecordFlag::AmbiguousRedirect);
    }
    flags
}

/// Cataloguing-eligibility axis of the policy. First matching rule wins.
pub fn decide(record: &CatalogueRecord) -> Action {
    let status = record.effective_status_code();
    if is_redirect_status(status) {
        Action::SkipRedirect
    } else if record.catalogued {
        Action::SkipAlreadyCatalogued
    } else if status == 0 || status == 200 {
        Action::EligibleForCataloguing
    } else {
        Action::NoAction
    }
}

/// Stable page identity: SHA-256 of the normalized key at first observation.
pub fn page_id_for(key: &NormalizedKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn normalize(raw: &str) -> NormalizedKey {
    Reconciler::default().normalize_key(raw)
}

pub fn resolve(initial_status: u16, resolved_url: &str, requested_url: &str) -> ResolvedFetch {
    Reconciler::default().resolve(initial_status, resolved_url, requested_url)
}

pub fn group(records: &[RawUrlRecord]) -> GroupMap {
    Reconciler::default().group(records)
}

pub fn classify(
    set_a: &[RawUrlRecord],
    set_b: &[RawUrlRecord],
    excluded_hosts: &BTreeSet<String>,
) -> GapReport {
    Reconciler::default().classify_with(set_a, set_b, excluded_hosts, None)
}
