use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lpcat_adapters::{
    open_stream, FetchCollaborator, FixtureAnnotator, FixtureFetcher, PageAnnotator, PathExpansion,
    StreamFormat, StreamOptions, StreamSpec, VerticalMap,
};
use lpcat_core::{
    CatalogueRecord, SourceId, ATTR_BUSINESS_STATUS, ATTR_CATEGORY, ATTR_SESSION_COUNT, ATTR_UPDATED_AT,
    ATTR_VERTICAL,
};
use lpcat_reconcile::{ReconcileConfig, Reconciler};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn options() -> StreamOptions {
    StreamOptions {
        path_expansion: PathExpansion {
            property_hosts: BTreeMap::from([("expertise".to_string(), "www.expertise.com".to_string())]),
            default_host: "www.forbes.com".to_string(),
        },
        vertical_map: VerticalMap::new([("Car Insurance".to_string(), "Insurance".to_string())]),
    }
}

fn forbes_reconciler() -> Arc<Reconciler> {
    Arc::new(Reconciler::new(ReconcileConfig {
        host_aliases: BTreeMap::from([("forbes.com".to_string(), "www.forbes.com".to_string())]),
        ..ReconcileConfig::default()
    }))
}

fn spec(id: &str, source: SourceId, format: StreamFormat, path: &str) -> StreamSpec {
    StreamSpec {
        id: id.to_string(),
        source,
        format,
        path: PathBuf::from(path),
        enabled: true,
    }
}

#[tokio::test]
async fn json_and_csv_source_of_record_agree_on_shared_rows() {
    let root = workspace_root();
    let json = open_stream(
        &spec("sor", SourceId::SourceOfRecord, StreamFormat::Json, "fixtures/source_of_record/sample.json"),
        &root,
        &options(),
    )
    .expect("open stream")
    .load()
    .await
    .expect("json stream");
    let csv = open_stream(
        &spec("sheet", SourceId::SourceOfRecord, StreamFormat::Csv, "fixtures/source_of_record/sample.csv"),
        &root,
        &options(),
    )
    .expect("open stream")
    .load()
    .await
    .expect("csv stream");

    assert_eq!(json.len(), 9);
    assert_eq!(csv.len(), 5);
    for (from_json, from_csv) in json.iter().zip(&csv) {
        assert_eq!(from_json.raw_url, from_csv.raw_url);
        assert_eq!(from_json.identifier(), from_csv.identifier());
        assert_eq!(
            from_json.text_attr(ATTR_BUSINESS_STATUS),
            from_csv.text_attr(ATTR_BUSINESS_STATUS)
        );
    }
    assert_eq!(json[2].text_attr(ATTR_CATEGORY), Some("Car Insurance"));
    assert_eq!(json[2].text_attr(ATTR_VERTICAL), Some("Insurance"));
    assert_eq!(csv[2].text_attr(ATTR_VERTICAL), Some("Insurance"));
    assert_eq!(json[0].text_attr("page_title"), Some("Best Personal Loans"));
}

#[tokio::test]
async fn warehouse_paths_expand_by_property() {
    let root = workspace_root();
    let rows = open_stream(
        &spec("warehouse", SourceId::Warehouse, StreamFormat::Json, "fixtures/warehouse/sample.json"),
        &root,
        &options(),
    )
    .expect("open stream")
    .load()
    .await
    .expect("warehouse stream");

    assert_eq!(rows.len(), 8, "row without url or page_path is skipped");
    assert!(rows.iter().all(|r| r.source == SourceId::Warehouse));
    assert!(rows
        .iter()
        .any(|r| r.raw_url == "https://www.expertise.com/tx/austin/plumbing/"));
    assert_eq!(
        rows[0].raw_url,
        "https://www.forbes.com/advisor/personal-loans/best-personal-loans/"
    );
    assert_eq!(
        rows[0].attr(ATTR_SESSION_COUNT).and_then(|v| v.as_i64()),
        Some(1520)
    );
}

#[tokio::test]
async fn crawl_updates_skip_blank_rows() {
    let root = workspace_root();
    let rows = open_stream(
        &spec("crawl_updates", SourceId::Crawl, StreamFormat::Json, "fixtures/crawl/sample.json"),
        &root,
        &options(),
    )
    .expect("open stream")
    .load()
    .await
    .expect("crawl stream");

    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.source == SourceId::Crawl));
    assert!(rows.iter().all(|r| r.attr(ATTR_UPDATED_AT).is_some()));
}

#[tokio::test]
async fn warehouse_csv_is_rejected_at_open() {
    let root = workspace_root();
    let err = open_stream(
        &spec("warehouse", SourceId::Warehouse, StreamFormat::Csv, "fixtures/warehouse/sample.json"),
        &root,
        &options(),
    )
    .err()
    .expect("warehouse csv must not open");
    assert!(err.to_string().contains("warehouse records cannot be read from Csv"));
}

#[tokio::test]
async fn fetch_fixture_reports_redirects_declared_canonicals_and_ambiguity() {
    let root = workspace_root();
    let fetcher = FixtureFetcher::from_path(root.join("fixtures/fetch/sample.json"), forbes_reconciler())
        .await
        .expect("fetch fixture");
    assert_eq!(fetcher.len(), 6);

    let redirect = fetcher
        .fetch("https://www.forbes.com/advisor/banking/old-savings-page")
        .await;
    assert_eq!(redirect.initial_status_code, 301);

    let declared = fetcher
        .fetch("https://www.forbes.com/advisor/credit-cards/best-travel-cards")
        .await;
    assert_eq!(declared.initial_status_code, 200);
    assert_eq!(
        declared.resolved_url.as_deref(),
        Some("https://www.forbes.com/advisor/credit-cards/best-travel-credit-cards/")
    );

    let ambiguous = fetcher.fetch("https://www.expertise.com/tx/austin/plumbing").await;
    assert!(!ambiguous.detected_reliably);

    let unknown = fetcher
        .fetch("https://www.forbes.com/advisor/home-warranty/best-home-warranty/")
        .await;
    assert_eq!(unknown.initial_status_code, 0);
}

#[tokio::test]
async fn annotator_fixture_attaches_evidence_to_every_value() {
    let root = workspace_root();
    let annotator = FixtureAnnotator::from_path(root.join("fixtures/annotations/sample.json"), forbes_reconciler())
        .await
        .expect("annotation fixture");
    let seen = chrono::Utc::now();

    let record = CatalogueRecord::observed(
        "p1",
        "http://forbes.com/advisor/car-insurance/cheapest-car-insurance",
        seen,
    );
    let annotation = annotator.annotate(&record).await.expect("annotate");
    assert_eq!(annotation.extractor_version, "annotator-fixture-v1");
    assert_eq!(annotation.has_coupons.value, Some(true));
    assert!(annotation.has_coupons.evidence.is_some());
    assert!(!annotation.has_promotions.is_populated());
    assert_eq!(
        annotation.brand_list.value.as_deref(),
        Some(&["GEICO".to_string(), "USAA".to_string(), "Travelers".to_string()][..])
    );

    let unknown = CatalogueRecord::observed("p2", "https://www.forbes.com/advisor/unknown", seen);
    let empty = annotator.annotate(&unknown).await.expect("annotate unknown");
    assert!(!empty.template_type.is_populated());
}
