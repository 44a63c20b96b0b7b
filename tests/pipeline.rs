use chrono::{NaiveDate, TimeZone, Utc};
use market_report_verifier::audit::{ReportArchive, UNVERIFIED_BANNER};
use market_report_verifier::config::PipelineConfig;
use market_report_verifier::extraction::{ClaimExtractor, PatternExtractor};
use market_report_verifier::market::{InstrumentDictionary, StaticReferenceSource};
use market_report_verifier::models::{
    Article, ClaimStatus, InstrumentClass, Quote, ReferenceSnapshot, TerminalState,
};
use market_report_verifier::provider::{ModelCandidate, ScriptedBackend};
use market_report_verifier::store::{ArticleQuery, InMemoryArticleStore};
use market_report_verifier::{PipelineError, ReportPipeline, RunRequest};
use std::sync::Arc;

const GOOD_REPORT: &str = "\
## 市场概况
黄金报2050美元，涨幅0.8%【新闻1】。

## 投资主题
苹果公司股价收于190美元【新闻2】。

## 风险提示
海外流动性可能收紧【新闻1】。

## 投资建议
保持均衡配置【新闻2】。
";

/// Same structure, but the Apple price is off by more than 10%.
const CONTRADICTED_REPORT: &str = "\
## 市场概况
黄金报2050美元，涨幅0.8%【新闻1】。

## 投资主题
苹果公司股价收于210美元【新闻2】。

## 风险提示
海外流动性可能收紧【新闻1】。

## 投资建议
保持均衡配置【新闻2】。
";

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

fn articles() -> Vec<Article> {
    vec![
        Article {
            id: "1".to_string(),
            title: "黄金价格走高".to_string(),
            summary: "现货黄金受避险需求支撑。".to_string(),
            body: None,
            source: "财新".to_string(),
            link: Some("https://example.com/1".to_string()),
            published_at: Utc.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap(),
        },
        Article {
            id: "2".to_string(),
            title: "Apple shares steady".to_string(),
            summary: "AAPL closed flat ahead of earnings.".to_string(),
            body: None,
            source: "Reuters".to_string(),
            link: None,
            published_at: Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap(),
        },
    ]
}

fn quotes() -> StaticReferenceSource {
    let quote = |price: f64, change: f64| Quote {
        name: None,
        price,
        change_percent: Some(change),
        currency: "USD".to_string(),
        as_of: Utc::now(),
    };
    StaticReferenceSource::new()
        .with_quote("XAU", quote(2050.0, 0.8))
        .with_quote("AAPL", quote(190.0, -0.1))
}

fn pipeline(config: PipelineConfig, backend: Arc<ScriptedBackend>) -> ReportPipeline {
    ReportPipeline::from_config(
        &config,
        Arc::new(InMemoryArticleStore::with_articles(articles())),
        Arc::new(quotes()),
        vec![ModelCandidate::new(backend, "model-a")],
        Arc::new(InstrumentDictionary::builtin()),
    )
    .unwrap()
}

fn request() -> RunRequest {
    RunRequest::new(ArticleQuery::for_date(day()))
}

#[tokio::test]
async fn test_accepted_after_retry() {
    let backend = Arc::new(
        ScriptedBackend::new("scripted")
            .push_text(CONTRADICTED_REPORT)
            .push_text(GOOD_REPORT),
    );
    let pipeline = pipeline(PipelineConfig::default(), backend.clone());

    let envelope = pipeline.run(&request()).await.unwrap();
    let metadata = &envelope.metadata;

    assert_eq!(metadata.terminal_state, TerminalState::Accepted);
    assert!(metadata.accepted);
    assert_eq!(metadata.attempts_used, 2);
    assert_eq!(metadata.max_attempts, 3);
    assert_eq!(metadata.claim_stats.verified, 2);
    assert_eq!(metadata.claim_stats.contradicted, 0);
    assert_eq!(metadata.snapshot_size, 2);
    assert_eq!(metadata.articles_used, 2);
    assert_eq!(envelope.report_text, GOOD_REPORT);
    assert!(envelope.annotation_block.contains("Accepted on verification"));
    assert_eq!(backend.calls().len(), 2);

    // second prompt carries the first attempt's problems
    let retry_prompt = backend.last_user_prompt().unwrap();
    assert!(retry_prompt.contains("上一版本的问题"));
    assert!(retry_prompt.contains("contradicted claim"));
}

#[tokio::test]
async fn test_exhausted_returns_annotated_best_effort() {
    let mut config = PipelineConfig::default();
    config.controller.max_retries = 2;

    let backend = Arc::new(
        ScriptedBackend::new("scripted")
            .push_text(CONTRADICTED_REPORT)
            .push_text(CONTRADICTED_REPORT),
    );
    let pipeline = pipeline(config, backend.clone());

    let envelope = pipeline.run(&request()).await.unwrap();

    assert_eq!(envelope.metadata.terminal_state, TerminalState::Exhausted);
    assert!(!envelope.metadata.accepted);
    assert_eq!(envelope.metadata.attempts_used, 2);
    assert_eq!(envelope.metadata.claim_stats.contradicted, 1);
    assert!(envelope.metadata.score < 80.0);
    assert!(envelope.annotation_block.contains("NOT VERIFIED"));
    assert!(envelope.annotation_block.contains("苹果公司股价收于210美元"));
    assert!(envelope.render_document().starts_with(UNVERIFIED_BANNER));
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn test_no_articles_never_generates() {
    let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(GOOD_REPORT));
    let pipeline = pipeline(PipelineConfig::default(), backend.clone());

    let empty_day = RunRequest::new(ArticleQuery::for_date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
    let err = pipeline.run(&empty_day).await.unwrap_err();

    assert!(matches!(err, PipelineError::NoArticles(_)));
    assert!(err.is_terminal());
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_providers_fail_the_run() {
    let backend = Arc::new(ScriptedBackend::new("scripted").push_error("401 unauthorized"));
    let pipeline = pipeline(PipelineConfig::default(), backend.clone());

    let err = pipeline.run(&request()).await.unwrap_err();

    match err {
        PipelineError::AllProvidersFailed { failures } => {
            assert_eq!(failures.len(), 3);
            assert!(failures[0].contains("401 unauthorized"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test]
async fn test_skip_verification_single_pass() {
    let mut config = PipelineConfig::default();
    config.controller.skip_verification = true;

    let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(CONTRADICTED_REPORT));
    let pipeline = pipeline(config, backend.clone());

    let envelope = pipeline.run(&request()).await.unwrap();

    assert_eq!(envelope.metadata.terminal_state, TerminalState::Skipped);
    assert_eq!(envelope.metadata.attempts_used, 1);
    assert_eq!(envelope.metadata.claim_stats.total, 0);
    assert!(envelope.annotation_block.contains("Verification skipped"));
    assert_eq!(backend.calls().len(), 1);
}

#[tokio::test]
async fn test_unmatched_subject_is_not_contradicted() {
    let report = format!("{}\n特斯拉下跌3.2%【新闻2】。\n", GOOD_REPORT.trim_end());
    let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(&report));
    let pipeline = pipeline(PipelineConfig::default(), backend);

    let envelope = pipeline.run(&request()).await.unwrap();
    let stats = envelope.metadata.claim_stats;

    assert_eq!(stats.unmatched, 1);
    assert_eq!(stats.contradicted, 0);
    assert_eq!(stats.verified, 2);
    // one of three claims uncovered caps the score at 100 - 40/3
    assert!(envelope.metadata.score <= 86.67);
    assert!(envelope.metadata.accepted);
}

#[tokio::test]
async fn test_archive_receives_report() {
    let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(GOOD_REPORT));
    let archive = Arc::new(ReportArchive::new());
    let pipeline = pipeline(PipelineConfig::default(), backend).with_sink(archive.clone());

    let envelope = pipeline.run(&request()).await.unwrap();
    let run_id = envelope.metadata.run_id;

    let stored = archive.get(run_id).await.unwrap();
    assert_eq!(stored, envelope);
    assert!(archive.verify_integrity(run_id).await.unwrap());
    assert_eq!(archive.list_for_range(day(), day()).await, vec![run_id]);
}

#[tokio::test]
async fn test_final_attempt_claims_are_labelled() {
    let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(CONTRADICTED_REPORT));
    let mut config = PipelineConfig::default();
    config.controller.max_retries = 1;
    let pipeline = pipeline(config, backend);

    let outcome = pipeline
        .controller()
        .run(
            market_report_verifier::provider::DEFAULT_REPORT_TEMPLATE,
            &ReferenceSnapshot::empty(Utc::now()),
            &articles(),
            None,
        )
        .await
        .unwrap();

    // nothing to compare against: every claim is unmatched
    assert!(outcome
        .final_attempt
        .verified_claims
        .iter()
        .all(|c| c.status == ClaimStatus::Unmatched));
    assert_eq!(outcome.terminal_state, TerminalState::Exhausted);
}

#[tokio::test]
async fn test_custom_template_reaches_the_model() {
    let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(GOOD_REPORT));
    let pipeline = pipeline(PipelineConfig::default(), backend.clone())
        .with_template("只写四个小节。模型：{{MODEL}}");

    pipeline.run(&request()).await.unwrap();

    let system = backend.last_system_prompt().unwrap();
    assert!(system.starts_with("只写四个小节。"));
}

#[test]
fn test_rebound_and_neutral_change_figures_verify() {
    let snapshot = ReferenceSnapshot::empty(Utc::now()).with_quote(
        InstrumentClass::Equity,
        "SH600519",
        Quote {
            name: Some("贵州茅台".to_string()),
            price: 1680.0,
            change_percent: Some(1.2),
            currency: "CNY".to_string(),
            as_of: Utc::now(),
        },
    );
    let extractor = PatternExtractor::new(Arc::new(InstrumentDictionary::builtin()));
    let verifier = market_report_verifier::verification::ClaimVerifier::default();

    for sentence in ["贵州茅台收于1680元，涨跌幅1.2%。", "贵州茅台昨日下跌后今日反弹1.2%。"] {
        let claims = extractor.extract(sentence);
        assert_eq!(claims.len(), 1, "{}", sentence);

        let verified = verifier.verify(&claims, &snapshot);
        assert_eq!(verified[0].status, ClaimStatus::Verified, "{}", sentence);
    }
}
