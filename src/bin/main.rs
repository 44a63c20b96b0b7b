use chrono::{NaiveDate, TimeZone, Utc};
use market_report_verifier::{
    audit::ReportArchive,
    config::PipelineConfig,
    market::{InstrumentDictionary, ReferenceDataSource, SinaQuoteSource, StaticReferenceSource},
    models::{Article, Quote},
    provider::{configured_candidates, ModelCandidate, ScriptedBackend},
    store::{collection_date_today, ArticleQuery, ArticleStore, InMemoryArticleStore, PostgresArticleStore},
    PipelineError, ReportPipeline, RunRequest,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_REPORT: &str = r#"## 市场概况
现货黄金报2050.5美元，涨幅0.8%，避险需求升温【新闻1】。贵州茅台收于1680元，上涨1.2%【新闻2】。

## 投资主题
消费龙头估值修复仍在延续，白酒板块资金回流【新闻2】。苹果公司发布新品，AAPL 下跌0.5%【新闻3】。

## 风险提示
美联储政策路径仍有不确定性，海外流动性可能收紧【新闻1】。

## 投资建议
保持均衡配置，关注黄金与消费板块的配置价值【新闻2】。

本报告由 demo-model 生成，仅供参考，不构成投资建议。
"#;

fn demo_articles(date: NaiveDate) -> Vec<Article> {
    let at = |hour: u32| {
        date.and_hms_opt(hour, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt))
            .unwrap_or_else(Utc::now)
    };
    vec![
        Article {
            id: "demo-1".to_string(),
            title: "金价走高，避险情绪升温".to_string(),
            summary: "现货黄金延续涨势，市场关注美联储议息会议。".to_string(),
            body: None,
            source: "财新".to_string(),
            link: None,
            published_at: at(1),
        },
        Article {
            id: "demo-2".to_string(),
            title: "白酒板块反弹，贵州茅台领涨".to_string(),
            summary: "消费板块资金回流，贵州茅台股价上行。".to_string(),
            body: None,
            source: "华尔街见闻".to_string(),
            link: None,
            published_at: at(3),
        },
        Article {
            id: "demo-3".to_string(),
            title: "Apple unveils new products".to_string(),
            summary: "AAPL shares slipped after the event.".to_string(),
            body: None,
            source: "Reuters".to_string(),
            link: None,
            published_at: at(5),
        },
    ]
}

fn demo_quotes() -> StaticReferenceSource {
    let quote = |price: f64, change: f64, currency: &str| Quote {
        name: None,
        price,
        change_percent: Some(change),
        currency: currency.to_string(),
        as_of: Utc::now(),
    };
    StaticReferenceSource::new()
        .with_quote("XAU", quote(2050.5, 0.8, "USD"))
        .with_quote("SH600519", quote(1680.0, 1.2, "CNY"))
        .with_quote("AAPL", quote(190.0, -0.5, "USD"))
}

fn parse_date(raw: Option<String>) -> Result<Option<NaiveDate>, Box<dyn std::error::Error>> {
    match raw {
        Some(raw) => Ok(Some(NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")?)),
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Market Report Verifier starting");

    let config = PipelineConfig::from_env()?;

    let mut args = std::env::args().skip(1);
    let start = parse_date(args.next())?.unwrap_or_else(collection_date_today);
    let end = parse_date(args.next())?.unwrap_or(start);

    let dictionary = Arc::new(match std::env::var("INSTRUMENTS_FILE") {
        Ok(path) => InstrumentDictionary::from_file(path)?,
        Err(_) => InstrumentDictionary::builtin(),
    });

    // Article store: Postgres when configured, otherwise demo data
    let demo = std::env::var("DATABASE_URL").is_err();
    let store: Arc<dyn ArticleStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => Arc::new(PostgresArticleStore::connect_lazy(&url)?),
        Err(_) => {
            warn!("DATABASE_URL not set - using demo articles");
            Arc::new(InMemoryArticleStore::with_articles(demo_articles(start)))
        }
    };

    let source: Arc<dyn ReferenceDataSource> = if demo {
        Arc::new(demo_quotes())
    } else {
        Arc::new(SinaQuoteSource::new()?)
    };

    let mut candidates = configured_candidates(
        &config.provider,
        std::env::var("GEMINI_API_KEY").ok(),
        std::env::var("DEEPSEEK_API_KEY").ok(),
    )?;
    if candidates.is_empty() {
        warn!("No model API keys set - using the scripted demo backend");
        let backend = Arc::new(ScriptedBackend::new("scripted").with_fallback(DEMO_REPORT));
        candidates.push(ModelCandidate::new(backend, "demo-model"));
    }

    let archive = Arc::new(ReportArchive::new());
    let mut pipeline = ReportPipeline::from_config(&config, store, source, candidates, dictionary)?
        .with_sink(archive.clone());
    if let Ok(path) = std::env::var("REPORT_TEMPLATE_FILE") {
        info!(path = %path, "Using custom report template");
        pipeline = pipeline.with_template(std::fs::read_to_string(path)?);
    }

    let request = RunRequest {
        query: ArticleQuery::range(start, end),
        model_hint: std::env::var("MODEL").ok(),
    };

    match pipeline.run(&request).await {
        Ok(envelope) => {
            info!(
                run_id = %envelope.metadata.run_id,
                terminal_state = %envelope.metadata.terminal_state,
                "Report ready"
            );
            println!("{}", envelope.render_document());
            Ok(())
        }
        Err(PipelineError::NoArticles(reason)) => {
            eprintln!("No input data: {}", reason);
            Err(Box::new(PipelineError::NoArticles(reason)) as Box<dyn std::error::Error>)
        }
        Err(e) => {
            eprintln!("Report generation failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
