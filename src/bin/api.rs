use market_report_verifier::{
    api::start_server,
    audit::ReportArchive,
    config::PipelineConfig,
    market::{InstrumentDictionary, SinaQuoteSource},
    provider::configured_candidates,
    store::{ArticleStore, InMemoryArticleStore, PostgresArticleStore},
    ReportPipeline,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Market Report Verifier - API Server");
    info!("Port: {}", api_port);

    let config = PipelineConfig::from_env()?;

    let store: Arc<dyn ArticleStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => Arc::new(PostgresArticleStore::connect_lazy(&url)?),
        Err(_) => {
            warn!("DATABASE_URL not set - every report request will find no articles");
            Arc::new(InMemoryArticleStore::new())
        }
    };

    let candidates = configured_candidates(
        &config.provider,
        std::env::var("GEMINI_API_KEY").ok(),
        std::env::var("DEEPSEEK_API_KEY").ok(),
    )?;
    if candidates.is_empty() {
        warn!("Neither GEMINI_API_KEY nor DEEPSEEK_API_KEY is set - report requests will fail");
    }

    let dictionary = Arc::new(match std::env::var("INSTRUMENTS_FILE") {
        Ok(path) => InstrumentDictionary::from_file(path)?,
        Err(_) => InstrumentDictionary::builtin(),
    });

    let archive = Arc::new(ReportArchive::new());
    let pipeline = Arc::new(
        ReportPipeline::from_config(
            &config,
            store,
            Arc::new(SinaQuoteSource::new()?),
            candidates,
            dictionary,
        )?
        .with_sink(archive.clone()),
    );

    info!("Pipeline initialized");

    // Start API server
    start_server(pipeline, Some(archive), api_port).await?;

    Ok(())
}
