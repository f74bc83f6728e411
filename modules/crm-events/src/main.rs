use crm_events::{Config, EventPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crm_events=debug,domain_events=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Config + broker (fail-fast)
    let cfg = Config::from_env()?;
    let pipeline = EventPipeline::start(&cfg).await?;

    for (event_type, route) in pipeline.producers().route_table() {
        tracing::debug!(
            event_type = %event_type,
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            queue = %route.queue,
            "Route"
        );
    }

    tracing::info!(
        bus_type = ?cfg.bus_type,
        exchange = %cfg.exchange_name,
        domains = pipeline.producers().domain_names().count(),
        "CRM event topology declared"
    );

    pipeline.shutdown().await?;
    Ok(())
}
