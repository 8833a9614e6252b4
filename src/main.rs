use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use servicemap::gateway::HttpSearchGateway;
use servicemap::notify::CollectingNotifier;
use servicemap::query::QueryLimits;
use servicemap::server::HttpServer;
use servicemap::services::list_services;
use servicemap::{build_service_map, AnalyticsMode, Config, Dsl, TraceAnalytics};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "servicemap")]
#[command(about = "Service dependency maps and service tables from trace analytics indices")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Build one service map and print it as JSON
    ServiceMap {
        #[command(flatten)]
        query: QueryArgs,
        /// Skip the latency / error-rate / throughput query
        #[arg(long)]
        no_metrics: bool,
    },
    /// Print the services table as JSON
    Services {
        #[command(flatten)]
        query: QueryArgs,
    },
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// data_prepper, custom_data_prepper or jaeger (defaults to config)
    #[arg(long)]
    mode: Option<AnalyticsMode>,
    /// Window start, date math such as now-15m
    #[arg(long, default_value = "now-15m")]
    start: String,
    #[arg(long, default_value = "now")]
    end: String,
    /// Data source id from search.data_sources
    #[arg(long)]
    data_source: Option<String>,
}

fn analytics(config: &Config, notifier: Arc<CollectingNotifier>) -> Result<TraceAnalytics> {
    let gateway = HttpSearchGateway::new(config.search.clone())?;
    Ok(TraceAnalytics::new(Arc::new(gateway))
        .with_notifier(notifier)
        .with_limits(QueryLimits {
            max_nodes: config.search.max_nodes,
            max_edges: config.search.max_edges,
        }))
}

fn print_notifications(notifier: &CollectingNotifier) {
    for notification in notifier.take() {
        eprintln!("{}: {}", notification.title, notification.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first so its log level can seed the logger
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", &config.servicemap.log_level),
    )
    .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            log::info!("Starting servicemap v{}", env!("CARGO_PKG_VERSION"));
            let server = HttpServer::new(&config)?;
            server.run().await?;
        }
        Command::ServiceMap { query, no_metrics } => {
            let notifier = Arc::new(CollectingNotifier::new());
            let ctx = analytics(&config, notifier.clone())?;
            let mode = query.mode.unwrap_or(config.servicemap.default_mode);
            let dsl = Dsl::new().with_time_range(query.start, query.end);

            let graph = build_service_map(&ctx, &dsl, mode, query.data_source.as_deref(), !no_metrics, None).await;
            print_notifications(&notifier);
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Command::Services { query } => {
            let notifier = Arc::new(CollectingNotifier::new());
            let ctx = analytics(&config, notifier.clone())?;
            let mode = query.mode.unwrap_or(config.servicemap.default_mode);
            let dsl = Dsl::new().with_time_range(query.start, query.end);

            let services = list_services(&ctx, &dsl, mode, query.data_source.as_deref(), None).await;
            print_notifications(&notifier);
            println!("{}", serde_json::to_string_pretty(&services)?);
        }
    }

    Ok(())
}
