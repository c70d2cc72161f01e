use clap::Parser;
use heimdall::{SentinelPool, SentinelPoolConfig};
use tracing::{error, info};
use tracing_appender::non_blocking;
// no EnvFilter feature; use a simple level switch via RUST_LOG

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "heimdall")]
#[command(about = "Sentinel-aware Redis connection pool")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "demos/sentinel.yaml")]
    config: String,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // Map RUST_LOG to a max level (debug/info/warn/error/trace)
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn run_with_config_path_and_shutdown(
    config_path: &str,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SentinelPoolConfig::from_yaml_file(config_path).await?;
    info!(
        "Watching master '{}' through {} sentinel(s)",
        config.master_name,
        config.sentinels.len()
    );

    let pool = SentinelPool::from_config(&config).await?;

    // Prove the pool can reach the master before settling in
    let check = async {
        let mut conn = pool.get_resource().await?;
        conn.ping().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    };
    if let Err(e) = check.await {
        error!("Master health check failed: {}", e);
        pool.destroy().await;
        return Err(e);
    }
    info!("Master '{}' at {}", pool.master_name(), pool.current_master().await);

    shutdown.await;
    info!("Shutdown signal received");

    let metrics = pool.metrics();
    info!(
        failovers = metrics.failovers,
        connections_created = metrics.connections_created,
        "Closing pool"
    );
    pool.destroy().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    info!("Starting Heimdall - Sentinel-aware Redis pool");
    run_with_config_path_and_shutdown(&args.config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    info!("Heimdall stopped");
    Ok(())
}
