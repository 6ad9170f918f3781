use anyhow::Result;
use nemprices::{
    collect::{Collector, Supervisor},
    config::Config,
    fetch::HttpReportSource,
    history::PriceHistory,
};
use std::{env, sync::Arc};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Once,
    Watch,
    Dump,
}

fn parse_mode() -> Result<Mode> {
    let mut mode = Mode::Once;
    for arg in env::args().skip(1) {
        mode = match arg.as_str() {
            "--watch" => Mode::Watch,
            "--dump" => Mode::Dump,
            "--once" => Mode::Once,
            other => anyhow::bail!(
                "unknown argument `{}` (expected --once, --watch or --dump)",
                other
            ),
        };
    }
    Ok(mode)
}

// ─── wire the collector ──────────────────────────────────────────────
fn build_supervisor(cfg: &Config, history: Arc<PriceHistory>) -> Result<Supervisor> {
    let client = HttpReportSource::build_client(&cfg.user_agent, cfg.http_timeout())?;
    let source = Arc::new(HttpReportSource::new(client, cfg.limits()));
    let collector = Collector::new(source, cfg.max_attempts, cfg.attempt_delay());
    Ok(Supervisor::new(collector, cfg.price_feeds(), Some(history)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.parse().unwrap_or(Level::INFO.into())),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = parse_mode()?;

    // ─── 2) config + history ─────────────────────────────────────────
    let cfg = Config::load()?;
    let history = PriceHistory::new_prices(&cfg.data_dir)?;
    info!(data_dir = %cfg.data_dir.display(), ?mode, "startup");

    match mode {
        Mode::Dump => {
            let mut rows = history.load_all()?;
            rows.sort_by(|a, b| {
                (a.settlement_time, a.region).cmp(&(b.settlement_time, b.region))
            });
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Mode::Once => {
            let supervisor = build_supervisor(&cfg, history)?;
            for collection in supervisor.run_once().await {
                println!("{}", serde_json::to_string_pretty(&collection)?);
            }
            if let Some(err) = supervisor.status().last_error {
                anyhow::bail!("collection failed: {}", err);
            }
        }
        Mode::Watch => {
            let supervisor = build_supervisor(&cfg, history)?;
            supervisor.start(cfg.poll_interval()).await?;
            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received; stopping");
            supervisor.stop().await?;
            info!(status = ?supervisor.status(), "final state");
        }
    }

    Ok(())
}
