//! QUARTERMASTER — settlement resource and market automation agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the authenticated game session, and runs the
//! snapshot→trade→premium loop with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use quartermaster::config::AppConfig;
use quartermaster::market::MarketEngine;
use quartermaster::net::{AlertSink, DiscordWebhook, GameClient, HttpSession, LogReporter};
use quartermaster::premium::PremiumAdvisor;
use quartermaster::scrape::MarketScraper;
use quartermaster::tracker::ResourceTracker;

const BANNER: &str = r#"
  ___  _   _   _    ____ _____ _____ ____
 / _ \| | | | / \  |  _ \_   _| ____|  _ \
| | | | | | |/ _ \ | |_) || | |  _| | |_) |
| |_| | |_| / ___ \|  _ < | | | |___|  _ <
 \__\_\\___/_/   \_\_| \_\|_| |_____|_| \_\

  QUARTERMASTER - Settlement Supply & Trade Agent
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        settlement_id = cfg.settlement.id,
        poll_interval_secs = cfg.agent.poll_interval_secs,
        "QUARTERMASTER starting up"
    );

    // -- Initialise components -------------------------------------------

    let cookie = AppConfig::resolve_env(&cfg.session.cookie_env)?;
    let csrf_token = AppConfig::resolve_env(&cfg.session.csrf_token_env)?;
    let session = Arc::new(HttpSession::new(&cfg.session.base_url, cookie, csrf_token)?);

    let alerts: Option<Arc<dyn AlertSink>> = match &cfg.alerts.discord_webhook_env {
        Some(env_name) => match AppConfig::resolve_env(env_name) {
            Ok(url) => Some(Arc::new(DiscordWebhook::new(url)?)),
            Err(e) => {
                warn!(error = %e, "Discord webhook not configured - alerts disabled");
                None
            }
        },
        None => None,
    };

    let scraper = MarketScraper::new()?;
    let mut tracker = ResourceTracker::new(cfg.market.ratio);
    let mut engine = MarketEngine::new(
        Arc::clone(&session),
        Arc::new(LogReporter),
        cfg.settlement.id,
        cfg.market.clone(),
    )?;
    let advisor = PremiumAdvisor::new(
        Arc::clone(&session),
        alerts,
        cfg.settlement.id,
        cfg.premium.trade_enabled,
    )?;

    // -- Main loop -------------------------------------------------------

    let poll_interval = Duration::from_secs(cfg.agent.poll_interval_secs);
    let mut interval = tokio::time::interval(poll_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let overview_url = format!("game.php?village={}&screen=overview", cfg.settlement.id);

    info!(
        interval_secs = cfg.agent.poll_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_cycle(
                    &*session, &scraper, &overview_url,
                    &mut tracker, &mut engine, &advisor,
                ).await {
                    Ok(()) => {}
                    Err(e) => error!(error = %e, "Cycle failed - continuing to next"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("QUARTERMASTER shut down cleanly.");
    Ok(())
}

/// Run a single snapshot -> trade -> premium cycle.
async fn run_cycle(
    session: &HttpSession,
    scraper: &MarketScraper,
    overview_url: &str,
    tracker: &mut ResourceTracker,
    engine: &mut MarketEngine<HttpSession>,
    advisor: &PremiumAdvisor<HttpSession>,
) -> Result<()> {
    let page = session.get_screen(overview_url).await?;
    let Some(snapshot) = scraper.settlement_snapshot(&page) else {
        warn!("Overview screen carried no game data - skipping cycle");
        return Ok(());
    };
    tracker.update(&snapshot);
    info!(
        settlement = %tracker.name(),
        wood = snapshot.wood,
        stone = snapshot.stone,
        iron = snapshot.iron,
        free_pop = snapshot.free_pop(),
        "Snapshot updated"
    );

    engine.manage_market(tracker, true).await?;
    advisor.do_premium_stuff(tracker).await?;
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quartermaster=info"));

    let json_logging = std::env::var("QUARTERMASTER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
