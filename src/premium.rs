//! Premium exchange advisor.
//!
//! Watches the premium exchange rates for each tradable resource, alerts
//! when the real rate (after buy tax) moves far enough from its
//! historical average, and opportunistically converts surplus resources
//! into premium currency via the two-phase begin/confirm exchange.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::net::{AlertSink, GameClient};
use crate::scrape::MarketScraper;
use crate::tracker::ResourceTracker;
use crate::types::{AlertMemo, Resource};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Real rate at or below this fraction of the average is a good sell.
const SELL_ALERT_FACTOR: f64 = 0.65;

/// Real rate at or above this fraction of the average is a good buy.
const BUY_ALERT_FACTOR: f64 = 1.45;

/// Repeat alerts for the same resource only after this many seconds,
/// unless the rate improved on the previous alert.
const ALERT_COOLDOWN_SECS: i64 = 3600;

/// Stock must exceed the nominal price by this factor before converting
/// surplus to premium currency.
const PREMIUM_PRICE_MARGIN: f64 = 1.1;

// ---------------------------------------------------------------------------
// Rate signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateSignal {
    GoodSell,
    GoodBuy,
}

/// Classify the real rate against its historical average.
fn rate_signal(real_rate: f64, average: f64) -> Option<RateSignal> {
    if real_rate < average * SELL_ALERT_FACTOR {
        Some(RateSignal::GoodSell)
    } else if real_rate > average * BUY_ALERT_FACTOR {
        Some(RateSignal::GoodBuy)
    } else {
        None
    }
}

/// Whether to notify: either the rate improved on the last alert for
/// this resource, or the cooldown has elapsed (anti-spam).
fn should_alert(signal: RateSignal, memo: AlertMemo, real_rate: f64, now: i64) -> bool {
    let improved = match signal {
        RateSignal::GoodSell => memo.rate > real_rate,
        RateSignal::GoodBuy => memo.rate < real_rate,
    };
    improved || memo.at + ALERT_COOLDOWN_SECS < now
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

pub struct PremiumAdvisor<C: GameClient> {
    client: Arc<C>,
    alerts: Option<Arc<dyn AlertSink>>,
    settlement_id: u64,
    trade_enabled: bool,
    scraper: MarketScraper,
}

impl<C: GameClient> PremiumAdvisor<C> {
    pub fn new(
        client: Arc<C>,
        alerts: Option<Arc<dyn AlertSink>>,
        settlement_id: u64,
        trade_enabled: bool,
    ) -> Result<Self> {
        Ok(Self {
            client,
            alerts,
            settlement_id,
            trade_enabled,
            scraper: MarketScraper::new()?,
        })
    }

    fn exchange_url(&self) -> String {
        format!(
            "game.php?village={}&screen=market&mode=exchange",
            self.settlement_id
        )
    }

    fn api_url(&self, action: &str) -> String {
        format!(
            "game.php?village={}&screen=market&ajaxaction={action}&h={}",
            self.settlement_id,
            self.client.csrf_token()
        )
    }

    /// Fetch the premium exchange state, emit rate alerts, and return the
    /// current nominal price per resource. `None` when the source data is
    /// malformed — callers skip the cycle.
    pub async fn check_premium_price(
        &self,
        tracker: &mut ResourceTracker,
    ) -> Result<Option<BTreeMap<Resource, f64>>> {
        let page = self.client.get_screen(&self.exchange_url()).await?;
        let Some(summary) = self.scraper.premium_summary(&page) else {
            warn!("Error reading premium exchange data");
            return Ok(None);
        };

        let mut prices = BTreeMap::new();
        let now = Utc::now().timestamp();

        for &resource in Resource::TRADABLE {
            let (Some(&stock), Some(&rate), Some(&average)) = (
                summary.stock.get(&resource),
                summary.rates.get(&resource),
                summary.averages.get(&resource),
            ) else {
                warn!(resource = %resource, "Premium exchange data incomplete");
                return Ok(None);
            };

            prices.insert(resource, stock as f64 * rate);
            let real_rate = 1.0 / rate / (summary.buy_tax + 1.0);

            let Some(signal) = rate_signal(real_rate, average) else {
                continue;
            };
            if !should_alert(signal, tracker.last_alert(resource), real_rate, now) {
                continue;
            }

            tracker.record_alert(resource, real_rate, now);
            let region = tracker.continent().unwrap_or("?");
            let direction = match signal {
                RateSignal::GoodSell => "sell",
                RateSignal::GoodBuy => "buy",
            };
            let message = format!(
                "Resource {resource} has a good {direction} ratio in {region} (1:{})",
                real_rate as i64
            );
            info!(resource = %resource, direction, rate = real_rate, "Premium rate alert");
            if let Some(sink) = &self.alerts {
                if let Err(e) = sink.send(&message).await {
                    warn!(error = %e, "Failed to deliver premium rate alert");
                }
            }
        }

        Ok(Some(prices))
    }

    /// Convert surplus resources into premium currency when the held
    /// amount comfortably exceeds the nominal price.
    pub async fn do_premium_stuff(&self, tracker: &mut ResourceTracker) -> Result<()> {
        let surplus = tracker.surplus_resource();
        let prices = self.check_premium_price(tracker).await?;
        debug!(
            surplus = ?surplus,
            enabled = self.trade_enabled,
            "Considering premium trade"
        );

        let (Some(surplus), Some(prices)) = (surplus, prices) else {
            return Ok(());
        };
        if !self.trade_enabled {
            return Ok(());
        }
        info!(?prices, "Current premium prices");

        let Some(&price) = prices.get(&surplus) else {
            return Ok(());
        };
        if price * PREMIUM_PRICE_MARGIN >= tracker.amount(surplus) as f64 {
            return Ok(());
        }

        info!(
            resource = %surplus,
            price = price as i64,
            "Attempting trade of resources for a premium point"
        );
        let sell_field = format!("sell_{surplus}");
        let begin_form = vec![(sell_field.clone(), "1".to_string())];
        let body = self
            .client
            .post_action(&self.api_url("exchange_begin"), &begin_form)
            .await?;

        let Some(ticket) = self.scraper.premium_confirm(&body) else {
            warn!("Premium exchange begin returned no usable ticket");
            return Ok(());
        };

        let confirm_form = vec![
            (sell_field, ticket.amount.to_string()),
            (format!("rate_{surplus}"), ticket.rate_hash.clone()),
            ("mb".to_string(), ticket.mb.to_string()),
        ];
        self.client
            .post_action(&self.api_url("exchange_confirm"), &confirm_form)
            .await?;
        info!(resource = %surplus, amount = ticket.amount, "Premium exchange confirmed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
