//! Market trade engine.
//!
//! Decides per cycle whether and what to trade on the peer-to-peer
//! market: parking resources against storage overflow, cancelling
//! contradictory or stale own offers, accepting matching offers from
//! other players, and finally posting a new own offer for the greatest
//! outstanding need — all within rate limits and safety reserves.

use anyhow::Result;
use chrono::{Local, Timelike, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::MarketConfig;
use crate::net::{GameClient, Reporter};
use crate::scrape::MarketScraper;
use crate::tracker::ResourceTracker;
use crate::types::{Resource, TradeOffer};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Smallest need worth posting an offer for.
const MIN_TRADE_AMOUNT: i64 = 250;

/// Amount of each resource that is never traded away.
const MARKET_RESERVE: i64 = 500;

/// Chunk size moved to the market when storage overflows.
const SAFEKEEPING_CHUNK: i64 = 1000;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Round a needed amount down to the nearest multiple of ten.
fn round_down_ten(amount: i64) -> i64 {
    amount - amount.rem_euclid(10)
}

/// Whether `hour` falls inside the configured no-trading window.
/// A window with `start > end` wraps past midnight.
fn quiet_window_active(window: Option<crate::config::QuietWindow>, hour: u32) -> bool {
    match window {
        Some(window) if window.start <= window.end => hour >= window.start && hour < window.end,
        Some(window) => hour >= window.start || hour < window.end,
        None => false,
    }
}

/// Format a wait duration as `H:MM:SS`, wrapping at 24 hours.
fn readable_wait(seconds: i64) -> String {
    let seconds = seconds.rem_euclid(24 * 3600);
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        seconds % 3600 / 60,
        seconds % 60
    )
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-settlement trade engine. Holds only engine-local pacing state;
/// all resource ledgers live in the `ResourceTracker` passed into each
/// call.
pub struct MarketEngine<C: GameClient, R: Rng = StdRng> {
    client: Arc<C>,
    reporter: Arc<dyn Reporter>,
    settlement_id: u64,
    config: MarketConfig,
    scraper: MarketScraper,
    /// Counterpart picker for safekeeping trades; injected so tests can
    /// force determinism.
    rng: R,
    /// Unix timestamp of the last real (non-safekeeping) offer.
    last_trade: i64,
    /// Whether an own offer from a previous cycle may still be open.
    placed_offer: bool,
}

impl<C: GameClient> MarketEngine<C, StdRng> {
    pub fn new(
        client: Arc<C>,
        reporter: Arc<dyn Reporter>,
        settlement_id: u64,
        config: MarketConfig,
    ) -> Result<Self> {
        Self::with_rng(client, reporter, settlement_id, config, StdRng::from_entropy())
    }
}

impl<C: GameClient, R: Rng> MarketEngine<C, R> {
    pub fn with_rng(
        client: Arc<C>,
        reporter: Arc<dyn Reporter>,
        settlement_id: u64,
        config: MarketConfig,
        rng: R,
    ) -> Result<Self> {
        Ok(Self {
            client,
            reporter,
            settlement_id,
            config,
            scraper: MarketScraper::new()?,
            rng,
            last_trade: 0,
            placed_offer: false,
        })
    }

    /// Backdate or clear the trade pacing clock (used by tests and by
    /// schedulers restoring state).
    pub fn set_last_trade(&mut self, timestamp: i64) {
        self.last_trade = timestamp;
    }

    pub fn last_trade(&self) -> i64 {
        self.last_trade
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn in_quiet_window(&self, hour: u32) -> bool {
        quiet_window_active(self.config.quiet_window, hour)
    }

    fn screen_url(&self, mode: &str) -> String {
        format!(
            "game.php?village={}&screen=market&mode={mode}",
            self.settlement_id
        )
    }

    // -- Cycle entry point -----------------------------------------------

    /// Run one market management cycle.
    pub async fn manage_market(
        &mut self,
        tracker: &mut ResourceTracker,
        drop_existing: bool,
    ) -> Result<()> {
        // Park resources on the market if storage is overflowing.
        self.manage_full_resource(tracker).await?;

        // Offering something we also need is contradictory: clear
        // everything and let the next cycle start fresh.
        let conflicts = tracker.conflicting_offers();
        if !conflicts.is_empty() {
            debug!(?conflicts, "Needed resource currently offered on the market");
            self.cancel_own_offers(tracker).await?;
            return Ok(());
        }

        let now = Self::now();
        let next_allowed = self.last_trade + (3600.0 * self.config.trade_max_per_hour) as i64;
        if next_allowed > now {
            debug!(wait = %readable_wait(next_allowed - now), "Not trading yet");
            return Ok(());
        }

        let hour = Local::now().hour();
        if self.in_quiet_window(hour) {
            debug!(hour, "Not managing trades during quiet window");
            return Ok(());
        }

        // One own offer at a time: clear the previous one unless it is
        // holding safekept resources.
        if self.placed_offer && drop_existing && tracker.safekept_is_empty() {
            self.cancel_own_offers(tracker).await?;
        }

        let Some(surplus) = tracker.surplus_resource() else {
            return Ok(());
        };
        if tracker.in_need_of(surplus) {
            return Ok(());
        }
        let Some((item, amount)) = tracker.greatest_need() else {
            return Ok(());
        };

        let mut how_many = round_down_ten(amount);

        let page = self.client.get_screen(&self.screen_url("other_offer")).await?;
        let incoming = self.scraper.incoming_resources(&page);
        if !incoming.is_empty() {
            info!(?incoming, "There are resources incoming");
        }
        if incoming.get(&item).copied().unwrap_or(0) >= how_many {
            info!(resource = %item, "Needed resource already incoming");
            return Ok(());
        }

        if how_many < MIN_TRADE_AMOUNT {
            return Ok(());
        }

        debug!("Checking current market offers");
        how_many -= self.check_other_offers(tracker, item, how_many, surplus).await?;
        if how_many <= 0 {
            info!("Existing offers covered the need");
            return Ok(());
        }

        if how_many > self.config.max_trade_amount {
            debug!(
                capped = self.config.max_trade_amount,
                requested = how_many,
                "Lowering trade amount because of limitation"
            );
            how_many = self.config.max_trade_amount;
        }

        let biased = (how_many as f64 * self.config.trade_bias) as i64;
        if tracker.amount(surplus) < biased {
            debug!(resource = %surplus, "Cannot trade because of insufficient resources");
            return Ok(());
        }

        info!(
            buy = how_many,
            buy_resource = %item,
            sell = biased,
            sell_resource = %surplus,
            "Adding market trade"
        );
        self.reporter.report(
            self.settlement_id,
            "MARKET",
            &format!("Adding market trade of {how_many} {item} -> {biased} {surplus}"),
        );

        self.place_offer(tracker, surplus, biased, item, how_many, true).await?;
        Ok(())
    }

    // -- Overflow safekeeping --------------------------------------------

    /// When a resource hits the storage cap, park a chunk of it on the
    /// market as a placeholder offer (not meant to execute) so it stops
    /// counting against storage. Reclaim everything once storage can take
    /// it back.
    pub async fn manage_full_resource(&mut self, tracker: &mut ResourceTracker) -> Result<()> {
        let full = tracker.full_resources();
        if !full.is_empty() {
            info!("Settlement storage is full, moving resources to the market for safekeeping");
            for resource in full {
                let counterparts: Vec<Resource> = Resource::TRADABLE
                    .iter()
                    .copied()
                    .filter(|r| *r != resource)
                    .collect();
                let Some(&counterpart) = counterparts.choose(&mut self.rng) else {
                    continue;
                };
                info!(
                    keep = %resource,
                    against = %counterpart,
                    "Adding resource to market for safekeeping"
                );
                if self
                    .place_offer(
                        tracker,
                        resource,
                        SAFEKEEPING_CHUNK,
                        counterpart,
                        SAFEKEEPING_CHUNK,
                        false,
                    )
                    .await?
                {
                    tracker.deduct(resource, SAFEKEEPING_CHUNK);
                    tracker.safekept_add(resource, SAFEKEEPING_CHUNK);
                }
            }
        } else if !tracker.safekept_is_empty() {
            info!("Resources kept safe, checking if storage can take them back");
            if tracker.can_reabsorb_safekept() {
                info!("Enough storage to remove all resources from the market");
                self.cancel_own_offers(tracker).await?;
                tracker.safekept_clear();
            }
        }
        Ok(())
    }

    // -- Existing-offer scan ---------------------------------------------

    /// Try to satisfy `how_many` of `item` by accepting an existing offer
    /// paid in `sell`. Returns the fulfilled amount (0 when nothing
    /// matched or we are unwilling to sell).
    pub async fn check_other_offers(
        &mut self,
        tracker: &mut ResourceTracker,
        item: Resource,
        how_many: i64,
        sell: Resource,
    ) -> Result<i64> {
        // Always keep a reserve in the bank.
        let willing_to_sell =
            tracker.amount(sell) - tracker.in_need_amount(sell) - MARKET_RESERVE;
        if willing_to_sell < 0 {
            debug!(
                resource = %sell,
                held = tracker.amount(sell),
                "Not willing to sell"
            );
            return Ok(0);
        }

        let page = self.client.get_screen(&self.screen_url("other_offer")).await?;
        let rows = self.scraper.offer_rows(&page);

        let mut how_many = how_many;
        let incoming = self.scraper.incoming_resources(&page);
        if !incoming.is_empty() {
            debug!(?incoming, "Resources incoming");
        }
        if let Some(&inbound) = incoming.get(&item) {
            how_many -= inbound;
            if how_many < 1 {
                info!(resource = %item, "Requested resource already incoming");
                return Ok(0);
            }
        }

        debug!(
            offers = rows.len(),
            willing_to_sell,
            sell_resource = %sell,
            "Scanning market offers"
        );

        let offers: Vec<TradeOffer> = rows
            .iter()
            .filter_map(|row| self.scraper.parse_offer(row))
            .collect();

        let matches = |offer: &TradeOffer| {
            offer.offered == item && offer.wanted == sell && offer.wanted_amount <= willing_to_sell
        };

        // First pass: offers that cover the full remaining need.
        for offer in &offers {
            if matches(offer) && offer.offer_amount >= how_many {
                info!(offer = %offer, "Good offer");
                return self.accept_offer(tracker, offer).await;
            }
        }
        // Fallback: any matching offer, even a partial one.
        for offer in &offers {
            if matches(offer) {
                info!(offer = %offer, "Decent offer");
                return self.accept_offer(tracker, offer).await;
            }
        }

        // No useful offers found.
        Ok(0)
    }

    async fn accept_offer(
        &mut self,
        tracker: &mut ResourceTracker,
        offer: &TradeOffer,
    ) -> Result<i64> {
        let token = self.client.csrf_token().to_string();
        let url = format!(
            "{}&action=accept_multi&start=0&id={}&h={token}",
            self.screen_url("other_offer"),
            offer.id
        );
        let form = vec![
            ("count".to_string(), "1".to_string()),
            ("id".to_string(), offer.id.to_string()),
            ("h".to_string(), token),
        ];
        self.client.post_action(&url, &form).await?;

        // Optimistic local accounting: the wanted amount leaves our stock
        // immediately.
        tracker.deduct(offer.wanted, offer.wanted_amount);
        Ok(offer.offer_amount)
    }

    // -- Own offer management --------------------------------------------

    /// Post a new own offer: sell `sell_amount` of `sell` for
    /// `buy_amount` of `buy`. Returns false without side effects when the
    /// market reports no available merchants.
    async fn place_offer(
        &mut self,
        tracker: &mut ResourceTracker,
        sell: Resource,
        sell_amount: i64,
        buy: Resource,
        buy_amount: i64,
        set_trade_time: bool,
    ) -> Result<bool> {
        let page = self.client.get_screen(&self.screen_url("own_offer")).await?;
        if self.scraper.merchants_exhausted(&page) {
            debug!("Not trading because no merchants are available");
            return Ok(false);
        }

        let form = vec![
            ("res_sell".to_string(), sell.to_string()),
            ("sell".to_string(), sell_amount.to_string()),
            ("res_buy".to_string(), buy.to_string()),
            ("buy".to_string(), buy_amount.to_string()),
            (
                "max_time".to_string(),
                self.config.trade_max_duration_hours.to_string(),
            ),
            ("multi".to_string(), "1".to_string()),
            ("h".to_string(), self.client.csrf_token().to_string()),
        ];
        let url = format!("{}&action=new_offer", self.screen_url("own_offer"));
        self.client.post_action(&url, &form).await?;

        if set_trade_time {
            self.placed_offer = true;
            self.last_trade = Self::now();
        }
        tracker.on_market_add(sell, sell_amount);
        Ok(true)
    }

    /// Cancel every open offer owned by this settlement and reset the
    /// own-offer ledger.
    pub async fn cancel_own_offers(&mut self, tracker: &mut ResourceTracker) -> Result<()> {
        self.placed_offer = false;
        let page = self.client.get_screen(&self.screen_url("all_own_offer")).await?;
        for (offer_id, owner) in self.scraper.own_offers(&page) {
            if owner != self.settlement_id {
                continue;
            }
            let form = vec![
                (format!("id_{offer_id}"), "on".to_string()),
                ("delete".to_string(), "Delete".to_string()),
                ("h".to_string(), self.client.csrf_token().to_string()),
            ];
            let url = format!(
                "{}&action=delete_offers",
                self.screen_url("all_own_offer")
            );
            self.client.post_action(&url, &form).await?;
            info!(offer_id, "Removing own offer from the market");
        }
        tracker.on_market_clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
