//! Resource state tracking for one settlement.
//!
//! Holds current stock, storage capacity, and the outstanding resource
//! requests of other subsystems (construction, recruitment), and answers
//! the surplus/deficit questions the trade engine is built on. One
//! tracker instance is scoped to exactly one settlement; nothing here is
//! shared across settlements.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::scrape;
use crate::types::{AlertMemo, Resource, SettlementSnapshot};

/// Per-settlement resource ledger bundle.
///
/// All mutation happens through the single external scheduler driving
/// `update` → market management once per cycle; there is no internal
/// locking.
#[derive(Debug)]
pub struct ResourceTracker {
    stock: BTreeMap<Resource, i64>,
    storage: i64,
    /// Surplus threshold divisor: plentiful above `storage / ratio`.
    ratio: f64,
    /// Outstanding requests: consumer id → resource → amount.
    demand: BTreeMap<String, BTreeMap<Resource, i64>>,
    /// Amounts parked on the market purely to avoid overflow loss.
    safekept: BTreeMap<Resource, i64>,
    /// Approximate own open offers, by sold resource.
    on_market: BTreeMap<Resource, i64>,
    /// Last premium-rate alert per resource.
    alerts: BTreeMap<Resource, AlertMemo>,
    continent: Option<String>,
    name: String,
}

impl ResourceTracker {
    pub fn new(ratio: f64) -> Self {
        Self {
            stock: BTreeMap::new(),
            storage: 0,
            ratio,
            demand: BTreeMap::new(),
            safekept: BTreeMap::new(),
            on_market: BTreeMap::new(),
            alerts: BTreeMap::new(),
            continent: None,
            name: String::new(),
        }
    }

    // -- Snapshot ingestion ----------------------------------------------

    /// Replace stock and storage capacity from an authoritative game-state
    /// snapshot, then re-settle demand: any request already covered by the
    /// current stock is zeroed.
    pub fn update(&mut self, snapshot: &SettlementSnapshot) {
        self.stock.insert(Resource::Wood, snapshot.wood);
        self.stock.insert(Resource::Stone, snapshot.stone);
        self.stock.insert(Resource::Iron, snapshot.iron);
        self.stock.insert(Resource::Pop, snapshot.free_pop());
        self.storage = snapshot.storage_max;
        self.settle_demand();
        self.continent = scrape::continent(&snapshot.display_name);
        self.name = snapshot.name.clone();
    }

    fn settle_demand(&mut self) {
        for requests in self.demand.values_mut() {
            for (resource, amount) in requests.iter_mut() {
                if *amount <= self.stock.get(resource).copied().unwrap_or(0) {
                    *amount = 0;
                }
            }
        }
    }

    // -- Demand ledger ---------------------------------------------------

    /// Register a consumer's requirement. Last writer wins for the same
    /// (consumer, resource) pair; amounts do not accumulate.
    pub fn request(&mut self, consumer: &str, resource: Resource, amount: i64) {
        self.demand
            .entry(consumer.to_string())
            .or_default()
            .insert(resource, amount);
    }

    /// Whether any consumer still has positive demand for `resource`.
    pub fn in_need_of(&self, resource: Resource) -> bool {
        self.demand
            .values()
            .any(|requests| requests.get(&resource).copied().unwrap_or(0) > 0)
    }

    /// Total positive outstanding demand for `resource` across consumers.
    pub fn in_need_amount(&self, resource: Resource) -> i64 {
        self.demand
            .values()
            .filter_map(|requests| requests.get(&resource))
            .filter(|amount| **amount > 0)
            .sum()
    }

    /// The single (consumer, resource) entry with the largest positive
    /// amount. Ties go to the first entry in deterministic ledger order.
    pub fn greatest_need(&self) -> Option<(Resource, i64)> {
        let mut best: Option<(Resource, i64)> = None;
        for requests in self.demand.values() {
            for (&resource, &amount) in requests {
                if amount > 0 && amount > best.map_or(0, |(_, a)| a) {
                    best = Some((resource, amount));
                }
            }
        }
        best
    }

    /// A resource we hold well beyond the storage-relative threshold and
    /// that nobody needs. Ties go to the earlier resource in tie-break
    /// order; population slots are never surplus.
    pub fn surplus_resource(&self) -> Option<Resource> {
        let threshold = (self.storage as f64 / self.ratio) as i64;
        let mut best: Option<(Resource, i64)> = None;
        for (&resource, &held) in &self.stock {
            if resource == Resource::Pop || self.in_need_of(resource) {
                continue;
            }
            if held > threshold && held > best.map_or(0, |(_, a)| a) {
                best = Some((resource, held));
            }
        }
        if let Some((resource, held)) = best {
            debug!(resource = %resource, held, threshold, "Plenty of resource available");
        }
        best.map(|(resource, _)| resource)
    }

    /// Whether recruitment may proceed. With zero free population slots
    /// all recruitment demand is purged and the answer is no; otherwise
    /// recruitment waits until all non-recruitment demand is satisfied.
    pub fn can_recruit(&mut self) -> bool {
        if self.stock.get(&Resource::Pop).copied().unwrap_or(0) == 0 {
            info!(settlement = %self.name, "Can't recruit, no room for pops");
            self.demand.retain(|consumer, _| !consumer.contains("recruitment"));
            return false;
        }

        for (consumer, requests) in &self.demand {
            if consumer.contains("recruitment") {
                continue;
            }
            if requests.values().any(|amount| *amount > 0) {
                return false;
            }
        }
        true
    }

    // -- Stock -----------------------------------------------------------

    pub fn amount(&self, resource: Resource) -> i64 {
        self.stock.get(&resource).copied().unwrap_or(0)
    }

    /// Optimistically reduce local stock, e.g. when an offer is issued or
    /// accepted before the server confirms.
    pub fn deduct(&mut self, resource: Resource, amount: i64) {
        *self.stock.entry(resource).or_insert(0) -= amount;
    }

    pub fn storage(&self) -> i64 {
        self.storage
    }

    /// Tradable resources currently at full storage.
    pub fn full_resources(&self) -> Vec<Resource> {
        Resource::TRADABLE
            .iter()
            .copied()
            .filter(|r| self.amount(*r) == self.storage)
            .collect()
    }

    // -- Safekept ledger -------------------------------------------------

    pub fn safekept_is_empty(&self) -> bool {
        self.safekept.is_empty()
    }

    pub fn safekept_add(&mut self, resource: Resource, amount: i64) {
        *self.safekept.entry(resource).or_insert(0) += amount;
    }

    pub fn safekept_amount(&self, resource: Resource) -> i64 {
        self.safekept.get(&resource).copied().unwrap_or(0)
    }

    pub fn safekept_clear(&mut self) {
        self.safekept.clear();
    }

    /// Whether every safekept amount could return to storage without
    /// hitting the cap.
    pub fn can_reabsorb_safekept(&self) -> bool {
        self.safekept
            .iter()
            .all(|(resource, kept)| self.amount(*resource) + kept < self.storage)
    }

    // -- Own offers ------------------------------------------------------

    pub fn on_market_add(&mut self, resource: Resource, amount: i64) {
        *self.on_market.entry(resource).or_insert(0) += amount;
    }

    pub fn on_market_clear(&mut self) {
        self.on_market.clear();
    }

    /// Resources we are offering on the market while simultaneously
    /// needing them — a contradictory state the engine resolves by
    /// cancelling everything.
    pub fn conflicting_offers(&self) -> Vec<Resource> {
        self.on_market
            .keys()
            .copied()
            .filter(|resource| self.in_need_of(*resource))
            .collect()
    }

    // -- Premium alert memo ----------------------------------------------

    pub fn last_alert(&self, resource: Resource) -> AlertMemo {
        self.alerts.get(&resource).copied().unwrap_or_default()
    }

    pub fn record_alert(&mut self, resource: Resource, rate: f64, now: i64) {
        self.alerts.insert(resource, AlertMemo { rate, at: now });
    }

    // -- Metadata --------------------------------------------------------

    pub fn continent(&self) -> Option<&str> {
        self.continent.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
