//! Markup extraction for scraped game screens.
//!
//! The game exposes no API; everything the agent knows about the market
//! comes from scraped HTML and embedded JSON blobs. All knowledge of the
//! markup format lives here, behind small typed functions, so the trade
//! and premium logic stays independent of it and testable against
//! constructed fragments. Treat the patterns as a versioned contract
//! with the game's markup.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::warn;

use crate::types::{Resource, SettlementSnapshot, TradeOffer};

// ---------------------------------------------------------------------------
// Amount and name helpers
// ---------------------------------------------------------------------------

/// Parse an amount out of scraped cell text by keeping only the digits,
/// which strips thousands separators and stray markup. `None` when the
/// text contains no digits at all.
pub fn parse_amount(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Derive the coarse map region ("continent") from a settlement display
/// name like `"Northpost (512|387) K35"`. The continent number is
/// `y/100 * 10 + x/100`.
pub fn continent(display_name: &str) -> Option<String> {
    static COORDS: OnceLock<Option<Regex>> = OnceLock::new();
    let re = COORDS
        .get_or_init(|| Regex::new(r"\((\d+)\|(\d+)\)").ok())
        .as_ref()?;
    let caps = re.captures(display_name)?;
    let x: i64 = caps[1].parse().ok()?;
    let y: i64 = caps[2].parse().ok()?;
    Some(format!("K{}", y / 100 * 10 + x / 100))
}

// ---------------------------------------------------------------------------
// Premium exchange data
// ---------------------------------------------------------------------------

/// Premium exchange state embedded in the exchange screen.
#[derive(Debug, Clone)]
pub struct PremiumSummary {
    /// Exchange stock per resource.
    pub stock: BTreeMap<Resource, i64>,
    /// Current exchange rate per resource.
    pub rates: BTreeMap<Resource, f64>,
    /// Tax applied when buying from the exchange.
    pub buy_tax: f64,
    /// Historical average real rate per resource.
    pub averages: BTreeMap<Resource, f64>,
}

#[derive(Debug, Deserialize)]
struct PremiumBlob {
    stock: BTreeMap<String, f64>,
    rates: BTreeMap<String, f64>,
    tax: PremiumTax,
}

#[derive(Debug, Deserialize)]
struct PremiumTax {
    buy: f64,
}

#[derive(Debug, Deserialize)]
struct GameDataBlob {
    village: VillageBlob,
}

/// Village fields of the embedded game data. Resource amounts are
/// fractional server-side; they are floored to whole units.
#[derive(Debug, Deserialize)]
struct VillageBlob {
    name: String,
    display_name: String,
    wood: f64,
    stone: f64,
    iron: f64,
    pop: i64,
    pop_max: i64,
    storage_max: i64,
}

/// Server-issued ticket for the second phase of a premium exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeTicket {
    pub rate_hash: String,
    pub amount: i64,
    pub mb: i64,
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

/// Compiled extraction patterns for the market screens.
pub struct MarketScraper {
    offer_row: Regex,
    icon_cell: Regex,
    offer_id: Regex,
    status_icon: Regex,
    own_offer: Regex,
    premium_blob: Regex,
    avg_rates: Regex,
    game_data: Regex,
}

impl MarketScraper {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            offer_row: Regex::new(r"(?s)<!-- insert the offer -->\s*<tr>(.*?)</tr>")?,
            icon_cell: Regex::new(r#"<span class="icon header (\w+)"[^>]*></span>([^<]*)</td>"#)?,
            offer_id: Regex::new(r#"<input type="hidden" name="id" value="(\d+)"#)?,
            status_icon: Regex::new(r#""icon header (\w+)"[^>]*></span>([^<]*)<"#)?,
            own_offer: Regex::new(r#"(?s)data-id="(\d+)".*?data-village="(\d+)""#)?,
            premium_blob: Regex::new(r"(?s)PremiumExchange\.receiveData\(\s*(\{.*?\})\s*\)\s*;")?,
            avg_rates: Regex::new(r#"(?s)"avg_exchange_rates"\s*:\s*(\{.*?\})"#)?,
            game_data: Regex::new(r"(?s)updateGameData\((\{.*?\})\)\s*;")?,
        })
    }

    // -- Game state ------------------------------------------------------

    /// Extract the authoritative settlement state embedded in any game
    /// screen. `None` when the blob is missing or malformed.
    pub fn settlement_snapshot(&self, page: &str) -> Option<SettlementSnapshot> {
        let blob = self.game_data.captures(page)?[1].to_string();
        let data: GameDataBlob = match serde_json::from_str(&blob) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Malformed game data blob");
                return None;
            }
        };

        let v = data.village;
        Some(SettlementSnapshot {
            name: v.name,
            display_name: v.display_name,
            wood: v.wood as i64,
            stone: v.stone as i64,
            iron: v.iron as i64,
            pop: v.pop,
            pop_max: v.pop_max,
            storage_max: v.storage_max,
        })
    }

    // -- Offer parser ----------------------------------------------------

    /// Split the other-offers screen into individual offer row fragments,
    /// in page order.
    pub fn offer_rows<'a>(&self, page: &'a str) -> Vec<&'a str> {
        self.offer_row
            .captures_iter(page)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    /// Parse one offer row fragment into a structured offer.
    ///
    /// A row without the hidden `id` input has no accept form, which the
    /// game renders when the viewer lacks the resources to fulfil it —
    /// such rows are skipped without noise.
    pub fn parse_offer(&self, fragment: &str) -> Option<TradeOffer> {
        let id: u64 = self.offer_id.captures(fragment)?[1].parse().ok()?;

        let mut cells = self.icon_cell.captures_iter(fragment);
        let offered_cap = cells.next()?;
        let wanted_cap = cells.next()?;

        let offered: Resource = match offered_cap[1].parse() {
            Ok(r) => r,
            Err(_) => {
                warn!(kind = &offered_cap[1], "Unknown offered resource in offer row");
                return None;
            }
        };
        let wanted: Resource = match wanted_cap[1].parse() {
            Ok(r) => r,
            Err(_) => {
                warn!(kind = &wanted_cap[1], "Unknown wanted resource in offer row");
                return None;
            }
        };

        Some(TradeOffer {
            id,
            offered,
            offer_amount: parse_amount(&offered_cap[2])?,
            wanted,
            wanted_amount: parse_amount(&wanted_cap[2])?,
        })
    }

    // -- Incoming-resource parser ----------------------------------------

    /// Resources currently inbound via active merchant transports, read
    /// from the market status bar. Malformed entries are logged and
    /// skipped; this never fails.
    pub fn incoming_resources(&self, page: &str) -> BTreeMap<Resource, i64> {
        let mut incoming = BTreeMap::new();

        let Some(start) = page.find("market_status_bar") else {
            return incoming;
        };
        let section = &page[start..];
        let section = match section.find("</div>") {
            Some(end) => &section[..end],
            None => section,
        };

        for caps in self.status_icon.captures_iter(section) {
            let kind = &caps[1];
            let text = &caps[2];
            let Ok(resource) = kind.parse::<Resource>() else {
                warn!(kind, "Unable to parse incoming resources: unknown kind");
                continue;
            };
            let Some(amount) = parse_amount(text) else {
                warn!(kind, text, "Unable to parse incoming resources: bad amount");
                continue;
            };
            *incoming.entry(resource).or_insert(0) += amount;
        }

        incoming
    }

    // -- Own offers ------------------------------------------------------

    /// All `(offer_id, village_id)` pairs on the own-offers overview.
    pub fn own_offers(&self, page: &str) -> Vec<(u64, u64)> {
        self.own_offer
            .captures_iter(page)
            .filter_map(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
            .collect()
    }

    /// Whether the new-offer screen reports zero available merchants.
    pub fn merchants_exhausted(&self, page: &str) -> bool {
        page.contains(r#"market_merchant_available_count">0"#)
    }

    // -- Premium exchange ------------------------------------------------

    /// Extract the premium exchange state from the exchange screen.
    /// `None` when the embedded data blob or the average rates are
    /// missing or malformed.
    pub fn premium_summary(&self, page: &str) -> Option<PremiumSummary> {
        let blob_text = self.premium_blob.captures(page)?[1].to_string();
        let blob: PremiumBlob = match serde_json::from_str(&blob_text) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Malformed premium exchange data blob");
                return None;
            }
        };

        let avg_text = self.avg_rates.captures(page)?[1].to_string();
        let averages_raw: BTreeMap<String, f64> = match serde_json::from_str(&avg_text) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Malformed premium average rates");
                return None;
            }
        };

        let typed = |raw: &BTreeMap<String, f64>| -> BTreeMap<Resource, f64> {
            raw.iter()
                .filter_map(|(k, v)| Some((k.parse::<Resource>().ok()?, *v)))
                .filter(|(r, _)| r.is_tradable())
                .collect()
        };

        Some(PremiumSummary {
            stock: blob
                .stock
                .iter()
                .filter_map(|(k, v)| Some((k.parse::<Resource>().ok()?, *v as i64)))
                .filter(|(r, _)| r.is_tradable())
                .collect(),
            rates: typed(&blob.rates),
            buy_tax: blob.tax.buy,
            averages: typed(&averages_raw),
        })
    }

    /// Parse the `exchange_begin` response into the ticket needed for
    /// `exchange_confirm`. The server wraps it either as a bare object
    /// or as the first element of a `response` array.
    pub fn premium_confirm(&self, body: &str) -> Option<ExchangeTicket> {
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Malformed exchange_begin response");
                return None;
            }
        };

        let obj = match &value["response"] {
            serde_json::Value::Array(items) => items.first()?,
            serde_json::Value::Object(_) => &value["response"],
            _ => &value,
        };

        Some(ExchangeTicket {
            rate_hash: obj["rate_hash"].as_str()?.to_string(),
            amount: obj["amount"].as_i64()?,
            mb: obj["mb"].as_i64().unwrap_or(1),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
