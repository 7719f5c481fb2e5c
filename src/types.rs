//! Shared types for the QUARTERMASTER agent.
//!
//! These types form the data model used across all modules. They are
//! designed to be stable so that the scraping, tracking, and trading
//! modules can depend on them without circular references.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// A resource kind in the game.
///
/// The three material kinds are tradable on the market. `Pop` is the
/// population-slot pseudo-resource (free farm slots) — it is tracked and
/// can be demanded, but never traded.
///
/// The derived `Ord` is the documented tie-break order for all
/// "largest wins" selections: when two resources are equally eligible,
/// the one that sorts first is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Wood,
    Stone,
    Iron,
    Pop,
}

impl Resource {
    /// The market-tradable kinds, in tie-break order.
    pub const TRADABLE: &'static [Resource] = &[Resource::Wood, Resource::Stone, Resource::Iron];

    /// Lowercase name as used in game URLs, form payloads, and markup.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Wood => "wood",
            Resource::Stone => "stone",
            Resource::Iron => "iron",
            Resource::Pop => "pop",
        }
    }

    /// Whether this kind can be put on the market.
    pub fn is_tradable(&self) -> bool {
        *self != Resource::Pop
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Resource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wood" => Ok(Resource::Wood),
            "stone" | "clay" => Ok(Resource::Stone),
            "iron" => Ok(Resource::Iron),
            "pop" | "population" => Ok(Resource::Pop),
            _ => Err(anyhow::anyhow!("Unknown resource kind: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Settlement snapshot
// ---------------------------------------------------------------------------

/// Authoritative per-cycle snapshot of a settlement, as reported by the
/// game state. Consumed by `ResourceTracker::update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSnapshot {
    /// Short name, used for logging.
    pub name: String,
    /// Display name including map coordinates, e.g. `"Northpost (512|387) K35"`.
    pub display_name: String,
    pub wood: i64,
    pub stone: i64,
    pub iron: i64,
    /// Population currently in use.
    pub pop: i64,
    /// Population ceiling.
    pub pop_max: i64,
    /// Storage ceiling, shared by all three tradable kinds.
    pub storage_max: i64,
}

impl SettlementSnapshot {
    /// Free population slots (`pop_max - pop`).
    pub fn free_pop(&self) -> i64 {
        self.pop_max - self.pop
    }
}

// ---------------------------------------------------------------------------
// Market offers
// ---------------------------------------------------------------------------

/// One market offer parsed from a scraped offer row. Transient: produced
/// by the offer parser and consumed immediately by the trade engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeOffer {
    pub id: u64,
    pub offered: Resource,
    pub offer_amount: i64,
    pub wanted: Resource,
    pub wanted_amount: i64,
}

impl fmt::Display for TradeOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}: {} {} for {} {}",
            self.id, self.offer_amount, self.offered, self.wanted_amount, self.wanted,
        )
    }
}

// ---------------------------------------------------------------------------
// Premium exchange
// ---------------------------------------------------------------------------

/// Last premium-rate alert sent for one resource, used to suppress
/// duplicate notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertMemo {
    /// Real exchange rate at the time of the last alert.
    pub rate: f64,
    /// Unix timestamp of the last alert (0 = never alerted).
    pub at: i64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for QUARTERMASTER.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Game server error {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Alert delivery failed: {0}")]
    Alert(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Resource tests --

    #[test]
    fn test_resource_display() {
        assert_eq!(format!("{}", Resource::Wood), "wood");
        assert_eq!(format!("{}", Resource::Stone), "stone");
        assert_eq!(format!("{}", Resource::Iron), "iron");
        assert_eq!(format!("{}", Resource::Pop), "pop");
    }

    #[test]
    fn test_resource_from_str() {
        assert_eq!("wood".parse::<Resource>().unwrap(), Resource::Wood);
        assert_eq!(" Stone ".parse::<Resource>().unwrap(), Resource::Stone);
        assert_eq!("clay".parse::<Resource>().unwrap(), Resource::Stone);
        assert_eq!("IRON".parse::<Resource>().unwrap(), Resource::Iron);
        assert!("gold".parse::<Resource>().is_err());
    }

    #[test]
    fn test_resource_tradable() {
        assert_eq!(Resource::TRADABLE.len(), 3);
        assert!(Resource::Wood.is_tradable());
        assert!(!Resource::Pop.is_tradable());
        assert!(!Resource::TRADABLE.contains(&Resource::Pop));
    }

    #[test]
    fn test_resource_tie_break_order() {
        // Wood sorts before Stone sorts before Iron: this is the
        // documented deterministic tie-break.
        assert!(Resource::Wood < Resource::Stone);
        assert!(Resource::Stone < Resource::Iron);
    }

    #[test]
    fn test_resource_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Resource::Wood).unwrap(), "\"wood\"");
        let r: Resource = serde_json::from_str("\"iron\"").unwrap();
        assert_eq!(r, Resource::Iron);
    }

    // -- Snapshot tests --

    #[test]
    fn test_snapshot_free_pop() {
        let snap = SettlementSnapshot {
            name: "Northpost".to_string(),
            display_name: "Northpost (512|387) K35".to_string(),
            wood: 100,
            stone: 100,
            iron: 100,
            pop: 240,
            pop_max: 300,
            storage_max: 10_000,
        };
        assert_eq!(snap.free_pop(), 60);
    }

    // -- TradeOffer tests --

    #[test]
    fn test_trade_offer_display() {
        let offer = TradeOffer {
            id: 4711,
            offered: Resource::Iron,
            offer_amount: 500,
            wanted: Resource::Wood,
            wanted_amount: 450,
        };
        let display = format!("{offer}");
        assert!(display.contains("4711"));
        assert!(display.contains("iron"));
        assert!(display.contains("wood"));
    }

    // -- AgentError tests --

    #[test]
    fn test_agent_error_display() {
        let e = AgentError::Http {
            status: 503,
            url: "game.php?screen=market".to_string(),
        };
        assert!(format!("{e}").contains("503"));
    }
}
