//! End-to-end trade cycle tests against a deterministic in-memory game
//! client.
//!
//! Each scenario feeds the engine canned market screens and asserts on
//! the HTTP actions it records, so the full decision chain (ledgers →
//! sizing → offer placement) is exercised without a game server.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};

use quartermaster::config::MarketConfig;
use quartermaster::market::MarketEngine;
use quartermaster::net::{AlertSink, GameClient, Reporter};
use quartermaster::premium::PremiumAdvisor;
use quartermaster::tracker::ResourceTracker;
use quartermaster::types::{Resource, SettlementSnapshot};

const SETTLEMENT_ID: u64 = 555;

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

/// In-memory game client. Screens are served from (substring, body)
/// routes; every GET and POST is recorded for assertions.
struct MockGameClient {
    routes: Vec<(String, String)>,
    gets: Mutex<Vec<String>>,
    posts: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MockGameClient {
    fn new(routes: Vec<(&str, String)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(pat, body)| (pat.to_string(), body))
                .collect(),
            gets: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
        }
    }

    fn posts(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.posts.lock().unwrap().clone()
    }

    fn posts_to(&self, action: &str) -> Vec<(String, Vec<(String, String)>)> {
        self.posts()
            .into_iter()
            .filter(|(url, _)| url.contains(action))
            .collect()
    }
}

#[async_trait]
impl GameClient for MockGameClient {
    async fn get_screen(&self, path: &str) -> Result<String> {
        self.gets.lock().unwrap().push(path.to_string());
        for (pattern, body) in &self.routes {
            if path.contains(pattern.as_str()) {
                return Ok(body.clone());
            }
        }
        Ok("<html></html>".to_string())
    }

    async fn post_action(&self, path: &str, form: &[(String, String)]) -> Result<String> {
        self.posts
            .lock()
            .unwrap()
            .push((path.to_string(), form.to_vec()));
        for (pattern, body) in &self.routes {
            if path.contains(pattern.as_str()) {
                return Ok(body.clone());
            }
        }
        Ok("{}".to_string())
    }

    fn csrf_token(&self) -> &str {
        "token123"
    }
}

struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _settlement_id: u64, _tag: &str, _message: &str) {}
}

struct RecordingAlertSink {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Page builders
// ---------------------------------------------------------------------------

fn offer_row(id: u64, offered: &str, offer_amount: &str, wanted: &str, wanted_amount: &str) -> String {
    format!(
        concat!(
            "<!-- insert the offer -->\n<tr>",
            r#"<td><span class="icon header {offered}"></span>{off}</td>"#,
            r#"<td><span class="icon header {wanted}"></span>{want}</td>"#,
            r#"<td><form><input type="hidden" name="id" value="{id}" /></form></td>"#,
            "</tr>"
        ),
        offered = offered,
        off = offer_amount,
        wanted = wanted,
        want = wanted_amount,
        id = id,
    )
}

fn status_bar(entries: &[(&str, &str)]) -> String {
    let cells: String = entries
        .iter()
        .map(|(kind, amount)| format!(r#"<th><span class="icon header {kind}"></span>{amount} </th>"#))
        .collect();
    format!(r#"<div id="market_status_bar"><table><tr>{cells}</tr></table></div>"#)
}

fn merchants_page(available: u32) -> String {
    format!(r#"<span id="market_merchant_available_count">{available}</span>"#)
}

fn own_offers_page(offers: &[(u64, u64)]) -> String {
    offers
        .iter()
        .map(|(id, village)| format!(r#"<tr data-id="{id}" class="row_a" data-village="{village}">x</tr>"#))
        .collect()
}

fn premium_page(avg_wood: f64) -> String {
    format!(
        concat!(
            r#"<script>PremiumExchange.receiveData({{"stock":{{"wood":21840,"stone":4041,"iron":12500}},"#,
            r#""rates":{{"wood":0.000641,"stone":0.001402,"iron":0.000977}},"#,
            r#""tax":{{"buy":0.03,"sell":0.0}}}});"#,
            r#"var graph = {{"avg_exchange_rates":{{"wood":{avg_wood},"stone":700.0,"iron":1000.0}}}};</script>"#
        ),
        avg_wood = avg_wood,
    )
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn snapshot(wood: i64, stone: i64, iron: i64, storage: i64) -> SettlementSnapshot {
    SettlementSnapshot {
        name: "Northpost".to_string(),
        display_name: "Northpost (512|387) K35".to_string(),
        wood,
        stone,
        iron,
        pop: 240,
        pop_max: 300,
        storage_max: storage,
    }
}

fn tracker(wood: i64, stone: i64, iron: i64, storage: i64) -> ResourceTracker {
    let mut t = ResourceTracker::new(2.5);
    t.update(&snapshot(wood, stone, iron, storage));
    t
}

fn test_config() -> MarketConfig {
    // Time-of-day gating is disabled so scenarios run at any wall clock.
    MarketConfig {
        quiet_window: None,
        ..MarketConfig::default()
    }
}

fn engine(client: Arc<MockGameClient>, config: MarketConfig) -> MarketEngine<MockGameClient, StdRng> {
    MarketEngine::with_rng(
        client,
        Arc::new(NullReporter),
        SETTLEMENT_ID,
        config,
        StdRng::seed_from_u64(7),
    )
    .unwrap()
}

fn form_value(form: &[(String, String)], key: &str) -> Option<String> {
    form.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

// ---------------------------------------------------------------------------
// Safekeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_storage_parks_resources_on_market() {
    let client = Arc::new(MockGameClient::new(vec![(
        "mode=own_offer",
        merchants_page(5),
    )]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(10_000, 2000, 2000, 10_000);

    engine.manage_full_resource(&mut tracker).await.unwrap();

    assert_eq!(tracker.amount(Resource::Wood), 9000);
    assert_eq!(tracker.safekept_amount(Resource::Wood), 1000);

    let posts = client.posts_to("action=new_offer");
    assert_eq!(posts.len(), 1);
    let form = &posts[0].1;
    assert_eq!(form_value(form, "res_sell").as_deref(), Some("wood"));
    assert_eq!(form_value(form, "sell").as_deref(), Some("1000"));
    assert_eq!(form_value(form, "buy").as_deref(), Some("1000"));
    let counterpart = form_value(form, "res_buy").unwrap();
    assert!(counterpart == "stone" || counterpart == "iron");

    // A safekeeping placeholder must not start the trade cooldown.
    assert_eq!(engine.last_trade(), 0);
}

#[tokio::test]
async fn safekept_resources_reclaimed_when_storage_allows() {
    let client = Arc::new(MockGameClient::new(vec![(
        "mode=all_own_offer",
        own_offers_page(&[(101, SETTLEMENT_ID), (102, 999)]),
    )]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(7000, 2000, 2000, 10_000);
    tracker.safekept_add(Resource::Wood, 1000);

    engine.manage_full_resource(&mut tracker).await.unwrap();

    assert!(tracker.safekept_is_empty());
    let deletes = client.posts_to("action=delete_offers");
    // Only the offer owned by this settlement is deleted.
    assert_eq!(deletes.len(), 1);
    assert_eq!(form_value(&deletes[0].1, "id_101").as_deref(), Some("on"));
}

#[tokio::test]
async fn safekept_resources_stay_parked_while_storage_tight() {
    let client = Arc::new(MockGameClient::new(vec![]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(9500, 2000, 2000, 10_000);
    tracker.safekept_add(Resource::Wood, 1000);

    engine.manage_full_resource(&mut tracker).await.unwrap();

    assert_eq!(tracker.safekept_amount(Resource::Wood), 1000);
    assert!(client.posts().is_empty());
}

// ---------------------------------------------------------------------------
// Pacing and conflicts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_blocks_trading() {
    let client = Arc::new(MockGameClient::new(vec![]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 500);

    // Last trade 30 minutes ago with a 1/hour cap: nothing may happen.
    engine.set_last_trade(Utc::now().timestamp() - 1800);
    engine.manage_market(&mut tracker, true).await.unwrap();

    assert!(client.posts().is_empty());
    assert!(client.gets.lock().unwrap().is_empty());
}

#[tokio::test]
async fn conflicting_offer_cancels_everything() {
    let client = Arc::new(MockGameClient::new(vec![(
        "mode=all_own_offer",
        own_offers_page(&[(300, SETTLEMENT_ID)]),
    )]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);

    // We are offering wood while a consumer now needs wood.
    tracker.on_market_add(Resource::Wood, 1000);
    tracker.request("building", Resource::Wood, 12_000);

    engine.manage_market(&mut tracker, true).await.unwrap();

    assert_eq!(client.posts_to("action=delete_offers").len(), 1);
    assert!(client.posts_to("action=new_offer").is_empty());
    assert!(tracker.conflicting_offers().is_empty());
}

// ---------------------------------------------------------------------------
// Offer placement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn places_offer_for_greatest_need() {
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", "<html>no offers</html>".to_string()),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 505);

    engine.manage_market(&mut tracker, true).await.unwrap();

    let posts = client.posts_to("action=new_offer");
    assert_eq!(posts.len(), 1);
    let form = &posts[0].1;
    // 505 rounds down to 500; bias 1 sells the same amount of surplus.
    assert_eq!(form_value(form, "res_buy").as_deref(), Some("iron"));
    assert_eq!(form_value(form, "buy").as_deref(), Some("500"));
    assert_eq!(form_value(form, "res_sell").as_deref(), Some("wood"));
    assert_eq!(form_value(form, "sell").as_deref(), Some("500"));
    assert_eq!(form_value(form, "max_time").as_deref(), Some("2"));
    assert_eq!(form_value(form, "h").as_deref(), Some("token123"));

    assert!(engine.last_trade() > 0);
}

#[tokio::test]
async fn need_below_minimum_is_ignored() {
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", "<html></html>".to_string()),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 249);

    engine.manage_market(&mut tracker, true).await.unwrap();

    assert!(client.posts().is_empty());
}

#[tokio::test]
async fn incoming_transport_covers_the_need() {
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", status_bar(&[("iron", "600")])),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 505);

    engine.manage_market(&mut tracker, true).await.unwrap();

    assert!(client.posts().is_empty());
}

#[tokio::test]
async fn exhausted_merchants_abort_placement() {
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", "<html></html>".to_string()),
        ("mode=own_offer", merchants_page(0)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 500);

    engine.manage_market(&mut tracker, true).await.unwrap();

    assert!(client.posts_to("action=new_offer").is_empty());
    assert_eq!(engine.last_trade(), 0);
}

#[tokio::test]
async fn large_need_capped_at_max_trade_amount() {
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", "<html></html>".to_string()),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(9000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 8000);

    engine.manage_market(&mut tracker, true).await.unwrap();

    let posts = client.posts_to("action=new_offer");
    assert_eq!(posts.len(), 1);
    assert_eq!(form_value(&posts[0].1, "buy").as_deref(), Some("4000"));
    assert_eq!(form_value(&posts[0].1, "sell").as_deref(), Some("4000"));
}

// ---------------------------------------------------------------------------
// Accepting existing offers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepting_an_offer_decrements_stock() {
    let page = format!(
        "<table>{}</table>",
        offer_row(77, "iron", "2.000", "wood", "1.800")
    );
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", page),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 2000);

    engine.manage_market(&mut tracker, true).await.unwrap();

    // The offer covered the whole need: accepted, nothing newly posted.
    let accepts = client.posts_to("action=accept_multi");
    assert_eq!(accepts.len(), 1);
    assert!(accepts[0].0.contains("id=77"));
    assert_eq!(form_value(&accepts[0].1, "id").as_deref(), Some("77"));
    assert!(client.posts_to("action=new_offer").is_empty());

    // The 1800 wood payment leaves local stock immediately.
    assert_eq!(tracker.amount(Resource::Wood), 8000 - 1800);
}

#[tokio::test]
async fn expensive_offer_is_not_accepted() {
    // Offer wants more wood than we are willing to part with
    // (held − demand − reserve).
    let page = format!(
        "<table>{}</table>",
        offer_row(78, "iron", "2.000", "wood", "7.900")
    );
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", page),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 2000);

    engine.manage_market(&mut tracker, true).await.unwrap();

    assert!(client.posts_to("action=accept_multi").is_empty());
    // Falls through to posting an own offer instead.
    assert_eq!(client.posts_to("action=new_offer").len(), 1);
}

#[tokio::test]
async fn unwilling_to_sell_returns_zero_and_accepts_nothing() {
    // Held stock minus outstanding demand leaves less than the reserve:
    // the scan must bail out with 0 before even fetching offers.
    let page = format!(
        "<table>{}</table>",
        offer_row(79, "iron", "2.000", "wood", "100")
    );
    let client = Arc::new(MockGameClient::new(vec![("mode=other_offer", page)]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(800, 2000, 200, 10_000);
    tracker.request("building", Resource::Wood, 400);

    let fulfilled = engine
        .check_other_offers(&mut tracker, Resource::Iron, 2000, Resource::Wood)
        .await
        .unwrap();

    // 800 − 400 − 500 < 0: nothing accepted despite a cheap offer.
    assert_eq!(fulfilled, 0);
    assert!(client.posts().is_empty());
    assert!(client.gets.lock().unwrap().is_empty());
    assert_eq!(tracker.amount(Resource::Wood), 800);
}

#[tokio::test]
async fn partial_offer_accepted_as_fallback() {
    // No offer covers the full 2000, but a smaller one matches.
    let page = format!(
        "<table>{}{}</table>",
        offer_row(80, "iron", "600", "stone", "600"),
        offer_row(81, "iron", "800", "wood", "700"),
    );
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=other_offer", page),
        ("mode=own_offer", merchants_page(5)),
    ]));
    let mut engine = engine(Arc::clone(&client), test_config());
    let mut tracker = tracker(8000, 2000, 200, 10_000);
    tracker.request("building", Resource::Iron, 2000);

    engine.manage_market(&mut tracker, true).await.unwrap();

    let accepts = client.posts_to("action=accept_multi");
    assert_eq!(accepts.len(), 1);
    assert!(accepts[0].0.contains("id=81"));
    assert_eq!(tracker.amount(Resource::Wood), 8000 - 700);

    // The remaining 1200 is posted as an own offer.
    let posts = client.posts_to("action=new_offer");
    assert_eq!(posts.len(), 1);
    assert_eq!(form_value(&posts[0].1, "buy").as_deref(), Some("1200"));
}

// ---------------------------------------------------------------------------
// Premium exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn premium_rate_alert_sent_once() {
    // Average wood rate of 1000 makes the real rate (~1515) a good buy.
    let client = Arc::new(MockGameClient::new(vec![(
        "mode=exchange",
        premium_page(1000.0),
    )]));
    let sink = Arc::new(RecordingAlertSink {
        messages: Mutex::new(Vec::new()),
    });
    let advisor = PremiumAdvisor::new(
        Arc::clone(&client),
        Some(sink.clone() as Arc<dyn AlertSink>),
        SETTLEMENT_ID,
        false,
    )
    .unwrap();
    let mut tracker = tracker(8000, 2000, 200, 10_000);

    advisor.check_premium_price(&mut tracker).await.unwrap();
    let messages = sink.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("wood"));
    assert!(messages[0].contains("buy"));
    assert!(messages[0].contains("K35"));

    // Same rate again within the cooldown: suppressed.
    advisor.check_premium_price(&mut tracker).await.unwrap();
    assert_eq!(sink.messages.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn premium_trade_runs_two_phase_exchange() {
    let client = Arc::new(MockGameClient::new(vec![
        ("mode=exchange", premium_page(1400.0)),
        (
            "ajaxaction=exchange_begin",
            r#"{"response":[{"rate_hash":"a1b2c3","amount":1520,"mb":1}]}"#.to_string(),
        ),
        ("ajaxaction=exchange_confirm", r#"{"response":[]}"#.to_string()),
    ]));
    let advisor = PremiumAdvisor::new(Arc::clone(&client), None, SETTLEMENT_ID, true).unwrap();
    let mut tracker = tracker(8000, 2000, 200, 10_000);

    advisor.do_premium_stuff(&mut tracker).await.unwrap();

    let begins = client.posts_to("ajaxaction=exchange_begin");
    assert_eq!(begins.len(), 1);
    assert_eq!(form_value(&begins[0].1, "sell_wood").as_deref(), Some("1"));

    let confirms = client.posts_to("ajaxaction=exchange_confirm");
    assert_eq!(confirms.len(), 1);
    let form = &confirms[0].1;
    assert_eq!(form_value(form, "sell_wood").as_deref(), Some("1520"));
    assert_eq!(form_value(form, "rate_wood").as_deref(), Some("a1b2c3"));
    assert_eq!(form_value(form, "mb").as_deref(), Some("1"));
}

#[tokio::test]
async fn premium_trade_skipped_without_surplus() {
    let client = Arc::new(MockGameClient::new(vec![(
        "mode=exchange",
        premium_page(1400.0),
    )]));
    let advisor = PremiumAdvisor::new(Arc::clone(&client), None, SETTLEMENT_ID, true).unwrap();
    // Nothing above the surplus threshold.
    let mut tracker = tracker(1000, 1000, 1000, 10_000);

    advisor.do_premium_stuff(&mut tracker).await.unwrap();

    assert!(client.posts().is_empty());
}

#[tokio::test]
async fn premium_malformed_page_degrades_quietly() {
    let client = Arc::new(MockGameClient::new(vec![(
        "mode=exchange",
        "<html>maintenance</html>".to_string(),
    )]));
    let advisor = PremiumAdvisor::new(Arc::clone(&client), None, SETTLEMENT_ID, true).unwrap();
    let mut tracker = tracker(8000, 2000, 200, 10_000);

    let prices = advisor.check_premium_price(&mut tracker).await.unwrap();
    assert!(prices.is_none());
    assert!(client.posts().is_empty());
}
