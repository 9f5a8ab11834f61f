//! Market Monitor - watches tracked listings, saved searches and area stats.
//!
//! Each cycle it queues:
//! - `check_property_changes` (priority 3) while any property is tracked
//! - `scan_new_listings` (priority 4) while any search is saved
//! - `analyze_market_trends` (priority 5) at most once an hour

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use estateflow_traits::{ChatMessage, MarketStats, ModelHint, PropertyRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::AgentTask;
use crate::runtime::{Agent, AgentContext, NotificationLevel};

pub const MARKET_MONITOR_NAME: &str = "Market Monitor";

const TRACK_PROPERTY: &str = "track_property";
const UNTRACK_PROPERTY: &str = "untrack_property";
const ADD_SEARCH: &str = "add_search";
const REMOVE_SEARCH: &str = "remove_search";
const CHECK_PROPERTY_CHANGES: &str = "check_property_changes";
const SCAN_NEW_LISTINGS: &str = "scan_new_listings";
const ANALYZE_MARKET_TRENDS: &str = "analyze_market_trends";

const TASK_TYPES: &[&str] = &[
    TRACK_PROPERTY,
    UNTRACK_PROPERTY,
    ADD_SEARCH,
    REMOVE_SEARCH,
    CHECK_PROPERTY_CHANGES,
    SCAN_NEW_LISTINGS,
    ANALYZE_MARKET_TRENDS,
];

/// Days-on-market growth that counts as a change.
const DOM_INCREASE_DAYS: u32 = 7;
/// Relative move in an area statistic that counts as significant.
const MARKET_CHANGE_THRESHOLD: f64 = 0.05;
const MAX_LISTING_NOTIFICATIONS: usize = 5;
const TRENDS_KEY_PREFIX: &str = "market_trends/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyChange {
    PriceChange { old_value: f64, new_value: f64 },
    StatusChange {
        old_value: Option<String>,
        new_value: Option<String>,
    },
    DomIncrease { old_value: u32, new_value: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<PropertyChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedProperty {
    pub address: String,
    /// Listing as of the last detected change
    pub baseline: PropertyRecord,
    pub last_checked: DateTime<Utc>,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub criteria: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    /// Listing ids seen on the last scan that found something new
    #[serde(default)]
    pub found_properties: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketChange {
    pub metric: String,
    pub old_value: f64,
    pub new_value: f64,
    pub percent_change: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MonitorState {
    #[serde(default)]
    tracked_properties: BTreeMap<String, TrackedProperty>,
    #[serde(default)]
    saved_searches: Vec<SavedSearch>,
    #[serde(default)]
    market_baselines: BTreeMap<String, MarketStats>,
    #[serde(default)]
    last_full_scan: Option<DateTime<Utc>>,
}

pub struct MarketMonitorAgent {
    state: Mutex<MonitorState>,
}

impl Default for MarketMonitorAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketMonitorAgent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn tracked_property_ids(&self) -> Vec<String> {
        self.state.lock().tracked_properties.keys().cloned().collect()
    }

    pub fn saved_searches(&self) -> Vec<SavedSearch> {
        self.state.lock().saved_searches.clone()
    }

    async fn track_property(&self, task: &AgentTask, ctx: &AgentContext) -> Result<Value> {
        let Some(property_id) = task.data_str("property_id") else {
            bail!("Property ID required for tracking");
        };

        let Some(service) = ctx.services().property_data.as_ref() else {
            return Ok(json!({"status": "error", "message": "Could not fetch property data"}));
        };
        let Some(record) = service.property_details(property_id).await? else {
            return Ok(json!({"status": "error", "message": "Could not fetch property data"}));
        };

        let address = task
            .data_str("address")
            .map(str::to_string)
            .unwrap_or_else(|| record.address.clone());

        self.state.lock().tracked_properties.insert(
            property_id.to_string(),
            TrackedProperty {
                address: address.clone(),
                baseline: record,
                last_checked: Utc::now(),
                changes: Vec::new(),
            },
        );

        ctx.notify(
            NotificationLevel::Info,
            format!("Now tracking property: {}", address),
        );
        Ok(json!({"status": "tracking", "property_id": property_id}))
    }

    fn untrack_property(&self, task: &AgentTask, ctx: &AgentContext) -> Value {
        let property_id = task.data_str("property_id").unwrap_or_default();
        let removed = self.state.lock().tracked_properties.remove(property_id);

        match removed {
            Some(tracked) => {
                ctx.notify(
                    NotificationLevel::Info,
                    format!("Stopped tracking property: {}", tracked.address),
                );
                json!({"status": "untracked", "property_id": property_id})
            }
            None => json!({"status": "error", "message": "Property not being tracked"}),
        }
    }

    fn add_search(&self, task: &AgentTask, ctx: &AgentContext) -> Value {
        let search = SavedSearch {
            id: Uuid::new_v4().to_string(),
            name: task
                .data_str("name")
                .unwrap_or("Untitled Search")
                .to_string(),
            criteria: task
                .data
                .get("criteria")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
            created_at: Utc::now(),
            last_checked: None,
            found_properties: BTreeSet::new(),
        };

        let id = search.id.clone();
        ctx.notify(
            NotificationLevel::Info,
            format!("Added saved search: {}", search.name),
        );
        self.state.lock().saved_searches.push(search);
        json!({"status": "added", "search_id": id})
    }

    fn remove_search(&self, task: &AgentTask) -> Value {
        let search_id = task.data_str("search_id").unwrap_or_default();
        self.state
            .lock()
            .saved_searches
            .retain(|search| search.id != search_id);
        json!({"status": "removed", "search_id": search_id})
    }

    async fn check_property_changes(&self, ctx: &AgentContext) -> Result<Value> {
        let service = ctx.services().property_data()?.clone();
        let tracked: Vec<(String, TrackedProperty)> = self
            .state
            .lock()
            .tracked_properties
            .iter()
            .map(|(id, tracked)| (id.clone(), tracked.clone()))
            .collect();

        let total = tracked.len();
        let mut changes_found = Vec::new();

        for (index, (property_id, tracked)) in tracked.into_iter().enumerate() {
            ctx.progress(
                percent(index, total),
                format!("Checking {}", tracked.address),
            );

            let current = match service.property_details(&property_id).await {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(err) => {
                    error!(property_id = %property_id, "Error checking property: {}", err);
                    continue;
                }
            };

            let changes = compare_property(&tracked.baseline, &current);
            let now = Utc::now();
            {
                let mut state = self.state.lock();
                let Some(entry) = state.tracked_properties.get_mut(&property_id) else {
                    continue;
                };
                entry.last_checked = now;
                if !changes.is_empty() {
                    entry.changes.push(ChangeRecord {
                        timestamp: now,
                        changes: changes.clone(),
                    });
                    entry.baseline = current.clone();
                }
            }
            if changes.is_empty() {
                continue;
            }

            for change in &changes {
                if let PropertyChange::PriceChange {
                    old_value,
                    new_value,
                } = change
                    && *old_value > 0.0
                {
                    let pct = (new_value - old_value) / old_value * 100.0;
                    let (level, direction) = if pct < 0.0 {
                        (NotificationLevel::Warning, "decreased")
                    } else {
                        (NotificationLevel::Info, "increased")
                    };
                    ctx.notify(
                        level,
                        format!(
                            "Price {} by {:.1}% for {}: {} -> {}",
                            direction,
                            pct.abs(),
                            tracked.address,
                            format_price(*old_value),
                            format_price(*new_value)
                        ),
                    );
                    changes_found.push(json!({
                        "property_id": property_id,
                        "address": tracked.address,
                        "change": change,
                    }));
                }
            }

            let prompt = format!(
                "Analyze this property change for: {}\n\nChanges detected: {}\nOld data: Price={}, Status={}, DOM={}\nNew data: Price={}, Status={}, DOM={}\n\nProvide a brief (1-2 sentence) insight about what this means for potential buyers/sellers.",
                tracked.address,
                serde_json::to_string(&changes).unwrap_or_default(),
                format_price(tracked.baseline.price.unwrap_or(0.0)),
                tracked.baseline.status.as_deref().unwrap_or("unknown"),
                tracked.baseline.days_on_market.unwrap_or(0),
                format_price(current.price.unwrap_or(0.0)),
                current.status.as_deref().unwrap_or("unknown"),
                current.days_on_market.unwrap_or(0),
            );
            if let Some(analysis) = ask_ai(ctx, prompt, ModelHint::Cheap).await {
                ctx.notify(NotificationLevel::Info, analysis);
            }
        }

        Ok(json!({
            "status": "completed",
            "properties_checked": total,
            "changes_found": changes_found.len(),
            "changes": changes_found,
        }))
    }

    async fn scan_new_listings(&self, ctx: &AgentContext) -> Result<Value> {
        let service = ctx.services().property_data()?.clone();
        let searches = self.saved_searches();
        let total = searches.len();
        let mut new_listings_found = 0;

        for (index, search) in searches.into_iter().enumerate() {
            ctx.progress(percent(index, total), format!("Scanning: {}", search.name));

            let results = match service.search_listings(&search.criteria).await {
                Ok(results) => results,
                Err(err) => {
                    error!(search_id = %search.id, "Error scanning search: {}", err);
                    continue;
                }
            };

            let current_ids: BTreeSet<String> = results.iter().map(|p| p.id.clone()).collect();
            let new_listings: Vec<&PropertyRecord> = results
                .iter()
                .filter(|p| !search.found_properties.contains(&p.id))
                .collect();
            if new_listings.is_empty() {
                continue;
            }

            {
                let mut state = self.state.lock();
                if let Some(saved) = state.saved_searches.iter_mut().find(|s| s.id == search.id) {
                    saved.found_properties = current_ids;
                    saved.last_checked = Some(Utc::now());
                }
            }

            for listing in new_listings.iter().take(MAX_LISTING_NOTIFICATIONS) {
                ctx.notify(
                    NotificationLevel::Success,
                    format!(
                        "New listing for '{}': {} - {}",
                        search.name,
                        if listing.address.is_empty() {
                            "Unknown"
                        } else {
                            listing.address.as_str()
                        },
                        format_price(listing.price.unwrap_or(0.0))
                    ),
                );
            }
            new_listings_found += new_listings.len();

            let mut summary = format!(
                "Found {} new listings for '{}':\n",
                new_listings.len(),
                search.name
            );
            for listing in new_listings.iter().take(3) {
                summary.push_str(&format!(
                    "- {}: {}\n",
                    listing.address,
                    format_price(listing.price.unwrap_or(0.0))
                ));
            }
            let prompt = format!(
                "{}\nProvide a brief insight about these new listings and any opportunities they might represent.",
                summary
            );
            if let Some(analysis) = ask_ai(ctx, prompt, ModelHint::Cheap).await {
                ctx.notify(NotificationLevel::Info, analysis);
            }
        }

        Ok(json!({
            "status": "completed",
            "searches_checked": total,
            "new_listings_found": new_listings_found,
        }))
    }

    async fn analyze_market_trends(&self, ctx: &AgentContext) -> Result<Value> {
        let areas: BTreeSet<String> = self
            .state
            .lock()
            .tracked_properties
            .values()
            .map(|tracked| {
                tracked
                    .baseline
                    .city
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string())
            })
            .collect();

        let service = match &ctx.services().property_data {
            Some(service) if !areas.is_empty() => Arc::clone(service),
            Some(_) => {
                debug!("No tracked areas, skipping market analysis");
                return Ok(trend_summary(0, 0));
            }
            None => {
                debug!("No property data service, skipping market analysis");
                return Ok(trend_summary(0, 0));
            }
        };

        let mut areas_analyzed = 0;
        let mut significant = Vec::new();

        for area in areas {
            let Some(stats) = service.market_statistics(&area).await? else {
                continue;
            };
            areas_analyzed += 1;

            let previous = self
                .state
                .lock()
                .market_baselines
                .insert(area.clone(), stats.clone());
            if let Some(baseline) = previous {
                let changes = compare_market_stats(&baseline, &stats);
                if !changes.is_empty() {
                    significant.push(json!({"area": area, "changes": changes}));
                }
            }

            if let Some(store) = &ctx.services().store {
                let key = format!("{}{}", TRENDS_KEY_PREFIX, area.to_lowercase());
                let record = json!({"area": area, "stats": stats, "timestamp": Utc::now()});
                if let Err(err) = store.put(&key, record.to_string().as_bytes()) {
                    warn!(key = %key, "Failed to store market trend: {:#}", err);
                }
            }
        }

        if !significant.is_empty() {
            let prompt = format!(
                "Analyze these real estate market changes and provide insights:\n\n{}\n\nFocus on:\n1. What these changes mean for buyers and sellers\n2. Potential opportunities or risks\n3. Predictions for the next 30 days\n\nKeep response under 200 words.",
                Value::Array(significant.clone())
            );
            if let Some(analysis) = ask_ai(ctx, prompt, ModelHint::Good).await {
                ctx.notify(
                    NotificationLevel::Info,
                    format!("Market Analysis: {}", analysis),
                );
            }
        }

        Ok(trend_summary(areas_analyzed, significant.len()))
    }
}

fn trend_summary(areas_analyzed: usize, significant_changes: usize) -> Value {
    json!({
        "status": "completed",
        "areas_analyzed": areas_analyzed,
        "significant_changes": significant_changes,
    })
}

#[async_trait]
impl Agent for MarketMonitorAgent {
    fn name(&self) -> &str {
        MARKET_MONITOR_NAME
    }

    async fn perform_scheduled_check(&self, ctx: &AgentContext) -> Result<()> {
        let now = Utc::now();
        let (has_tracked, has_searches, needs_full_scan) = {
            let mut state = self.state.lock();
            let needs_full_scan = state
                .last_full_scan
                .is_none_or(|last| now - last > Duration::hours(1));
            if needs_full_scan {
                state.last_full_scan = Some(now);
            }
            (
                !state.tracked_properties.is_empty(),
                !state.saved_searches.is_empty(),
                needs_full_scan,
            )
        };

        if has_tracked {
            ctx.enqueue(AgentTask::new(CHECK_PROPERTY_CHANGES, Map::new()).with_priority(3));
        }
        if has_searches {
            ctx.enqueue(AgentTask::new(SCAN_NEW_LISTINGS, Map::new()).with_priority(4));
        }
        if needs_full_scan {
            ctx.enqueue(AgentTask::new(ANALYZE_MARKET_TRENDS, Map::new()).with_priority(5));
        }
        Ok(())
    }

    async fn execute_task(&self, task: &AgentTask, ctx: &AgentContext) -> Result<Value> {
        match task.task_type.as_str() {
            TRACK_PROPERTY => self.track_property(task, ctx).await,
            UNTRACK_PROPERTY => Ok(self.untrack_property(task, ctx)),
            ADD_SEARCH => Ok(self.add_search(task, ctx)),
            REMOVE_SEARCH => Ok(self.remove_search(task)),
            CHECK_PROPERTY_CHANGES => self.check_property_changes(ctx).await,
            SCAN_NEW_LISTINGS => self.scan_new_listings(ctx).await,
            ANALYZE_MARKET_TRENDS => self.analyze_market_trends(ctx).await,
            other => bail!("Unknown task type: {}", other),
        }
    }

    fn can_handle_task(&self, task_type: &str) -> bool {
        TASK_TYPES.contains(&task_type)
    }

    fn extra_state(&self) -> Value {
        serde_json::to_value(&*self.state.lock()).unwrap_or_else(|err| {
            warn!("Failed to serialize market monitor state: {}", err);
            Value::Null
        })
    }

    fn load_extra_state(&self, state: Value) {
        if state.is_null() {
            return;
        }
        match serde_json::from_value::<MonitorState>(state) {
            Ok(restored) => {
                debug!(
                    tracked = restored.tracked_properties.len(),
                    searches = restored.saved_searches.len(),
                    "Restored market monitor state"
                );
                *self.state.lock() = restored;
            }
            Err(err) => warn!("Ignoring unreadable market monitor state: {}", err),
        }
    }
}

/// Ask the injected AI provider, if any. Failures are logged and dropped.
async fn ask_ai(ctx: &AgentContext, prompt: String, model: ModelHint) -> Option<String> {
    let ai = ctx.services().ai.as_ref()?;
    match ai.send(&[ChatMessage::user(prompt)], model).await {
        Ok(reply) if !reply.trim().is_empty() => Some(reply),
        Ok(_) => None,
        Err(err) => {
            error!(agent = %ctx.agent_name(), "AI analysis failed: {}", err);
            None
        }
    }
}

pub fn compare_property(old: &PropertyRecord, new: &PropertyRecord) -> Vec<PropertyChange> {
    let mut changes = Vec::new();

    if old.price != new.price {
        changes.push(PropertyChange::PriceChange {
            old_value: old.price.unwrap_or(0.0),
            new_value: new.price.unwrap_or(0.0),
        });
    }

    if old.status != new.status {
        changes.push(PropertyChange::StatusChange {
            old_value: old.status.clone(),
            new_value: new.status.clone(),
        });
    }

    let old_dom = old.days_on_market.unwrap_or(0);
    let new_dom = new.days_on_market.unwrap_or(0);
    if new_dom > old_dom + DOM_INCREASE_DAYS {
        changes.push(PropertyChange::DomIncrease {
            old_value: old_dom,
            new_value: new_dom,
        });
    }

    changes
}

pub fn compare_market_stats(old: &MarketStats, new: &MarketStats) -> Vec<MarketChange> {
    let metrics: [(&str, fn(&MarketStats) -> Option<f64>); 4] = [
        ("Median Price", |s| s.median_price),
        ("Price per Sq Ft", |s| s.avg_price_sqft),
        ("Inventory", |s| s.inventory),
        ("Avg Days on Market", |s| s.avg_days_on_market),
    ];

    metrics
        .iter()
        .filter_map(|(label, metric)| {
            let old_value = metric(old).unwrap_or(0.0);
            let new_value = metric(new).unwrap_or(0.0);
            if old_value <= 0.0 {
                return None;
            }
            let change = (new_value - old_value) / old_value;
            (change.abs() >= MARKET_CHANGE_THRESHOLD).then(|| MarketChange {
                metric: label.to_string(),
                old_value,
                new_value,
                percent_change: change * 100.0,
            })
        })
        .collect()
}

fn percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    u8::try_from(index * 100 / total).unwrap_or(100)
}

/// Whole-dollar amount with thousands separators, e.g. `$1,250,000`.
fn format_price(value: f64) -> String {
    let rounded = value.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0 {
        format!("-${}", grouped)
    } else {
        format!("${}", grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AgentEvent, AgentEventKind, AgentRuntime, AgentServices, RuntimeOptions};
    use crate::testkit::{MockAi, MockPropertyData};
    use estateflow_storage::Storage;
    use estateflow_traits::KvStore;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    struct Harness {
        agent: Arc<MarketMonitorAgent>,
        runtime: Arc<AgentRuntime>,
        data: Arc<MockPropertyData>,
        ai: Arc<MockAi>,
        events: broadcast::Receiver<AgentEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let agent = Arc::new(MarketMonitorAgent::new());
            let runtime = AgentRuntime::new(agent.clone(), RuntimeOptions::default(), None);
            let data = Arc::new(MockPropertyData::new());
            let ai = Arc::new(MockAi::new("Looks like a buyer's market."));
            runtime.set_services(
                AgentServices::new()
                    .with_property_data(data.clone())
                    .with_ai(ai.clone()),
            );
            let events = runtime.subscribe();
            Self {
                agent,
                runtime,
                data,
                ai,
                events,
            }
        }

        async fn run(&self, task_type: &str, data: Value) -> Result<Value> {
            let data = match data {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            let task = AgentTask::new(task_type, data);
            self.agent
                .execute_task(&task, &self.runtime.context())
                .await
        }

        fn notifications(&mut self) -> Vec<(NotificationLevel, String)> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let AgentEventKind::Notification { level, message } = event.kind {
                    out.push((level, message));
                }
            }
            out
        }
    }

    fn listing(id: &str, address: &str, price: f64) -> PropertyRecord {
        PropertyRecord {
            id: id.to_string(),
            address: address.to_string(),
            city: Some("Austin".to_string()),
            price: Some(price),
            status: Some("active".to_string()),
            days_on_market: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(450_000.0), "$450,000");
        assert_eq!(format_price(1_250_000.4), "$1,250,000");
        assert_eq!(format_price(999.0), "$999");
        assert_eq!(format_price(0.0), "$0");
    }

    #[test]
    fn test_compare_property_detects_each_change_kind() {
        let old = listing("p-1", "12 Oak St", 500_000.0);
        let mut new = old.clone();
        new.price = Some(450_000.0);
        new.status = Some("pending".to_string());
        new.days_on_market = Some(11);

        let changes = compare_property(&old, &new);
        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[0], PropertyChange::PriceChange { .. }));
        assert!(matches!(changes[2], PropertyChange::DomIncrease { old_value: 3, new_value: 11 }));

        let mut small_dom = old.clone();
        small_dom.days_on_market = Some(10);
        assert!(compare_property(&old, &small_dom).is_empty());
    }

    #[test]
    fn test_compare_market_stats_uses_five_percent_threshold() {
        let old = MarketStats {
            area: "Austin".to_string(),
            median_price: Some(400_000.0),
            avg_price_sqft: Some(250.0),
            inventory: Some(0.0),
            avg_days_on_market: Some(30.0),
        };
        let new = MarketStats {
            median_price: Some(420_000.0),
            avg_price_sqft: Some(255.0),
            inventory: Some(100.0),
            avg_days_on_market: Some(27.0),
            ..old.clone()
        };

        let changes = compare_market_stats(&old, &new);
        let metrics: Vec<&str> = changes.iter().map(|c| c.metric.as_str()).collect();
        assert_eq!(metrics, vec!["Median Price", "Avg Days on Market"]);
        assert!((changes[1].percent_change + 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scheduled_check_enqueues_periodic_work() {
        let harness = Harness::new();
        let ctx = harness.runtime.context();

        harness.agent.perform_scheduled_check(&ctx).await.unwrap();
        let queued: Vec<String> = harness
            .runtime
            .queue()
            .snapshot()
            .into_iter()
            .map(|t| t.task_type)
            .collect();
        assert_eq!(queued, vec![ANALYZE_MARKET_TRENDS]);

        harness.data.set_property(listing("p-1", "12 Oak St", 500_000.0));
        harness
            .run(TRACK_PROPERTY, json!({"property_id": "p-1"}))
            .await
            .unwrap();
        harness
            .run(ADD_SEARCH, json!({"name": "Starter homes", "criteria": {"max_price": 400000}}))
            .await
            .unwrap();

        harness.agent.perform_scheduled_check(&ctx).await.unwrap();
        let snapshot = harness.runtime.queue().snapshot();
        let queued: Vec<(&str, i32)> = snapshot
            .iter()
            .map(|t| (t.task_type.as_str(), t.priority))
            .collect();
        assert_eq!(
            queued,
            vec![
                (CHECK_PROPERTY_CHANGES, 3),
                (SCAN_NEW_LISTINGS, 4),
                (ANALYZE_MARKET_TRENDS, 5)
            ]
        );
    }

    #[tokio::test]
    async fn test_track_property_requires_id() {
        let harness = Harness::new();
        let err = harness.run(TRACK_PROPERTY, json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Property ID required"));
    }

    #[tokio::test]
    async fn test_price_drop_emits_warning_and_ai_insight() {
        let mut harness = Harness::new();
        harness.data.set_property(listing("p-1", "12 Oak St", 500_000.0));
        let result = harness
            .run(TRACK_PROPERTY, json!({"property_id": "p-1"}))
            .await
            .unwrap();
        assert_eq!(result["status"], "tracking");
        assert_eq!(harness.agent.tracked_property_ids(), vec!["p-1"]);

        harness.data.set_property(listing("p-1", "12 Oak St", 450_000.0));
        let result = harness.run(CHECK_PROPERTY_CHANGES, json!({})).await.unwrap();
        assert_eq!(result["changes_found"], 1);

        let notifications = harness.notifications();
        assert!(notifications.contains(&(
            NotificationLevel::Warning,
            "Price decreased by 10.0% for 12 Oak St: $500,000 -> $450,000".to_string()
        )));
        assert!(notifications.contains(&(
            NotificationLevel::Info,
            "Looks like a buyer's market.".to_string()
        )));
        assert_eq!(harness.ai.call_count(), 1);
        assert_eq!(harness.ai.last_model(), Some(ModelHint::Cheap));

        let unchanged = harness.run(CHECK_PROPERTY_CHANGES, json!({})).await.unwrap();
        assert_eq!(unchanged["changes_found"], 0);
    }

    #[tokio::test]
    async fn test_scan_notifies_only_new_listings() {
        let mut harness = Harness::new();
        harness
            .run(ADD_SEARCH, json!({"criteria": {"city": "Austin"}}))
            .await
            .unwrap();
        assert_eq!(harness.agent.saved_searches()[0].name, "Untitled Search");

        let listings: Vec<PropertyRecord> = (0..7)
            .map(|i| listing(&format!("l-{i}"), &format!("{i} Elm St"), 300_000.0))
            .collect();
        harness.data.set_listings(listings);
        harness.notifications();

        let result = harness.run(SCAN_NEW_LISTINGS, json!({})).await.unwrap();
        assert_eq!(result["new_listings_found"], 7);
        let successes = harness
            .notifications()
            .into_iter()
            .filter(|(level, _)| *level == NotificationLevel::Success)
            .count();
        assert_eq!(successes, MAX_LISTING_NOTIFICATIONS);

        let again = harness.run(SCAN_NEW_LISTINGS, json!({})).await.unwrap();
        assert_eq!(again["new_listings_found"], 0);
        assert!(harness.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_market_trends_compare_baselines_and_store_summary() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(temp_dir.path().join("trends.db")).unwrap();
        let kv = Arc::new(storage.kv_store.clone());

        let harness = Harness::new();
        let mut services = harness.runtime.services();
        services.store = Some(kv.clone());
        harness.runtime.set_services(services);

        harness.data.set_property(listing("p-1", "12 Oak St", 500_000.0));
        harness
            .run(TRACK_PROPERTY, json!({"property_id": "p-1"}))
            .await
            .unwrap();

        let baseline = MarketStats {
            area: "Austin".to_string(),
            median_price: Some(400_000.0),
            ..Default::default()
        };
        harness.data.set_stats(baseline.clone());
        let first = harness.run(ANALYZE_MARKET_TRENDS, json!({})).await.unwrap();
        assert_eq!(first["areas_analyzed"], 1);
        assert_eq!(first["significant_changes"], 0);

        harness.data.set_stats(MarketStats {
            median_price: Some(440_000.0),
            ..baseline
        });
        let second = harness.run(ANALYZE_MARKET_TRENDS, json!({})).await.unwrap();
        assert_eq!(second["significant_changes"], 1);
        assert_eq!(harness.ai.last_model(), Some(ModelHint::Good));

        let stored = kv.get("market_trends/austin").unwrap().unwrap();
        let stored: Value = serde_json::from_slice(&stored).unwrap();
        assert_eq!(stored["stats"]["median_price"], 440_000.0);
    }

    #[tokio::test]
    async fn test_market_trends_without_property_data_completes_empty() {
        let harness = Harness::new();
        harness.data.set_property(listing("p-1", "12 Oak St", 500_000.0));
        harness
            .run(TRACK_PROPERTY, json!({"property_id": "p-1"}))
            .await
            .unwrap();

        harness.runtime.set_services(AgentServices::new());
        let result = harness.run(ANALYZE_MARKET_TRENDS, json!({})).await.unwrap();

        assert_eq!(result["status"], "completed");
        assert_eq!(result["areas_analyzed"], 0);
        assert_eq!(result["significant_changes"], 0);
    }

    #[tokio::test]
    async fn test_market_trends_with_nothing_tracked_skips_service() {
        let harness = Harness::new();
        harness.data.set_unavailable(true);

        let result = harness.run(ANALYZE_MARKET_TRENDS, json!({})).await.unwrap();
        assert_eq!(result["areas_analyzed"], 0);
    }

    #[tokio::test]
    async fn test_service_outage_fails_task() {
        let harness = Harness::new();
        harness.data.set_unavailable(true);
        assert!(
            harness
                .run(TRACK_PROPERTY, json!({"property_id": "p-1"}))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unknown_task_type_fails() {
        let harness = Harness::new();
        assert!(!harness.agent.can_handle_task("score_lead"));
        assert!(harness.agent.can_handle_task(SCAN_NEW_LISTINGS));
        assert!(harness.run("score_lead", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_extra_state_round_trip() {
        let harness = Harness::new();
        harness.data.set_property(listing("p-1", "12 Oak St", 500_000.0));
        harness
            .run(TRACK_PROPERTY, json!({"property_id": "p-1", "address": "12 Oak Street"}))
            .await
            .unwrap();
        harness
            .run(ADD_SEARCH, json!({"name": "Lofts"}))
            .await
            .unwrap();
        harness
            .agent
            .perform_scheduled_check(&harness.runtime.context())
            .await
            .unwrap();

        let saved = harness.agent.extra_state();
        let restored = MarketMonitorAgent::new();
        restored.load_extra_state(saved.clone());

        assert_eq!(restored.extra_state(), saved);
        assert_eq!(restored.tracked_property_ids(), vec!["p-1"]);
        assert_eq!(restored.saved_searches()[0].name, "Lofts");
        assert!(saved["last_full_scan"].is_string());
        assert_eq!(
            saved["tracked_properties"]["p-1"]["address"],
            "12 Oak Street"
        );
    }
}
