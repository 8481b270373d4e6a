// ./infrastructure/src/persistence/in_memory_store.rs
use application::{ApplicationError, FieldFilter, RecordStore, SearchFilters};
use async_trait::async_trait;
use domain::{Record, RecordId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Mutable store state: the ordered record map plus the id counter. The id
/// counter and the map are shared mutable state with no other
/// synchronization, so every operation runs under the one lock.
#[derive(Debug)]
struct StoreState {
    records: BTreeMap<u64, Record>,
    next_id: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }
}

/// In-memory record store.
///
/// Ids are assigned from a monotonically increasing counter and never
/// recycled, so iterating the BTreeMap in key order yields records in
/// insertion order.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    /// Text fields the substring search matches against (e.g. name,
    /// description for items; title for tasks).
    searchable_fields: Vec<String>,
    state: Mutex<StoreState>,
}

impl InMemoryRecordStore {
    pub fn new<I, S>(searchable_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            searchable_fields: searchable_fields.into_iter().map(Into::into).collect(),
            state: Mutex::new(StoreState::default()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    #[instrument(skip(self, fields))]
    async fn create(&self, fields: HashMap<String, Value>) -> Result<Record, ApplicationError> {
        let mut state = self.state.lock().await;
        let id = RecordId::new(state.next_id);
        state.next_id += 1;
        let record = Record::new(id, fields);
        state.records.insert(id.value(), record.clone());
        debug!(id = %id, "Record inserted into in-memory store");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: RecordId) -> Result<Option<Record>, ApplicationError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id.value()).cloned())
    }

    #[instrument(skip(self))]
    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Record>, ApplicationError> {
        let state = self.state.lock().await;
        let records: Vec<Record> = state
            .records
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect();
        debug!(skip, limit, returned = records.len(), "Listed records");
        Ok(records)
    }

    #[instrument(skip(self, patch))]
    async fn update(
        &self,
        id: RecordId,
        patch: HashMap<String, Value>,
    ) -> Result<Option<Record>, ApplicationError> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(&id.value()) {
            Some(record) => {
                record.apply_patch(patch);
                debug!(id = %id, "Record patched in in-memory store");
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: RecordId) -> Result<bool, ApplicationError> {
        let mut state = self.state.lock().await;
        // next_id is left untouched: deleted ids are never reused
        let removed = state.records.remove(&id.value()).is_some();
        debug!(id = %id, removed, "Delete from in-memory store");
        Ok(removed)
    }

    #[instrument(skip(self, filters))]
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<Record>, ApplicationError> {
        let query_lower = query.to_lowercase();
        let state = self.state.lock().await;
        let matches: Vec<Record> = state
            .records
            .values()
            .filter(|record| {
                self.searchable_fields.iter().any(|field| {
                    record
                        .text(field)
                        .map_or(false, |text| text.to_lowercase().contains(&query_lower))
                })
            })
            .filter(|record| matches_filters(record, filters))
            .cloned()
            .collect();
        debug!(query = %query, hits = matches.len(), "In-memory search finished");
        Ok(matches)
    }

    async fn count(&self) -> Result<usize, ApplicationError> {
        let state = self.state.lock().await;
        Ok(state.records.len())
    }
}

/// Checks a record against every filter condition. A record missing a
/// filtered field does not match.
fn matches_filters(record: &Record, filters: &SearchFilters) -> bool {
    filters.iter().all(|(field, filter)| {
        record
            .field(field)
            .map_or(false, |value| matches_filter(value, filter))
    })
}

fn matches_filter(value: &Value, filter: &FieldFilter) -> bool {
    match filter {
        FieldFilter::Equals(expected) => match expected {
            Value::String(expected_str) => value
                .as_str()
                .map_or(false, |actual| actual == expected_str),
            // Compare numbers carefully (allow float vs int comparison)
            Value::Number(expected_num) => {
                value
                    .as_f64()
                    .zip(expected_num.as_f64())
                    .map_or(false, |(a, e)| (a - e).abs() < f64::EPSILON)
                    || value
                        .as_i64()
                        .zip(expected_num.as_i64())
                        .map_or(false, |(a, e)| a == e)
            }
            Value::Bool(expected_bool) => value
                .as_bool()
                .map_or(false, |actual| actual == *expected_bool),
            _ => value == expected,
        },
        FieldFilter::Range { min, max } => {
            let number = match value.as_f64() {
                Some(n) => n,
                None => return false, // non-numeric values never fall in a range
            };
            if let Some(min) = min {
                if number < *min {
                    return false;
                }
            }
            if let Some(max) = max {
                if number > *max {
                    return false;
                }
            }
            true
        }
    }
}

// --- Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_store() -> InMemoryRecordStore {
        InMemoryRecordStore::new(["name", "description"])
    }

    fn item_fields(name: &str, price: f64) -> HashMap<String, Value> {
        [
            ("name".to_string(), json!(name)),
            ("price".to_string(), json!(price)),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn create_assigns_strictly_increasing_unique_ids() {
        let store = item_store();
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = store
                .create(item_fields(&format!("Item {}", i), 1.0))
                .await
                .unwrap();
            ids.push(record.id().value());
        }
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn ids_are_not_recycled_after_delete() {
        let store = item_store();
        let first = store.create(item_fields("First", 1.0)).await.unwrap();
        assert!(store.delete(first.id()).await.unwrap());
        let second = store.create(item_fields("Second", 2.0)).await.unwrap();
        assert!(second.id().value() > first.id().value());
    }

    #[tokio::test]
    async fn get_after_create_returns_equal_record() {
        let store = item_store();
        let created = store.create(item_fields("Widget", 9.99)).await.unwrap();
        let fetched = store.get(created.id()).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn get_missing_id_returns_none() {
        let store = item_store();
        assert!(store.get(RecordId::new(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_patch_is_a_noop() {
        let store = item_store();
        let created = store.create(item_fields("Widget", 10.0)).await.unwrap();
        let updated = store
            .update(created.id(), HashMap::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated, created);
    }

    #[tokio::test]
    async fn update_overwrites_only_supplied_keys() {
        let store = item_store();
        let created = store.create(item_fields("A", 10.0)).await.unwrap();
        let patch: HashMap<String, Value> =
            [("price".to_string(), json!(20.0))].into_iter().collect();
        let updated = store.update(created.id(), patch).await.unwrap().unwrap();
        assert_eq!(updated.text("name"), Some("A"));
        assert_eq!(updated.number("price"), Some(20.0));
    }

    #[tokio::test]
    async fn update_missing_id_returns_none() {
        let store = item_store();
        let patch: HashMap<String, Value> =
            [("price".to_string(), json!(1.0))].into_iter().collect();
        assert!(store.update(RecordId::new(5), patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_then_get_is_absent() {
        let store = item_store();
        let created = store.create(item_fields("Ephemeral", 1.0)).await.unwrap();
        assert!(store.delete(created.id()).await.unwrap());
        assert!(store.get(created.id()).await.unwrap().is_none());
        // second delete misses
        assert!(!store.delete(created.id()).await.unwrap());
    }

    #[tokio::test]
    async fn list_paginates_in_insertion_order() {
        let store = item_store();
        for i in 1..=15 {
            store
                .create(item_fields(&format!("Item {}", i), i as f64))
                .await
                .unwrap();
        }
        let page = store.list(5, 5).await.unwrap();
        let names: Vec<&str> = page.iter().filter_map(|r| r.text("name")).collect();
        assert_eq!(names, ["Item 6", "Item 7", "Item 8", "Item 9", "Item 10"]);
    }

    #[tokio::test]
    async fn list_skip_past_end_is_empty() {
        let store = item_store();
        store.create(item_fields("Only", 1.0)).await.unwrap();
        assert!(store.list(10, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_applies_min_price_filter() {
        let store = item_store();
        store.create(item_fields("Item 1", 5.0)).await.unwrap();
        let expensive = store.create(item_fields("Item 2", 20.0)).await.unwrap();

        let filters: SearchFilters = [(
            "price".to_string(),
            FieldFilter::Range {
                min: Some(10.0),
                max: None,
            },
        )]
        .into_iter()
        .collect();
        let hits = store.search("item", &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), expensive.id());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_across_text_fields() {
        let store = item_store();
        let fields: HashMap<String, Value> = [
            ("name".to_string(), json!("Cable")),
            ("description".to_string(), json!("USB-C Charging cable")),
            ("price".to_string(), json!(7.0)),
        ]
        .into_iter()
        .collect();
        store.create(fields).await.unwrap();

        assert_eq!(
            store.search("CHARGING", &SearchFilters::new()).await.unwrap().len(),
            1
        );
        assert!(store.search("hdmi", &SearchFilters::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_equality_filter_on_status() {
        let store = InMemoryRecordStore::new(["title"]);
        let fields = |status: &str| -> HashMap<String, Value> {
            [
                ("title".to_string(), json!("Ship release")),
                ("status".to_string(), json!(status)),
            ]
            .into_iter()
            .collect()
        };
        store.create(fields("pending")).await.unwrap();
        let done = store.create(fields("completed")).await.unwrap();

        let filters: SearchFilters = [(
            "status".to_string(),
            FieldFilter::Equals(json!("completed")),
        )]
        .into_iter()
        .collect();
        let hits = store.search("ship", &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), done.id());
    }

    #[tokio::test]
    async fn filter_on_missing_field_excludes_record() {
        let store = item_store();
        let fields: HashMap<String, Value> =
            [("name".to_string(), json!("No price tag"))].into_iter().collect();
        store.create(fields).await.unwrap();

        let filters: SearchFilters = [(
            "price".to_string(),
            FieldFilter::Range {
                min: Some(0.0),
                max: None,
            },
        )]
        .into_iter()
        .collect();
        assert!(store.search("price tag", &filters).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn count_tracks_inserts_and_deletes() {
        let store = item_store();
        assert_eq!(store.count().await.unwrap(), 0);
        let record = store.create(item_fields("One", 1.0)).await.unwrap();
        store.create(item_fields("Two", 2.0)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        store.delete(record.id()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    // Concrete end-to-end scenario over the store operations.
    #[tokio::test]
    async fn crud_scenario() {
        let store = item_store();
        let first = store.create(item_fields("Item 1", 10.0)).await.unwrap();
        store.create(item_fields("Item 2", 20.0)).await.unwrap();
        store.create(item_fields("Item 3", 30.0)).await.unwrap();

        let all = store.list(0, 10).await.unwrap();
        let names: Vec<&str> = all.iter().filter_map(|r| r.text("name")).collect();
        assert_eq!(names, ["Item 1", "Item 2", "Item 3"]);

        assert!(store.get(RecordId::new(99)).await.unwrap().is_none());

        let patch: HashMap<String, Value> =
            [("price".to_string(), json!(15.0))].into_iter().collect();
        store.update(first.id(), patch).await.unwrap().unwrap();
        let refetched = store.get(first.id()).await.unwrap().unwrap();
        assert_eq!(refetched.number("price"), Some(15.0));
        assert_eq!(refetched.text("name"), Some("Item 1"));
    }
}
