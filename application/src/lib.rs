use async_trait::async_trait;
use domain::{
    DomainError, Record, RecordId, require_in_range, require_positive, require_text,
    require_text_within,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use sysinfo::{MemoryRefreshKind, Pid, System};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// --- Application Errors ---
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("{resource} with id {id} not found")]
    NotFound {
        resource: &'static str,
        id: RecordId,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Domain validation error: {0}")]
    DomainError(#[from] DomainError), // Propagate domain errors cleanly
}

// --- Pagination & query limits ---

pub const DEFAULT_PAGE_SIZE: usize = 10;
/// Sensible maximum page size to prevent abuse.
pub const MAX_PAGE_SIZE: usize = 100;
/// Maximum accepted search query length in characters.
pub const MAX_QUERY_LENGTH: usize = 100;

const MAX_NAME_LENGTH: usize = 100;
const MAX_TITLE_LENGTH: usize = 200;
const MAX_DESCRIPTION_LENGTH: usize = 500;

// --- Search filters ---

/// A single filter applied to one record field after the substring match.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    /// The field value must equal this value exactly.
    Equals(Value),
    /// The numeric field value must fall inside the (open-ended) range.
    Range { min: Option<f64>, max: Option<f64> },
}

/// Field name -> filter condition.
pub type SearchFilters = HashMap<String, FieldFilter>;

// --- Infrastructure Interface (Trait) ---

/// Interface for a collection of records with store-assigned integer ids.
///
/// Ids are assigned monotonically and never recycled; `list` and `search`
/// return records in insertion order. Absence is reported as `None`/`false`
/// here; the services above translate it into `ApplicationError::NotFound`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record, assigning the next id. Always succeeds.
    async fn create(&self, fields: HashMap<String, Value>) -> Result<Record, ApplicationError>;
    /// Retrieves a record by id.
    async fn get(&self, id: RecordId) -> Result<Option<Record>, ApplicationError>;
    /// Returns records in insertion order, skipping `skip` and returning at
    /// most `limit`.
    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Record>, ApplicationError>;
    /// Overwrites only the keys present in `patch`; `None` if the id is
    /// absent.
    async fn update(
        &self,
        id: RecordId,
        patch: HashMap<String, Value>,
    ) -> Result<Option<Record>, ApplicationError>;
    /// Removes a record. Returns `false` if the id was absent.
    async fn delete(&self, id: RecordId) -> Result<bool, ApplicationError>;
    /// Case-insensitive substring match of `query` against the store's
    /// searchable text fields, then applies `filters` to the matched subset.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<Record>, ApplicationError>;
    /// Total number of records currently stored.
    async fn count(&self) -> Result<usize, ApplicationError>;
}

// --- Request/Response Models (DTOs) ---

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Pagination query parameters for list endpoints.
#[derive(Deserialize, Debug)]
pub struct ListQuery {
    /// Number of records to skip.
    #[serde(default)]
    pub skip: usize,
    /// Maximum number of records to return.
    #[serde(default = "default_page_size")]
    pub limit: usize,
}

#[derive(Deserialize, Debug)]
pub struct ItemCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
}

impl ItemCreate {
    pub fn validate(&self) -> Result<(), DomainError> {
        require_text("name", &self.name, MAX_NAME_LENGTH)?;
        if let Some(description) = &self.description {
            require_text_within("description", description, MAX_DESCRIPTION_LENGTH)?;
        }
        require_positive("price", self.price)
    }

    pub fn into_fields(self) -> HashMap<String, Value> {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), Value::String(self.name));
        if let Some(description) = self.description {
            fields.insert("description".to_string(), Value::String(description));
        }
        fields.insert("price".to_string(), json!(self.price));
        fields
    }
}

/// Partial update: only the fields carried in the request are overwritten.
#[derive(Deserialize, Debug, Default)]
pub struct ItemUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
}

impl ItemUpdate {
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(name) = &self.name {
            require_text("name", name, MAX_NAME_LENGTH)?;
        }
        if let Some(description) = &self.description {
            require_text_within("description", description, MAX_DESCRIPTION_LENGTH)?;
        }
        if let Some(price) = self.price {
            require_positive("price", price)?;
        }
        Ok(())
    }

    /// Builds the patch map carrying only the supplied keys.
    pub fn into_patch(self) -> HashMap<String, Value> {
        let mut patch = HashMap::new();
        if let Some(name) = self.name {
            patch.insert("name".to_string(), Value::String(name));
        }
        if let Some(description) = self.description {
            patch.insert("description".to_string(), Value::String(description));
        }
        if let Some(price) = self.price {
            patch.insert("price".to_string(), json!(price));
        }
        patch
    }
}

#[derive(Serialize, Debug)]
pub struct ItemResponse {
    pub id: u64,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
}

impl ItemResponse {
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id().value(),
            name: record.text("name").unwrap_or_default().to_string(),
            description: record.text("description").map(str::to_string),
            price: record.number("price").unwrap_or_default(),
        }
    }
}

fn default_status() -> String {
    "pending".to_string()
}

fn default_priority() -> i64 {
    3
}

#[derive(Deserialize, Debug)]
pub struct TaskCreate {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// pending, in_progress, completed
    #[serde(default = "default_status")]
    pub status: String,
    /// 1-5 scale
    #[serde(default = "default_priority")]
    pub priority: i64,
}

impl TaskCreate {
    pub fn validate(&self) -> Result<(), DomainError> {
        require_text("title", &self.title, MAX_TITLE_LENGTH)?;
        if let Some(description) = &self.description {
            require_text_within("description", description, MAX_DESCRIPTION_LENGTH)?;
        }
        require_in_range("priority", self.priority, 1, 5)
    }

    pub fn into_fields(self) -> HashMap<String, Value> {
        let mut fields = HashMap::new();
        fields.insert("title".to_string(), Value::String(self.title));
        if let Some(description) = self.description {
            fields.insert("description".to_string(), Value::String(description));
        }
        fields.insert("status".to_string(), Value::String(self.status));
        fields.insert("priority".to_string(), json!(self.priority));
        fields
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct TaskUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl TaskUpdate {
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(title) = &self.title {
            require_text("title", title, MAX_TITLE_LENGTH)?;
        }
        if let Some(description) = &self.description {
            require_text_within("description", description, MAX_DESCRIPTION_LENGTH)?;
        }
        if let Some(priority) = self.priority {
            require_in_range("priority", priority, 1, 5)?;
        }
        Ok(())
    }

    pub fn into_patch(self) -> HashMap<String, Value> {
        let mut patch = HashMap::new();
        if let Some(title) = self.title {
            patch.insert("title".to_string(), Value::String(title));
        }
        if let Some(description) = self.description {
            patch.insert("description".to_string(), Value::String(description));
        }
        if let Some(status) = self.status {
            patch.insert("status".to_string(), Value::String(status));
        }
        if let Some(priority) = self.priority {
            patch.insert("priority".to_string(), json!(priority));
        }
        patch
    }
}

#[derive(Serialize, Debug)]
pub struct TaskResponse {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: i64,
}

impl TaskResponse {
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id().value(),
            title: record.text("title").unwrap_or_default().to_string(),
            description: record.text("description").map(str::to_string),
            status: record.text("status").unwrap_or_default().to_string(),
            priority: record
                .field("priority")
                .and_then(Value::as_i64)
                .unwrap_or(default_priority()),
        }
    }
}

/// Query parameters of the cross-collection search endpoint.
#[derive(Deserialize, Debug)]
pub struct SearchQuery {
    pub query: String,
    /// Minimum item price filter.
    #[serde(default)]
    pub min_price: Option<f64>,
    /// Maximum item price filter.
    #[serde(default)]
    pub max_price: Option<f64>,
    /// Task status filter.
    #[serde(default)]
    pub status: Option<String>,
}

/// A single cross-collection search result.
#[derive(Serialize, Debug, PartialEq)]
pub struct SearchHit {
    pub id: u64,
    pub title: String,
    /// Which collection the hit came from: "item" or "task".
    pub source: &'static str,
}

#[derive(Serialize, Debug)]
pub struct CountResponse {
    pub count: usize,
}

/// Body of the 200-with-message delete response shape.
#[derive(Serialize, Debug)]
pub struct DeleteConfirmation {
    pub message: String,
    pub id: u64,
}

// --- Application Services (Use Cases) ---

/// CRUD service over one record collection. The API layer holds one
/// instance per collection (items, tasks).
pub struct RecordService {
    resource: &'static str,
    store: Arc<dyn RecordStore>,
}

impl RecordService {
    pub fn new(resource: &'static str, store: Arc<dyn RecordStore>) -> Self {
        Self { resource, store }
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    #[instrument(skip(self, fields), fields(resource = self.resource))]
    pub async fn create(
        &self,
        fields: HashMap<String, Value>,
    ) -> Result<Record, ApplicationError> {
        let record = self.store.create(fields).await?;
        info!(resource = self.resource, id = %record.id(), "Record created");
        Ok(record)
    }

    #[instrument(skip(self), fields(resource = self.resource))]
    pub async fn get(&self, id: RecordId) -> Result<Record, ApplicationError> {
        self.store.get(id).await?.ok_or_else(|| {
            warn!(resource = self.resource, id = %id, "Record not found");
            ApplicationError::NotFound {
                resource: self.resource,
                id,
            }
        })
    }

    #[instrument(skip(self), fields(resource = self.resource))]
    pub async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Record>, ApplicationError> {
        // Clamp the page size into [1, MAX_PAGE_SIZE]
        let limit = limit.min(MAX_PAGE_SIZE).max(1);
        let records = self.store.list(skip, limit).await?;
        debug!(
            resource = self.resource,
            skip,
            limit,
            returned = records.len(),
            "Listed records"
        );
        Ok(records)
    }

    #[instrument(skip(self, patch), fields(resource = self.resource))]
    pub async fn update(
        &self,
        id: RecordId,
        patch: HashMap<String, Value>,
    ) -> Result<Record, ApplicationError> {
        let updated = self.store.update(id, patch).await?.ok_or_else(|| {
            warn!(resource = self.resource, id = %id, "Update failed: record not found");
            ApplicationError::NotFound {
                resource: self.resource,
                id,
            }
        })?;
        info!(resource = self.resource, id = %id, "Record updated");
        Ok(updated)
    }

    #[instrument(skip(self), fields(resource = self.resource))]
    pub async fn delete(&self, id: RecordId) -> Result<(), ApplicationError> {
        if self.store.delete(id).await? {
            info!(resource = self.resource, id = %id, "Record deleted");
            Ok(())
        } else {
            warn!(resource = self.resource, id = %id, "Delete failed: record not found");
            Err(ApplicationError::NotFound {
                resource: self.resource,
                id,
            })
        }
    }

    #[instrument(skip(self), fields(resource = self.resource))]
    pub async fn count(&self) -> Result<usize, ApplicationError> {
        self.store.count().await
    }
}

/// Cross-collection substring search over the item and task stores.
pub struct SearchService {
    items: Arc<dyn RecordStore>,
    tasks: Arc<dyn RecordStore>,
}

impl SearchService {
    pub fn new(items: Arc<dyn RecordStore>, tasks: Arc<dyn RecordStore>) -> Self {
        Self { items, tasks }
    }

    #[instrument(skip(self, request), fields(query = %request.query))]
    pub async fn search(&self, request: SearchQuery) -> Result<Vec<SearchHit>, ApplicationError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ApplicationError::InvalidInput(
                "Search query cannot be empty".to_string(),
            ));
        }
        if query.chars().count() > MAX_QUERY_LENGTH {
            return Err(ApplicationError::InvalidInput(format!(
                "Search query exceeds {} characters",
                MAX_QUERY_LENGTH
            )));
        }

        // Items: price range filter applies to the matched subset.
        let mut item_filters = SearchFilters::new();
        if request.min_price.is_some() || request.max_price.is_some() {
            item_filters.insert(
                "price".to_string(),
                FieldFilter::Range {
                    min: request.min_price,
                    max: request.max_price,
                },
            );
        }

        // Tasks: status equality filter.
        let mut task_filters = SearchFilters::new();
        if let Some(status) = &request.status {
            task_filters.insert(
                "status".to_string(),
                FieldFilter::Equals(Value::String(status.clone())),
            );
        }

        let (item_hits, task_hits) = tokio::join!(
            self.items.search(query, &item_filters),
            self.tasks.search(query, &task_filters)
        );

        let mut hits: Vec<SearchHit> = Vec::new();
        for record in item_hits? {
            hits.push(SearchHit {
                id: record.id().value(),
                title: record.text("name").unwrap_or_default().to_string(),
                source: "item",
            });
        }
        for record in task_hits? {
            hits.push(SearchHit {
                id: record.id().value(),
                title: record.text("title").unwrap_or_default().to_string(),
                source: "task",
            });
        }

        info!(query = %query, total_hits = hits.len(), "Search completed");
        Ok(hits)
    }
}

// --- Stats ---

#[derive(Serialize, Debug)]
pub struct EngineStats {
    total_items: usize,
    total_tasks: usize,
    total_records: usize,
}

#[derive(Serialize, Debug)]
pub struct MemoryStats {
    total_bytes: u64,
    used_bytes: u64,
    available_bytes: u64,
    process_used_bytes: u64, // Memory used by this specific process
}

#[derive(Serialize, Debug)]
pub struct SystemInfo {
    os_name: String,
    os_version: String,
}

/// Response for the /stats endpoint.
#[derive(Serialize, Debug)]
pub struct StatsResponse {
    system_info: SystemInfo,
    memory: MemoryStats,
    engine: EngineStats,
}

pub struct StatsService {
    items: Arc<dyn RecordStore>,
    tasks: Arc<dyn RecordStore>,
}

impl StatsService {
    pub fn new(items: Arc<dyn RecordStore>, tasks: Arc<dyn RecordStore>) -> Self {
        Self { items, tasks }
    }

    #[instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<StatsResponse, ApplicationError> {
        debug!("Gathering engine and system statistics");

        let (items_result, tasks_result) = tokio::join!(self.items.count(), self.tasks.count());
        let total_items = items_result?;
        let total_tasks = tasks_result?;
        let engine = EngineStats {
            total_items,
            total_tasks,
            total_records: total_items + total_tasks,
        };

        // sysinfo calls are synchronous; keep them off the async runtime.
        let (system_info, memory) = tokio::task::spawn_blocking(move || {
            let mut sys = System::new_all();
            sys.refresh_memory_specifics(MemoryRefreshKind::everything());

            let current_pid = Pid::from(std::process::id() as usize);
            let process_memory = sys.process(current_pid).map_or(0, |p| p.memory());

            let memory = MemoryStats {
                total_bytes: sys.total_memory(),
                used_bytes: sys.used_memory(),
                available_bytes: sys.available_memory(),
                process_used_bytes: process_memory,
            };
            let system_info = SystemInfo {
                os_name: System::name().unwrap_or_else(|| "Unknown OS".to_string()),
                os_version: System::os_version().unwrap_or_else(|| "Unknown Version".to_string()),
            };
            (system_info, memory)
        })
        .await
        .map_err(|e| ApplicationError::StoreError(format!("Stat gathering task failed: {}", e)))?;

        Ok(StatsResponse {
            system_info,
            memory,
            engine,
        })
    }
}

// --- Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the arguments of the last list/search call; every lookup
    /// misses.
    #[derive(Default)]
    struct ProbeStore {
        list_args: Mutex<Option<(usize, usize)>>,
        search_args: Mutex<Option<(String, SearchFilters)>>,
    }

    #[async_trait]
    impl RecordStore for ProbeStore {
        async fn create(
            &self,
            fields: HashMap<String, Value>,
        ) -> Result<Record, ApplicationError> {
            Ok(Record::new(RecordId::new(1), fields))
        }

        async fn get(&self, _id: RecordId) -> Result<Option<Record>, ApplicationError> {
            Ok(None)
        }

        async fn list(&self, skip: usize, limit: usize) -> Result<Vec<Record>, ApplicationError> {
            *self.list_args.lock().unwrap() = Some((skip, limit));
            Ok(Vec::new())
        }

        async fn update(
            &self,
            _id: RecordId,
            _patch: HashMap<String, Value>,
        ) -> Result<Option<Record>, ApplicationError> {
            Ok(None)
        }

        async fn delete(&self, _id: RecordId) -> Result<bool, ApplicationError> {
            Ok(false)
        }

        async fn search(
            &self,
            query: &str,
            filters: &SearchFilters,
        ) -> Result<Vec<Record>, ApplicationError> {
            *self.search_args.lock().unwrap() = Some((query.to_string(), filters.clone()));
            Ok(Vec::new())
        }

        async fn count(&self) -> Result<usize, ApplicationError> {
            Ok(0)
        }
    }

    fn probe_service() -> (Arc<ProbeStore>, RecordService) {
        let store = Arc::new(ProbeStore::default());
        let service = RecordService::new("item", store.clone());
        (store, service)
    }

    #[tokio::test]
    async fn get_maps_miss_to_not_found() {
        let (_, service) = probe_service();
        let err = service.get(RecordId::new(42)).await.unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::NotFound { resource: "item", id } if id.value() == 42
        ));
    }

    #[tokio::test]
    async fn delete_maps_miss_to_not_found() {
        let (_, service) = probe_service();
        let err = service.delete(RecordId::new(7)).await.unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_clamps_limit_into_bounds() {
        let (store, service) = probe_service();
        service.list(0, 500).await.unwrap();
        assert_eq!(*store.list_args.lock().unwrap(), Some((0, MAX_PAGE_SIZE)));

        service.list(3, 0).await.unwrap();
        assert_eq!(*store.list_args.lock().unwrap(), Some((3, 1)));
    }

    #[tokio::test]
    async fn search_rejects_empty_query() {
        let service = SearchService::new(
            Arc::new(ProbeStore::default()),
            Arc::new(ProbeStore::default()),
        );
        let request = SearchQuery {
            query: "   ".to_string(),
            min_price: None,
            max_price: None,
            status: None,
        };
        let err = service.search(request).await.unwrap_err();
        assert!(matches!(err, ApplicationError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn search_builds_filters_per_store() {
        let items = Arc::new(ProbeStore::default());
        let tasks = Arc::new(ProbeStore::default());
        let service = SearchService::new(items.clone(), tasks.clone());
        let request = SearchQuery {
            query: " widget ".to_string(),
            min_price: Some(10.0),
            max_price: None,
            status: Some("pending".to_string()),
        };
        service.search(request).await.unwrap();

        let (item_query, item_filters) = items.search_args.lock().unwrap().take().unwrap();
        assert_eq!(item_query, "widget"); // trimmed
        assert_eq!(
            item_filters.get("price"),
            Some(&FieldFilter::Range {
                min: Some(10.0),
                max: None
            })
        );

        let (_, task_filters) = tasks.search_args.lock().unwrap().take().unwrap();
        assert_eq!(
            task_filters.get("status"),
            Some(&FieldFilter::Equals(json!("pending")))
        );
    }

    #[test]
    fn item_create_validation() {
        let valid = ItemCreate {
            name: "Widget".to_string(),
            description: None,
            price: 9.99,
        };
        assert!(valid.validate().is_ok());

        let free = ItemCreate {
            name: "Widget".to_string(),
            description: None,
            price: 0.0,
        };
        assert!(free.validate().is_err());

        let nameless = ItemCreate {
            name: "".to_string(),
            description: None,
            price: 1.0,
        };
        assert!(nameless.validate().is_err());
    }

    #[test]
    fn item_update_patch_carries_only_supplied_keys() {
        let update = ItemUpdate {
            price: Some(20.0),
            ..Default::default()
        };
        let patch = update.into_patch();
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get("price"), Some(&json!(20.0)));
    }

    #[test]
    fn task_create_defaults_from_json() {
        let task: TaskCreate = serde_json::from_value(json!({"title": "Write docs"})).unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.priority, 3);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn task_create_rejects_out_of_range_priority() {
        let task: TaskCreate =
            serde_json::from_value(json!({"title": "Write docs", "priority": 9})).unwrap();
        assert!(task.validate().is_err());
    }

    #[test]
    fn list_query_defaults() {
        let query: ListQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(query.skip, 0);
        assert_eq!(query.limit, DEFAULT_PAGE_SIZE);
    }
}
