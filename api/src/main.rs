// ./api/src/main.rs
use axum::{
    Json,
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::{delete, get, post, put},
};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Import application layer components
use application::{
    ApplicationError,
    CountResponse,
    DeleteConfirmation,
    // DTOs / Requests / Responses
    ItemCreate,
    ItemResponse,
    ItemUpdate,
    ListQuery,
    // Services
    RecordService,
    SearchQuery,
    SearchService,
    StatsService,
    TaskCreate,
    TaskResponse,
    TaskUpdate,
};
use domain::RecordId;
// Import infrastructure layer implementations
use infrastructure::InMemoryRecordStore;

/// How a successful delete is reported. The two source variants disagree
/// (204 without a body vs 200 with a message), so both shapes are kept and
/// selected through the DELETE_RESPONSE environment variable.
#[derive(Clone, Copy, Debug, PartialEq)]
enum DeleteStyle {
    NoContent,
    Message,
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    items: Arc<RecordService>,
    tasks: Arc<RecordService>,
    search_service: Arc<SearchService>,
    stats_service: Arc<StatsService>,
    delete_style: DeleteStyle,
}

const DEFAULT_PORT: u16 = 3000;

// Application entry point
#[tokio::main]
async fn main() {
    let port = match env::var("PORT") {
        Ok(port_str) => match u16::from_str(&port_str) {
            Ok(port_num) => {
                info!("Using port {} from environment variable PORT.", port_num);
                port_num
            }
            Err(_) => {
                warn!(
                    "Invalid PORT value '{}' in environment variable. Using default port {}.",
                    port_str, DEFAULT_PORT
                );
                DEFAULT_PORT
            }
        },
        Err(_) => {
            info!(
                "PORT environment variable not set. Using default port {}.",
                DEFAULT_PORT
            );
            DEFAULT_PORT
        }
    };

    let delete_style = match env::var("DELETE_RESPONSE") {
        Ok(value) => match value.as_str() {
            "message" => DeleteStyle::Message,
            "no-content" => DeleteStyle::NoContent,
            other => {
                warn!(
                    "Unknown DELETE_RESPONSE value '{}'. Using 'no-content'.",
                    other
                );
                DeleteStyle::NoContent
            }
        },
        Err(_) => DeleteStyle::NoContent,
    };

    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    // --- Dependency Injection ---
    // 1. Create infrastructure components: one store per collection, each
    //    with its own searchable text fields.
    let item_store = Arc::new(InMemoryRecordStore::new(["name", "description"]));
    let task_store = Arc::new(InMemoryRecordStore::new(["title"]));
    info!("In-memory stores initialized.");

    // 2. Create application services, injecting dependencies
    let items = Arc::new(RecordService::new("Item", item_store.clone()));
    let tasks = Arc::new(RecordService::new("Task", task_store.clone()));
    let search_service = Arc::new(SearchService::new(item_store.clone(), task_store.clone()));
    let stats_service = Arc::new(StatsService::new(item_store, task_store));
    info!("Application services initialized.");

    // 3. Create the application state
    let app_state = AppState {
        items,
        tasks,
        search_service,
        stats_service,
        delete_style,
    };

    // --- API Router Definition ---
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/stats", get(get_stats_handler))
        // Item Endpoints
        .route("/items", post(create_item_handler))
        .route("/items", get(list_items_handler))
        .route("/items/count", get(count_items_handler))
        .route("/items/:id", get(get_item_handler))
        .route("/items/:id", put(update_item_handler))
        .route("/items/:id", delete(delete_item_handler))
        // Task Endpoints
        .route("/tasks", post(create_task_handler))
        .route("/tasks", get(list_tasks_handler))
        .route("/tasks/count", get(count_tasks_handler))
        .route("/tasks/:id", get(get_task_handler))
        .route("/tasks/:id", put(update_task_handler))
        .route("/tasks/:id", delete(delete_task_handler))
        // Cross-collection search
        .route("/search", get(search_handler))
        // Provide the application state to the handlers
        .with_state(app_state);

    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server starting on {}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Server listening on {}", addr);
            listener
        }
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

// --- API Handlers ---

async fn root_handler() -> impl IntoResponse {
    JsonResponse(serde_json::json!({
        "message": "Items/tasks record store API",
        "health": "/health"
    }))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

// --- Item Handlers ---

/// Handler for creating an item (POST /items).
async fn create_item_handler(
    State(state): State<AppState>,
    Json(payload): Json<ItemCreate>,
) -> Response {
    info!(name = %payload.name, "Received request to create item");
    if let Err(e) = payload.validate() {
        return map_application_error_to_response(e.into());
    }
    match state.items.create(payload.into_fields()).await {
        Ok(record) => (
            StatusCode::CREATED,
            JsonResponse(ItemResponse::from_record(&record)),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to create item via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for listing items with pagination (GET /items?skip&limit).
async fn list_items_handler(
    State(state): State<AppState>,
    Query(pagination): Query<ListQuery>,
) -> Response {
    match state.items.list(pagination.skip, pagination.limit).await {
        Ok(records) => {
            let items: Vec<ItemResponse> = records.iter().map(ItemResponse::from_record).collect();
            (StatusCode::OK, JsonResponse(items)).into_response()
        }
        Err(e) => {
            error!("Failed to list items via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for the total item count (GET /items/count).
async fn count_items_handler(State(state): State<AppState>) -> Response {
    match state.items.count().await {
        Ok(count) => (StatusCode::OK, JsonResponse(CountResponse { count })).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for fetching one item (GET /items/:id).
async fn get_item_handler(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.items.get(RecordId::new(id)).await {
        Ok(record) => (
            StatusCode::OK,
            JsonResponse(ItemResponse::from_record(&record)),
        )
            .into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for partially updating an item (PUT /items/:id). Only the fields
/// carried in the body are overwritten.
async fn update_item_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(payload): Json<ItemUpdate>,
) -> Response {
    info!(id, "Received request to update item");
    if let Err(e) = payload.validate() {
        return map_application_error_to_response(e.into());
    }
    match state.items.update(RecordId::new(id), payload.into_patch()).await {
        Ok(record) => (
            StatusCode::OK,
            JsonResponse(ItemResponse::from_record(&record)),
        )
            .into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for deleting an item (DELETE /items/:id).
async fn delete_item_handler(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    info!(id, "Received request to delete item");
    match state.items.delete(RecordId::new(id)).await {
        Ok(()) => delete_success_response(state.delete_style, "Item deleted successfully", id),
        Err(e) => map_application_error_to_response(e),
    }
}

// --- Task Handlers ---

/// Handler for creating a task (POST /tasks).
async fn create_task_handler(
    State(state): State<AppState>,
    Json(payload): Json<TaskCreate>,
) -> Response {
    info!(title = %payload.title, "Received request to create task");
    if let Err(e) = payload.validate() {
        return map_application_error_to_response(e.into());
    }
    match state.tasks.create(payload.into_fields()).await {
        Ok(record) => (
            StatusCode::CREATED,
            JsonResponse(TaskResponse::from_record(&record)),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to create task via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for listing tasks with pagination (GET /tasks?skip&limit).
async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(pagination): Query<ListQuery>,
) -> Response {
    match state.tasks.list(pagination.skip, pagination.limit).await {
        Ok(records) => {
            let tasks: Vec<TaskResponse> = records.iter().map(TaskResponse::from_record).collect();
            (StatusCode::OK, JsonResponse(tasks)).into_response()
        }
        Err(e) => {
            error!("Failed to list tasks via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Handler for the total task count (GET /tasks/count).
async fn count_tasks_handler(State(state): State<AppState>) -> Response {
    match state.tasks.count().await {
        Ok(count) => (StatusCode::OK, JsonResponse(CountResponse { count })).into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for fetching one task (GET /tasks/:id).
async fn get_task_handler(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.tasks.get(RecordId::new(id)).await {
        Ok(record) => (
            StatusCode::OK,
            JsonResponse(TaskResponse::from_record(&record)),
        )
            .into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for partially updating a task (PUT /tasks/:id).
async fn update_task_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(payload): Json<TaskUpdate>,
) -> Response {
    info!(id, "Received request to update task");
    if let Err(e) = payload.validate() {
        return map_application_error_to_response(e.into());
    }
    match state.tasks.update(RecordId::new(id), payload.into_patch()).await {
        Ok(record) => (
            StatusCode::OK,
            JsonResponse(TaskResponse::from_record(&record)),
        )
            .into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Handler for deleting a task (DELETE /tasks/:id).
async fn delete_task_handler(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    info!(id, "Received request to delete task");
    match state.tasks.delete(RecordId::new(id)).await {
        Ok(()) => delete_success_response(state.delete_style, "Task deleted successfully", id),
        Err(e) => map_application_error_to_response(e),
    }
}

// --- Search Handler ---

/// Handler for cross-collection search
/// (GET /search?query&min_price&max_price&status).
async fn search_handler(
    State(state): State<AppState>,
    Query(request): Query<SearchQuery>,
) -> Response {
    info!(
        query = %request.query,
        min_price = ?request.min_price,
        max_price = ?request.max_price,
        status = ?request.status,
        "Received search request"
    );
    match state.search_service.search(request).await {
        Ok(hits) => (StatusCode::OK, JsonResponse(hits)).into_response(),
        Err(e) => {
            warn!("Search failed via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

async fn get_stats_handler(State(state): State<AppState>) -> Response {
    match state.stats_service.get_stats().await {
        Ok(stats_response) => (StatusCode::OK, JsonResponse(stats_response)).into_response(),
        Err(e) => {
            error!("Failed to get statistics via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

/// Builds the configured success response for a delete.
fn delete_success_response(style: DeleteStyle, message: &str, id: u64) -> Response {
    match style {
        DeleteStyle::NoContent => (StatusCode::NO_CONTENT, "").into_response(),
        DeleteStyle::Message => (
            StatusCode::OK,
            JsonResponse(DeleteConfirmation {
                message: message.to_string(),
                id,
            }),
        )
            .into_response(),
    }
}

/// Helper function to map ApplicationError enum to HTTP status codes and
/// response body.
fn map_application_error_to_response(err: ApplicationError) -> Response {
    let (status, body) = match err {
        ApplicationError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        ApplicationError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        ApplicationError::DomainError(domain_err) => {
            // Map domain validation errors to Bad Request
            warn!("Domain validation failed: {}", domain_err);
            (StatusCode::BAD_REQUEST, domain_err.to_string())
        }
        ApplicationError::StoreError(msg) => {
            error!("Underlying store error: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal server error occurred".to_string(),
            )
        }
    };
    (status, body).into_response()
}
