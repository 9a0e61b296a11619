//! OpenSASE Fulfillment - stock, orders and sales over HTTP with bus notifications

use std::sync::Arc;

use anyhow::Result;
use axum::{extract::{Path, Query, State}, http::StatusCode, routing::{delete, get, post, put}, Json, Router};
use opensase_fulfillment::{
    fulfillment::{DailyRevenue, DailySales, FulfillmentSummary, OfflinePayments, Period, SalesComparison},
    messaging::{HandlerRegistry, NatsTransport},
    Config, ConnectionManager, ConnectionState, FulfillmentError, FulfillmentService, InMemoryStore, Money,
    NotificationPublisher, Order, OrderError, OrderLine, OrderStatus, PgStore, Product, Sale, StockLevels, Store,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct AppState { pub service: FulfillmentService, pub bus: ConnectionManager }

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();
    let config = Config::from_env()?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PgStore::new(pool);
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let bus = ConnectionManager::with_publish_timeout(
        config.nats_url.clone(),
        Arc::new(NatsTransport::new(config.bus_client_name.clone())),
        config.backoff_policy(),
        HandlerRegistry::with_default_handlers(),
        config.publish_timeout,
    );
    bus.start().await;
    let service = FulfillmentService::new(store, NotificationPublisher::new(bus.clone()), Arc::new(OfflinePayments));
    let state = AppState { service, bus: bus.clone() };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/bus", get(bus_state))
        .route("/api/v1/bus/reconnect", post(bus_reconnect))
        .route("/api/v1/products", post(add_product))
        .route("/api/v1/products/:id", delete(delete_product))
        .route("/api/v1/orders", post(place_order))
        .route("/api/v1/orders/:id/status", put(update_status))
        .route("/api/v1/orders/:id/fulfill", post(fulfill_order))
        .route("/api/v1/inventory", get(inventories))
        .route("/api/v1/inventory/:product_id", get(stock_levels).post(create_inventory))
        .route("/api/v1/inventory/:product_id/restock", post(restock))
        .route("/api/v1/sales", get(sales_between))
        .route("/api/v1/sales/order/:order_id", get(sales_for_order))
        .route("/api/v1/sales/compare", get(compare_sales))
        .route("/api/v1/sales/daily", get(daily_sales))
        .route("/api/v1/revenue", get(revenue))
        .route("/api/v1/revenue/daily", get(daily_revenue))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state);

    tracing::info!("🚀 OpenSASE Fulfillment listening on 0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    axum::serve(listener, app).with_graceful_shutdown(async { tokio::signal::ctrl_c().await.ok(); }).await?;
    bus.stop();
    Ok(())
}

fn reject(e: FulfillmentError) -> (StatusCode, String) {
    let status = match &e {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        FulfillmentError::InsufficientStock { .. } | FulfillmentError::InventoryExists(_) => StatusCode::CONFLICT,
        FulfillmentError::InvalidOrder(OrderError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        FulfillmentError::Payment(_) => StatusCode::PAYMENT_REQUIRED,
        FulfillmentError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.to_string())
}

fn invalid(e: validator::ValidationErrors) -> (StatusCode, String) { (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()) }

async fn health(State(s): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "service": "opensase-fulfillment", "bus": s.bus.state()}))
}

async fn bus_state(State(s): State<AppState>) -> Json<ConnectionState> { Json(s.bus.state()) }

async fn bus_reconnect(State(s): State<AppState>) -> Json<ConnectionState> { Json(s.bus.reconnect().await) }

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 200))] pub name: String,
    pub stock: u32, pub cost_price: Decimal, pub selling_price: Decimal,
    #[validate(length(equal = 3))] pub currency: Option<String>,
    #[serde(default = "default_true")] pub with_inventory: bool,
}

fn default_true() -> bool { true }

#[derive(Debug, Serialize)] pub struct ProductResponse { pub id: Uuid, pub name: String, pub stock: i64, pub cost_price: Money, pub selling_price: Money }

async fn add_product(State(s): State<AppState>, Json(r): Json<CreateProductRequest>) -> Result<(StatusCode, Json<ProductResponse>), (StatusCode, String)> {
    r.validate().map_err(invalid)?;
    let currency = r.currency.as_deref().unwrap_or("USD");
    let product = Product::create(r.name, r.stock, Money::new(r.cost_price, currency), Money::new(r.selling_price, currency));
    let p = s.service.add_product(product, r.with_inventory).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(ProductResponse { id: p.id(), name: p.name().to_string(), stock: p.stock(), cost_price: p.cost_price().clone(), selling_price: p.selling_price().clone() })))
}

async fn delete_product(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, (StatusCode, String)> {
    s.service.delete_product(id).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub user_id: Uuid,
    #[validate] pub items: Vec<OrderItemRequest>,
    #[validate(length(equal = 3))] pub currency: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct OrderItemRequest { pub product_id: Uuid, #[validate(range(min = 1))] pub quantity: u32, pub unit_price: Decimal }

#[derive(Debug, Serialize)]
pub struct OrderResponse { pub id: Uuid, pub user_id: Uuid, pub status: OrderStatus, pub lines: Vec<OrderLine>, pub total: Money, pub transaction_id: Option<String> }

impl From<Order> for OrderResponse {
    fn from(o: Order) -> Self {
        Self { id: o.id(), user_id: o.user_id(), status: o.status(), lines: o.lines().to_vec(), total: o.total().clone(), transaction_id: o.transaction_id().map(str::to_string) }
    }
}

async fn place_order(State(s): State<AppState>, Json(r): Json<PlaceOrderRequest>) -> Result<(StatusCode, Json<OrderResponse>), (StatusCode, String)> {
    r.validate().map_err(invalid)?;
    let currency = r.currency.as_deref().unwrap_or("USD");
    let lines = r.items.iter().map(|i| OrderLine::new(i.product_id, i.quantity, Money::new(i.unit_price, currency))).collect();
    let order = s.service.place_order(r.user_id, lines).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

#[derive(Debug, Deserialize)] pub struct StatusRequest { pub status: String }

async fn update_status(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<StatusRequest>) -> ApiResult<OrderResponse> {
    let status = OrderStatus::parse(&r.status).ok_or((StatusCode::BAD_REQUEST, format!("unknown order status {}", r.status)))?;
    let order = s.service.update_status(id, status).await.map_err(reject)?;
    Ok(Json(order.into()))
}

async fn fulfill_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<FulfillmentSummary> {
    s.service.fulfill_order(id).await.map(Json).map_err(reject)
}

async fn inventories(State(s): State<AppState>) -> ApiResult<Vec<StockLevels>> {
    s.service.inventories().await.map(Json).map_err(reject)
}

async fn stock_levels(State(s): State<AppState>, Path(product_id): Path<Uuid>) -> ApiResult<StockLevels> {
    s.service.stock_levels(product_id).await.map(Json).map_err(reject)
}

async fn create_inventory(State(s): State<AppState>, Path(product_id): Path<Uuid>) -> Result<(StatusCode, Json<StockLevels>), (StatusCode, String)> {
    let levels = s.service.create_inventory_record(product_id).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(levels)))
}

#[derive(Debug, Deserialize, Validate)] pub struct RestockRequest { #[validate(range(min = 1))] pub quantity: u32 }

async fn restock(State(s): State<AppState>, Path(product_id): Path<Uuid>, Json(r): Json<RestockRequest>) -> ApiResult<StockLevels> {
    r.validate().map_err(invalid)?;
    s.service.restock(product_id, r.quantity).await.map(Json).map_err(reject)
}

async fn sales_between(State(s): State<AppState>, Query(p): Query<Period>) -> ApiResult<Vec<Sale>> {
    s.service.sales().sales_between(p).await.map(Json).map_err(reject)
}

async fn sales_for_order(State(s): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<Vec<Sale>> {
    let sales = s.service.sales().sales_for_order(order_id).await.map_err(reject)?;
    if sales.is_empty() {
        return Err((StatusCode::NOT_FOUND, format!("no sales for order {order_id}")));
    }
    Ok(Json(sales))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareParams { pub current_start: chrono::DateTime<chrono::Utc>, pub current_end: chrono::DateTime<chrono::Utc>, pub previous_start: chrono::DateTime<chrono::Utc>, pub previous_end: chrono::DateTime<chrono::Utc> }

async fn compare_sales(State(s): State<AppState>, Query(p): Query<CompareParams>) -> ApiResult<SalesComparison> {
    let current = Period { start: p.current_start, end: p.current_end };
    let previous = Period { start: p.previous_start, end: p.previous_end };
    s.service.sales().compare_periods(current, previous).await.map(Json).map_err(reject)
}

async fn daily_sales(State(s): State<AppState>, Query(p): Query<Period>) -> ApiResult<Vec<DailySales>> {
    s.service.sales().daily_sales(p).await.map(Json).map_err(reject)
}

#[derive(Debug, Serialize)] pub struct RevenueResponse { pub start: chrono::DateTime<chrono::Utc>, pub end: chrono::DateTime<chrono::Utc>, pub revenue: Decimal }

async fn revenue(State(s): State<AppState>, Query(p): Query<Period>) -> ApiResult<RevenueResponse> {
    let revenue = s.service.sales().revenue_between(p).await.map_err(reject)?;
    Ok(Json(RevenueResponse { start: p.start, end: p.end, revenue }))
}

async fn daily_revenue(State(s): State<AppState>, Query(p): Query<Period>) -> ApiResult<Vec<DailyRevenue>> {
    s.service.sales().daily_revenue(p).await.map(Json).map_err(reject)
}
