use crate::errors::LedgerError;
use crate::models::AddFundsRequest;
use crate::services::LedgerService;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "ledger-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Add funds endpoint
pub async fn add_funds(
    service: web::Data<Arc<LedgerService>>,
    uid: web::Path<String>,
    http_request: HttpRequest,
    request: web::Json<AddFundsRequest>,
) -> Result<HttpResponse, LedgerError> {
    let mut request = request.into_inner();
    if request.transaction_id.is_none() {
        request.transaction_id = http_request
            .headers()
            .get(IDEMPOTENCY_KEY_HEADER)
            .map(|value| {
                value.to_str().map(str::to_string).map_err(|_| {
                    LedgerError::Validation("Idempotency-Key must be ASCII".to_string())
                })
            })
            .transpose()?;
    }

    // Body and header keys share one length rule
    validator::Validate::validate(&request)
        .map_err(|e| LedgerError::Validation(e.to_string()))?;

    let receipt = service
        .apply_credit(&uid, request.amount, request.transaction_id)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "id": receipt.uid,
        "message": receipt.message,
        "transaction_id": receipt.transaction_id,
        "balance": receipt.balance
    })))
}

/// Get balance endpoint
pub async fn get_balance(
    service: web::Data<Arc<LedgerService>>,
    uid: web::Path<String>,
) -> Result<HttpResponse, LedgerError> {
    let balance = service.get_balance(&uid).await?;

    Ok(HttpResponse::Ok().json(json!({
        "uid": uid.into_inner(),
        "balance": balance
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

/// Transaction history endpoint
pub async fn get_history(
    service: web::Data<Arc<LedgerService>>,
    uid: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, LedgerError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or_else(|| service.default_page_size());

    let history = service.get_history(&uid, page, limit).await?;
    Ok(HttpResponse::Ok().json(history))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1/users/{uid}")
            .route("/add", web::post().to(add_funds))
            .route("/balance", web::get().to(get_balance))
            .route("/history", web::get().to(get_history)),
    )
    .route("/health", web::get().to(health_check));
}
