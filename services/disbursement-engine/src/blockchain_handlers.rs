//! Read-only views of the settlement chain

use crate::errors::{EngineError, Result};
use crate::models::{is_valid_address, is_valid_transaction_hash, ApiResponse, EventsQuery};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_balance(state: web::Data<AppState>) -> Result<HttpResponse> {
    let balance = state.gateway.get_balance().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "Contract balance retrieved",
        json!({ "balance": balance }),
    )))
}

pub async fn get_account_balance(
    state: web::Data<AppState>,
    address: web::Path<String>,
) -> Result<HttpResponse> {
    let address = address.into_inner();
    if !is_valid_address(&address) {
        return Err(EngineError::Validation(format!("Invalid address: {}", address)));
    }

    let balance = state.gateway.get_account_balance(&address).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "Account balance retrieved",
        json!({ "address": address, "balance": balance }),
    )))
}

pub async fn list_events(
    state: web::Data<AppState>,
    query: web::Query<EventsQuery>,
) -> Result<HttpResponse> {
    let from_block = query.from_block.unwrap_or(0);
    if let Some(to_block) = query.to_block {
        if to_block < from_block {
            return Err(EngineError::Validation(format!(
                "to_block {} is before from_block {}",
                to_block, from_block
            )));
        }
    }

    let batch = state.gateway.list_events(from_block, query.to_block).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Events retrieved", batch)))
}

pub async fn get_transaction_details(
    state: web::Data<AppState>,
    hash: web::Path<String>,
) -> Result<HttpResponse> {
    let hash = hash.into_inner();
    if !is_valid_transaction_hash(&hash) {
        return Err(EngineError::Validation(format!(
            "Invalid transaction hash: {}",
            hash
        )));
    }

    let record = state.gateway.get_details(&hash).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Transaction details retrieved", record)))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/blockchain")
            .route("/balance", web::get().to(get_balance))
            .route("/balance/{address}", web::get().to(get_account_balance))
            .route("/events", web::get().to(list_events))
            .route("/transaction/{hash}", web::get().to(get_transaction_details)),
    );
}
