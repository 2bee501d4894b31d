use crate::audit::actions;
use crate::blockchain_handlers;
use crate::errors::{EngineError, Result};
use crate::metrics;
use crate::middleware::BearerAuth;
use crate::models::{
    AdminUserUpdate, ApiResponse, AuditQuery, ChangePasswordRequest, CreateFundRequest,
    DashboardStats, LoginRequest, ProfileUpdate, ReconcileTransactionRequest, RegisterRequest,
    RequestOrigin, SubmitTransactionRequest, TransactionQuery, UpdateFundRequest, User,
};
use crate::state::AppState;
use actix_web::{error, web, HttpRequest, HttpResponse};
use ledger_core::{NewFund, TransactionFilter, TransactionStatus};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

/// Health check endpoint; a disconnected chain degrades but does not fail it
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let connected = state.gateway.is_connected().await;
    if !connected {
        warn!("Health check: settlement chain unreachable");
    }

    HttpResponse::Ok().json(json!({
        "status": if connected { "healthy" } else { "degraded" },
        "service": "disbursement-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "blockchain": { "connected": connected }
    }))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "success": false,
            "message": format!("Failed to gather metrics: {}", e)
        })),
    }
}

// ===== Accounts =====

pub async fn register(
    state: web::Data<AppState>,
    request: web::Json<RegisterRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    let user = state.identity.register(request.into_inner(), &origin).await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("User registered successfully", user)))
}

pub async fn login(
    state: web::Data<AppState>,
    request: web::Json<LoginRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    let login = state.identity.authenticate(request.into_inner(), &origin).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Login successful", login)))
}

pub async fn get_profile(user: web::ReqData<User>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Profile retrieved", user.into_inner())))
}

pub async fn update_profile(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    request: web::Json<ProfileUpdate>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    let updated = state
        .identity
        .update_profile(&user, request.into_inner(), &origin)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Profile updated", updated)))
}

pub async fn change_password(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    request: web::Json<ChangePasswordRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    state
        .identity
        .change_password(&user, request.into_inner(), &origin)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::message("Password changed")))
}

pub async fn update_user(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    user_id: web::Path<Uuid>,
    request: web::Json<AdminUserUpdate>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    let updated = state
        .identity
        .admin_update(&user, user_id.into_inner(), request.into_inner(), &origin)
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("User updated", updated)))
}

// ===== Funds =====

pub async fn list_funds(state: web::Data<AppState>) -> Result<HttpResponse> {
    let funds = state.ledger.list_funds().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Funds retrieved", funds)))
}

pub async fn create_fund(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    request: web::Json<CreateFundRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    user.require_admin()?;
    let request = request.into_inner();
    request.validate()?;

    let fund = state
        .ledger
        .create_fund(NewFund {
            name: request.name.trim().to_string(),
            description: request.description,
            total_amount: request.total_amount,
            created_by: user.id,
        })
        .await?;

    state
        .audit
        .record(
            Some(user.id),
            actions::FUND_CREATED,
            format!("Fund {} '{}' created with {}", fund.id, fund.name, fund.total_amount),
            &origin,
        )
        .await;

    Ok(HttpResponse::Created().json(ApiResponse::ok("Fund created", fund)))
}

pub async fn get_fund(
    state: web::Data<AppState>,
    fund_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let fund = state.ledger.get_fund(fund_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Fund retrieved", fund)))
}

pub async fn update_fund(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    fund_id: web::Path<Uuid>,
    request: web::Json<UpdateFundRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    user.require_admin()?;
    let request = request.into_inner();
    request.validate()?;

    let fund = state
        .ledger
        .update_fund(fund_id.into_inner(), request.into())
        .await?;

    state
        .audit
        .record(
            Some(user.id),
            actions::FUND_UPDATED,
            format!("Fund {} is now '{}' ({})", fund.id, fund.name, fund.status),
            &origin,
        )
        .await;

    Ok(HttpResponse::Ok().json(ApiResponse::ok("Fund updated", fund)))
}

// ===== Transactions =====

pub async fn list_transactions(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    query: web::Query<TransactionQuery>,
) -> Result<HttpResponse> {
    let query = query.into_inner();
    let filter = TransactionFilter {
        // Plain users only ever see their own
        user_id: if user.can_read_all() { None } else { Some(user.id) },
        fund_id: query.fund_id,
        status: query.status,
        limit: query.limit.map(|l| l.clamp(1, 500)),
    };

    let transactions = state.ledger.list_transactions(filter).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Transactions retrieved", transactions)))
}

pub async fn submit_transaction(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    request: web::Json<SubmitTransactionRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    request.validate()?;

    let tx = state.orchestrator.submit(request, &user, origin).await?;

    let completed = tx.status == TransactionStatus::Completed;
    let message = match &tx.failure_reason {
        Some(reason) if !completed => format!("Transaction failed: {}", reason),
        _ => "Transaction completed".to_string(),
    };
    Ok(HttpResponse::Created().json(ApiResponse::with_outcome(completed, message, tx)))
}

pub async fn get_transaction(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    transaction_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let tx = state.ledger.get_transaction(transaction_id.into_inner()).await?;
    if tx.user_id != user.id && !user.can_read_all() {
        return Err(EngineError::Forbidden(
            "Transaction belongs to another user".to_string(),
        ));
    }
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Transaction retrieved", tx)))
}

pub async fn reconcile_transaction(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    transaction_id: web::Path<Uuid>,
    request: web::Json<ReconcileTransactionRequest>,
    origin: RequestOrigin,
) -> Result<HttpResponse> {
    user.require_admin()?;
    let request = request.into_inner();
    request.validate()?;

    let tx = state
        .orchestrator
        .reconcile(
            transaction_id.into_inner(),
            request.into_resolution()?,
            &user,
            origin,
        )
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Transaction reconciled", tx)))
}

// ===== Reporting =====

pub async fn dashboard_stats(state: web::Data<AppState>) -> Result<HttpResponse> {
    let stats = state.ledger.stats().await?;

    let balance = match state.gateway.get_balance().await {
        Ok(balance) => Some(balance),
        Err(e) => {
            warn!("Chain balance unavailable for dashboard: {}", e);
            None
        }
    };

    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "Dashboard stats retrieved",
        DashboardStats::new(stats, balance),
    )))
}

pub async fn audit_logs(
    state: web::Data<AppState>,
    user: web::ReqData<User>,
    query: web::Query<AuditQuery>,
) -> Result<HttpResponse> {
    user.require_read_all()?;
    let entries = state.audit.list(query.user_id, query.limit).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Audit logs retrieved", entries)))
}

/// Malformed JSON bodies answer with the standard error envelope
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(64 * 1024)
        .error_handler(|err: error::JsonPayloadError, _req: &HttpRequest| {
            EngineError::Validation(err.to_string()).into()
        })
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err: error::QueryPayloadError, _req: &HttpRequest| {
        EngineError::Validation(err.to_string()).into()
    })
}

pub fn path_config() -> web::PathConfig {
    web::PathConfig::default().error_handler(|err: error::PathError, _req: &HttpRequest| {
        EngineError::Validation(err.to_string()).into()
    })
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig, state: &AppState) {
    cfg.app_data(web::Data::new(state.clone()))
        .app_data(json_config())
        .app_data(query_config())
        .app_data(path_config())
        .route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(metrics_endpoint))
        .service(
            web::scope("/api")
                .route("/register", web::post().to(register))
                .route("/login", web::post().to(login))
                .service(
                    web::scope("")
                        .wrap(BearerAuth::new(state.identity.clone()))
                        .route("/profile", web::get().to(get_profile))
                        .route("/profile", web::put().to(update_profile))
                        .route("/profile/password", web::post().to(change_password))
                        .route("/users/{id}", web::patch().to(update_user))
                        .route("/funds", web::get().to(list_funds))
                        .route("/funds", web::post().to(create_fund))
                        .route("/funds/{id}", web::get().to(get_fund))
                        .route("/funds/{id}", web::patch().to(update_fund))
                        .route("/transactions", web::get().to(list_transactions))
                        .route("/transactions", web::post().to(submit_transaction))
                        .route("/transactions/{id}", web::get().to(get_transaction))
                        .route(
                            "/transactions/{id}/reconcile",
                            web::post().to(reconcile_transaction),
                        )
                        .route("/dashboard/stats", web::get().to(dashboard_stats))
                        .route("/audit/logs", web::get().to(audit_logs))
                        .configure(blockchain_handlers::configure_routes),
                ),
        );
}
