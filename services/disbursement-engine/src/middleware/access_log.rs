use crate::metrics;
use crate::models::User;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use chrono::Utc;
use futures_util::future::LocalBoxFuture;
use serde_json::json;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Instant;
use tracing::info;

/// One structured record per request on target `access_log`, plus HTTP metrics
pub struct AccessLog;

impl<S, B> Transform<S, ServiceRequest> for AccessLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AccessLogMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLogMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AccessLogMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AccessLogMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started_at = Utc::now();
        let timer = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let service = Rc::clone(&self.service);

        Box::pin(async move {
            let res = service.call(req).await;
            let elapsed = timer.elapsed();

            match &res {
                Ok(response) => {
                    let request = response.request();
                    // Route pattern keeps label cardinality bounded
                    let route = request
                        .match_pattern()
                        .unwrap_or_else(|| "unmatched".to_string());
                    let user_id = request
                        .extensions()
                        .get::<User>()
                        .map(|u| u.id.to_string())
                        .unwrap_or_else(|| "anonymous".to_string());
                    let status = response.status().as_u16();

                    metrics::HTTP_REQUESTS_TOTAL
                        .with_label_values(&[&method, &route, &status.to_string()])
                        .inc();
                    metrics::HTTP_REQUEST_DURATION
                        .with_label_values(&[&method, &route])
                        .observe(elapsed.as_secs_f64());

                    info!(
                        target: "access_log",
                        "{}",
                        json!({
                            "timestamp": started_at.to_rfc3339(),
                            "user_id": user_id,
                            "method": method,
                            "path": path,
                            "status": status,
                            "duration_ms": elapsed.as_millis() as u64,
                        })
                    );
                }
                Err(e) => {
                    info!(
                        target: "access_log",
                        "{}",
                        json!({
                            "timestamp": started_at.to_rfc3339(),
                            "method": method,
                            "path": path,
                            "error": e.to_string(),
                            "duration_ms": elapsed.as_millis() as u64,
                        })
                    );
                }
            }

            res
        })
    }
}
