use crate::errors::EngineError;
use crate::identity::IdentityService;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error, HttpMessage,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

/// Resolves `Authorization: Bearer <jwt>` to the current `User` and stores it
/// in request extensions; handlers take it as `web::ReqData<User>`.
pub struct BearerAuth {
    identity: Arc<IdentityService>,
}

impl BearerAuth {
    pub fn new(identity: Arc<IdentityService>) -> Self {
        Self { identity }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = BearerAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BearerAuthMiddleware {
            service: Rc::new(service),
            identity: Arc::clone(&self.identity),
        }))
    }
}

pub struct BearerAuthMiddleware<S> {
    service: Rc<S>,
    identity: Arc<IdentityService>,
}

fn bearer_token(req: &ServiceRequest) -> Result<String, EngineError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| EngineError::Unauthorized("Missing Authorization header".to_string()))?;

    let value = value
        .to_str()
        .map_err(|_| EngineError::Unauthorized("Invalid auth header format".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| EngineError::Unauthorized("Invalid auth header format".to_string()))
}

impl<S, B> Service<ServiceRequest> for BearerAuthMiddleware<S>
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
        let service = Rc::clone(&self.service);
        let identity = Arc::clone(&self.identity);

        Box::pin(async move {
            let token = bearer_token(&req)?;

            let user = match identity.verify_token(&token).await {
                Ok(user) => user,
                Err(err) => {
                    tracing::warn!("Token rejected for {}: {}", req.path(), err);
                    return Err(err.into());
                }
            };

            req.extensions_mut().insert(user);
            service.call(req).await
        })
    }
}
