use crate::models::RequestOrigin;
use actix_web::{dev::Payload, http::header, FromRequest, HttpRequest};
use std::convert::Infallible;
use std::future::{ready, Ready};

/// Whether forwarding headers come from a trusted reverse proxy
///
/// Registered as app data; absent means untrusted, and the audit IP is the
/// TCP peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyTrust(pub bool);

impl FromRequest for RequestOrigin {
    type Error = Infallible;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let trust = req.app_data::<ProxyTrust>().copied().unwrap_or_default();
        let info = req.connection_info();
        let ip_address = if trust.0 {
            info.realip_remote_addr()
        } else {
            info.peer_addr()
        }
        .map(|addr| addr.to_string());
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        ready(Ok(RequestOrigin {
            ip_address,
            user_agent,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "198.51.100.7:40000".parse().unwrap()
    }

    #[actix_web::test]
    async fn test_forwarded_header_ignored_by_default() {
        let (req, mut payload) = TestRequest::default()
            .peer_addr(peer())
            .insert_header(("X-Forwarded-For", "203.0.113.9"))
            .insert_header((header::USER_AGENT, "Mozilla/5.0"))
            .to_http_parts();

        let origin = RequestOrigin::from_request(&req, &mut payload).await.unwrap();
        assert_eq!(origin.ip_address.as_deref(), Some("198.51.100.7"));
        assert_eq!(origin.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[actix_web::test]
    async fn test_forwarded_header_behind_trusted_proxy() {
        let (req, mut payload) = TestRequest::default()
            .app_data(ProxyTrust(true))
            .peer_addr(peer())
            .insert_header(("X-Forwarded-For", "203.0.113.9"))
            .to_http_parts();

        let origin = RequestOrigin::from_request(&req, &mut payload).await.unwrap();
        assert_eq!(origin.ip_address.as_deref(), Some("203.0.113.9"));
        assert!(origin.user_agent.is_none());
    }
}
