//! Request counters per route.
//!
//! Endpoints are keyed by method and route pattern
//! (`POST /api/v1/conversations/{id}/close`), so per-conversation paths share
//! one entry instead of growing the table without bound.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().clone();
        let app_state = req.app_data::<web::Data<AppState>>().cloned();

        if let Some(app_state) = &app_state {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let Some(app_state) = app_state else {
                return result;
            };
            let duration_ms = start_time.elapsed().as_millis() as u64;

            // The route pattern is only known once the router has run
            let (pattern, is_error) = match &result {
                Ok(response) => (
                    response.request().match_pattern(),
                    response.status().is_client_error() || response.status().is_server_error(),
                ),
                Err(_) => (None, true),
            };
            let endpoint = format!("{} {}", method, pattern.as_deref().unwrap_or("unmatched"));

            app_state.record_endpoint_request(&endpoint, duration_ms, is_error);
            if is_error {
                app_state.increment_error_count();
            }

            result
        })
    }
}
