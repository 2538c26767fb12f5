//! Warden Admin inspection plane
//!
//! Serves read-only views of the breaker registry over HTTP:
//!
//! - `GET /apps` lists registered application names,
//! - `GET /inspect/:app` returns the application's circuit state and the live
//!   timeline buckets, oldest first.

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use warden_core::router::{Params, Resolution, Router};
use warden_core::{Breaker, ConfigError, Counter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminRoute {
    Apps,
    Inspect,
}

#[derive(Debug, Serialize)]
struct Inspection<'a> {
    app: &'a str,
    state: &'static str,
    counters: Vec<Counter>,
}

#[derive(Debug, Serialize)]
struct AppList {
    apps: Vec<String>,
}

/// Handles admin API requests against a shared [`Breaker`].
#[derive(Debug)]
pub struct AdminService {
    breaker: Arc<Breaker>,
    router: Router<AdminRoute>,
}

impl AdminService {
    /// Creates the admin API over `breaker`.
    pub fn new(breaker: Arc<Breaker>) -> Result<Self, ConfigError> {
        let mut router = Router::new();
        router.get("/apps", AdminRoute::Apps)?;
        router.get("/inspect/:app", AdminRoute::Inspect)?;
        Ok(Self { breaker, router })
    }

    /// Answers one admin request. The request body is ignored.
    pub fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        let response = match self.router.resolve(req.method().as_str(), path) {
            Resolution::Matched { handler, params } => match handler {
                AdminRoute::Apps => self.apps(),
                AdminRoute::Inspect => self.inspect(&params),
            },
            Resolution::NoRoute => empty(StatusCode::NOT_FOUND),
            Resolution::MethodNotAllowed { allowed } => {
                let mut response = empty(StatusCode::METHOD_NOT_ALLOWED);
                if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                    response.headers_mut().insert(ALLOW, value);
                }
                response
            }
        };

        tracing::debug!(
            method = %req.method(),
            path,
            status = response.status().as_u16(),
            "admin request"
        );
        response
    }

    fn apps(&self) -> Response<Full<Bytes>> {
        json(&AppList {
            apps: self.breaker.app_names(),
        })
    }

    fn inspect(&self, params: &Params) -> Response<Full<Bytes>> {
        let Some(name) = params.get("app") else {
            return empty(StatusCode::NOT_FOUND);
        };
        let Some(app) = self.breaker.app(name) else {
            return empty(StatusCode::NOT_FOUND);
        };

        let state = self.breaker.state(name).map_or("closed", |s| s.as_str());
        json(&Inspection {
            app: app.name(),
            state,
            counters: app.timeline().snapshot(),
        })
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to encode admin response");
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
