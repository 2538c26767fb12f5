//! The application registry and admission decision.
//!
//! A [`Breaker`] owns one router, balancer and timeline per application and is
//! the single entry point for the data plane: [`Breaker::admit`] turns a request
//! line into either a [`Ticket`] naming the backend to call, or an
//! [`AdmissionError`] describing why nothing should be called.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::circuit::{self, CircuitState};
use crate::config::{AppConfig, BreakerConfig};
use crate::domain::backend::SharedBackend;
use crate::domain::routing::{AppRoutes, RouteName, RoutingTable};
use crate::error::{AdmissionError, BalancerError, ConfigError};
use crate::router::{Params, Resolution};
use crate::timeline::{Outcome, Timeline};

/// Probe permits handed out in the current half-open round.
#[derive(Debug, Default)]
struct ProbeGate {
    round: u64,
    issued: u64,
}

/// One registered application.
#[derive(Debug)]
pub struct Application {
    name: String,
    routing: RoutingTable,
    timeline: Timeline,
    probes: Mutex<ProbeGate>,
    /// Last state seen by admission, only used to log transitions.
    last_state: AtomicU8,
}

impl Application {
    fn new(name: &str, config: &BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            routing: RoutingTable::default(),
            timeline: Timeline::new(config.bucket, config.window),
            probes: Mutex::new(ProbeGate::default()),
            last_state: AtomicU8::new(state_code(&CircuitState::Closed)),
        }
    }

    /// The application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The outcome history of the application.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// The current router and balancer.
    pub fn routes(&self) -> Arc<AppRoutes> {
        self.routing.snapshot()
    }

    /// Records the outcome of a forwarded request.
    pub fn record(&self, outcome: Outcome, probe: bool) {
        self.timeline.record(outcome, probe);
    }

    fn evaluate(&self, config: &BreakerConfig) -> CircuitState {
        let state = circuit::evaluate(&self.timeline.snapshot(), self.timeline.now_ms(), config);

        let code = state_code(&state);
        let previous = self.last_state.swap(code, Ordering::AcqRel);
        if previous != code {
            tracing::warn!(app = %self.name, state = state.as_str(), "circuit state changed");
        }
        state
    }

    fn exhausted(&self) -> AdmissionError {
        AdmissionError::Exhausted {
            app: self.name.clone(),
            source: BalancerError::Exhausted,
        }
    }

    /// Hands out a probe permit for `round` if the quota allows it.
    fn try_probe(&self, round: u64, quota: u64) -> bool {
        let mut gate = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.round != round {
            *gate = ProbeGate { round, issued: 0 };
        }
        if gate.issued < quota {
            gate.issued += 1;
            true
        } else {
            false
        }
    }
}

fn state_code(state: &CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open { .. } => 1,
        CircuitState::HalfOpen { .. } => 2,
    }
}

/// Permission to forward one request to one backend.
///
/// The outcome of the call must be reported through [`Ticket::complete`].
#[derive(Debug)]
#[must_use = "the outcome of an admitted request must be recorded"]
pub struct Ticket {
    app: Arc<Application>,
    backend: SharedBackend,
    route: RouteName,
    params: Params,
    probe: bool,
}

impl Ticket {
    /// Name of the admitted application.
    pub fn app(&self) -> &str {
        self.app.name()
    }

    /// The backend selected for the request.
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// The pattern of the matched route.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Path parameters bound by the matched route.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Whether this request is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records the outcome of the forwarded request.
    pub fn complete(self, outcome: Outcome) {
        self.app.record(outcome, self.probe);
    }
}

/// Strips an optional port from a Host header value.
///
/// `api:8080` becomes `api`; bracketed IPv6 literals keep their brackets.
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[..=end];
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Registry of applications and their admission state.
#[derive(Debug, Default)]
pub struct Breaker {
    config: BreakerConfig,
    apps: DashMap<String, Arc<Application>>,
}

impl Breaker {
    /// Creates an empty registry.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            apps: DashMap::new(),
        }
    }

    /// The tuning shared by all applications.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ensures an entry exists for `name`, leaving an existing one untouched.
    pub fn update_app(&self, name: &str) -> Arc<Application> {
        self.apps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Application::new(name, &self.config)))
            .value()
            .clone()
    }

    /// Inserts or replaces an application's routes and backends.
    ///
    /// The timeline of an existing application is kept.
    pub fn register(&self, app: &AppConfig) -> Result<(), ConfigError> {
        let routes = app.build_routes()?;
        self.install(&app.name, routes);
        Ok(())
    }

    /// Validates every document, then registers all of them.
    ///
    /// Nothing is registered if any document is invalid.
    pub fn register_all(&self, apps: &[AppConfig]) -> Result<(), ConfigError> {
        let built = apps
            .iter()
            .map(|app| app.build_routes().map(|routes| (app.name.as_str(), routes)))
            .collect::<Result<Vec<_>, _>>()?;

        for (name, routes) in built {
            self.install(name, routes);
        }
        Ok(())
    }

    fn install(&self, name: &str, routes: AppRoutes) {
        tracing::info!(
            app = name,
            routes = routes.router.len(),
            backends = routes.balancer.backends().len(),
            "registering application"
        );
        self.update_app(name).routing.update(routes);
    }

    /// Looks up an application by name.
    pub fn app(&self, name: &str) -> Option<Arc<Application>> {
        self.apps.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all registered applications, sorted.
    pub fn app_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The circuit state of `name`, if registered.
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.app(name).map(|app| {
            circuit::evaluate(&app.timeline.snapshot(), app.timeline.now_ms(), &self.config)
        })
    }

    /// Decides whether a request may be forwarded, and where to.
    pub fn admit(&self, host: &str, method: &str, path: &str) -> Result<Ticket, AdmissionError> {
        let name = host_without_port(host);
        let app = self
            .app(name)
            .ok_or_else(|| AdmissionError::UnknownHost(name.to_string()))?;
        let routes = app.routes();

        let (route, params) = match routes.router.resolve(method, path) {
            Resolution::Matched { handler, params } => (handler.clone(), params),
            Resolution::NoRoute => {
                return Err(AdmissionError::RouteMiss {
                    path: path.to_string(),
                })
            }
            Resolution::MethodNotAllowed { allowed } => {
                return Err(AdmissionError::MethodMiss {
                    method: method.to_string(),
                    path: path.to_string(),
                    allowed,
                })
            }
        };

        let probe = match app.evaluate(&self.config) {
            CircuitState::Closed => false,
            CircuitState::Open { until_ms } => {
                return Err(AdmissionError::Rejected {
                    app: app.name.clone(),
                    retry_after_ms: until_ms.saturating_sub(app.timeline.now_ms()),
                });
            }
            CircuitState::HalfOpen { round } => {
                if routes.balancer.is_exhausted() {
                    return Err(app.exhausted());
                }
                if !app.try_probe(round, self.config.probe_quota) {
                    return Err(AdmissionError::Rejected {
                        app: app.name.clone(),
                        retry_after_ms: self.config.bucket_ms(),
                    });
                }
                true
            }
        };

        let backend = routes
            .balancer
            .select()
            .map_err(|source| AdmissionError::Exhausted {
                app: app.name.clone(),
                source,
            })?;

        Ok(Ticket {
            app,
            backend,
            route,
            params,
            probe,
        })
    }
}
