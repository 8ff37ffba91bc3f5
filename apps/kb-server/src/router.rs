use std::mem;

use axum::{
    handler::Handler,
    routing::{get, post},
    Router,
};

use crate::{api, AppState};

/// Prefix under which every route is mounted a second time.
pub(crate) const API_PREFIX: &str = "/kb-api";

pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("GET {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("POST {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) mod paths {
    pub const HEALTH: &str = "/health";
    pub const CONFIG: &str = "/config";
    pub const ACK: &str = "/ack";
    pub const PLAN: &str = "/plan";
    pub const BORROW: &str = "/borrow";
    pub const DIFF: &str = "/diff";
    pub const CR: &str = "/cr";
    pub const EVENTS_ID: &str = "/events/{event_id}";
    pub const MODE_SWITCH: &str = "/mode/switch";
    pub const MODE_STATUS: &str = "/mode/status";
}

/// All routes, served both at the root and under [`API_PREFIX`].
pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut builder = RouterBuilder::new();
    builder
        .route_get(paths::HEALTH, api::health::health)
        .route_get(paths::CONFIG, api::health::config)
        .route_post(paths::ACK, api::phases::ack)
        .route_post(paths::PLAN, api::phases::plan)
        .route_post(paths::BORROW, api::phases::borrow)
        .route_post(paths::DIFF, api::phases::diff)
        .route_post(paths::CR, api::phases::cr)
        .route_get(paths::EVENTS_ID, api::events::get_event)
        .route_post(paths::MODE_SWITCH, api::mode::switch)
        .route_get(paths::MODE_STATUS, api::mode::status);
    let (routes, endpoints) = builder.build();
    let router = Router::new()
        .nest(API_PREFIX, routes.clone())
        .merge(routes);
    (router, endpoints)
}
