use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod leases;
pub mod payments;
pub mod pdcs;
pub mod policies;
pub mod signatures;
pub mod statements;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(leases::router())
        .merge(signatures::router())
        .merge(statements::router())
        .merge(pdcs::router())
        .merge(policies::router())
        .merge(payments::router())
}
