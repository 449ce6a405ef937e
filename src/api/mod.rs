pub mod handlers;
pub mod routes;

pub use handlers::{CreateOrderRequest, OrderResponse};
pub use routes::{create_router, AppState};
