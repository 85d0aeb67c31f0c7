pub mod asset_service;
pub mod node;
pub mod nonce_generator;
pub mod serve_mux;

pub use asset_service::register_asset_routes;
pub use node::{NodeOptions, OwtpNode};
pub use nonce_generator::NonceGenerator;
pub use serve_mux::{CallResult, Callback, Context, Handler, ServeMux};
