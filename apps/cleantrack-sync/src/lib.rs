pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod model;
pub mod mqtt;
pub mod osrm;
pub mod popup;
pub mod projector;
pub mod records;
pub mod route;
pub mod session;
pub mod store;
pub mod surface;
pub mod visibility;
