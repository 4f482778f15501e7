mod detection_service;
mod labels;
mod model_service;
mod ort_service;
mod server;

pub mod config;

pub use server::start_server;
