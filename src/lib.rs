pub mod api;
pub mod config;
pub mod device_client;
pub mod http_client;
pub mod services;
