pub mod analytics;
pub mod app_state;
pub mod configuration;
pub mod domain;
pub mod email_client;
pub mod ingest;
pub mod orchestrator;
pub mod personalize;
pub mod request_id;
pub mod routes;
pub mod scheduler_worker;
pub mod startup;
pub mod store;
pub mod telemetry;
pub mod tracking_links;
pub mod utils;
