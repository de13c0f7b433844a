pub mod api;
pub mod clock;
pub mod config;
pub mod crm;
pub mod db;
pub mod jobs;
pub mod telemetry;
