pub mod attribution;
pub mod budget;
pub mod config;
pub mod error;
pub mod http_client;
pub mod ingest;
pub mod metering;
pub mod model;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod proxy;
pub mod router;
pub mod store;
pub mod stream;
pub mod synth;
pub mod telemetry;
#[cfg(test)]
pub mod test_util;
