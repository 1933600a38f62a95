//! Telemetry primitives shared by the OTLP push path and the proxy path:
//! the OTLP/JSON wire model, attribute flattening, vendor canonicalization
//! and the persisted span/profile shapes.

pub mod flatten;
pub mod keys;
pub mod otlp;
pub mod types;
pub mod vendor;

pub use flatten::flatten_attributes;
pub use keys::*;
pub use otlp::{KeyValue, RawSpan, ResourceGroup, TraceBatch};
pub use types::*;
pub use vendor::{Vendor, VendorCategory, canonicalize_vendor};
