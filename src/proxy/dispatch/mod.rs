pub mod endpoints;
pub mod engine;
pub mod errors;
pub mod project;
pub mod selection;

pub use endpoints::{ApiEndpoint, EndpointTable};
pub use engine::{DispatchEngine, DispatchSummary};
pub use errors::DispatchError;
