//! Usage reporting primitives for GraphQL execution engines.
//!
//! This crate provides the two pieces of a usage agent that have real
//! algorithmic content:
//!
//! * [`signature`] renders a compiled operation into a normalized, literal-free
//!   string. Structurally identical operations produce identical signatures no
//!   matter how the client ordered fields, arguments or directives, and no
//!   matter which literal argument values it sent, so the signature works as a
//!   low-cardinality aggregation key for telemetry.
//! * [`correlation`] re-attaches per-resolver timing reports, collected out of
//!   order while an engine evaluates a resolver tree, to the query that
//!   produced them. It handles transport-level batching, where several queries
//!   travel in one request and may even share a context token.
//!
//! The execution engine drives the agent through three hooks on a
//! [`RequestState`]: [`RequestState::on_query_start`] once per query,
//! [`RequestState::on_resolver_report`] once per field resolution, and
//! [`RequestState::on_request_end`] exactly once when the whole request is
//! done. The last hook reconciles the buffered reports against the registered
//! queries and emits histogram observations through a [`MetricsSink`].
//!
//! Telemetry must never break a request: every fault in this crate is
//! contained, logged through `tracing`, and surfaces only as missing metrics.

pub mod correlation;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod signature;

pub use crate::correlation::ContextToken;
pub use crate::correlation::FieldInfo;
pub use crate::correlation::OperationRef;
pub use crate::correlation::QueryInfo;
pub use crate::correlation::RequestState;
pub use crate::correlation::ResolverReport;
pub use crate::error::SignatureError;
pub use crate::metrics::MetricsSink;
pub use crate::signature::operation_signature;
