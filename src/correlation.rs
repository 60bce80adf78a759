//! Correlation of resolver timing reports with the queries that produced them.
//!
//! Execution engines evaluate resolver trees concurrently (in the cooperative,
//! interleaved-callback sense), so per-field timing reports arrive in engine
//! order, not query order, and a single transport request may carry several
//! batched queries. The correlator keeps a per-request table from context
//! token to the queries registered under that token, buffers every report
//! untouched, and matches the two up once, at request end.
use std::fmt;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use apollo_compiler::executable::Operation;
use apollo_compiler::Node;
use indexmap::IndexMap;

use crate::metrics;
use crate::metrics::MetricsSink;

/// Opaque token tying resolver reports back to the query registration they
/// belong to. One token per logical query instance; batching implementations
/// that reuse a token across queries still correlate correctly as long as the
/// operations differ (see [`RequestTelemetry::reconcile`] on collisions).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextToken(u64);

impl ContextToken {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity handle for a compiled operation.
///
/// `Node` is already reference-counted, so the handle holds it directly and
/// two handles compare equal exactly when they share the same node. Structural
/// equality is deliberately not used: reconciliation matches a report to the
/// exact query registration it came from, and two textually identical queries
/// in one batch are still distinct nodes.
#[derive(Clone)]
pub struct OperationRef(Node<Operation>);

impl OperationRef {
    pub fn new(operation: Node<Operation>) -> Self {
        Self(operation)
    }

    pub fn operation(&self) -> &Node<Operation> {
        &self.0
    }
}

impl PartialEq for OperationRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Eq for OperationRef {}

impl fmt::Debug for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("OperationRef")
            .field(&(&*self.0 as *const Operation))
            .finish()
    }
}

/// What the execution engine knows about a query at start time: the compiled
/// operation and the root field name feeding the `query:` metric tag.
#[derive(Clone, Debug)]
pub struct QueryInfo {
    pub operation: OperationRef,
    pub field_name: String,
}

/// The type and field a resolver ran for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub type_name: String,
    pub field_name: String,
}

/// One observation of a single field resolution, accumulated by the engine's
/// timing hooks. Offsets are elapsed time since the start of the request,
/// never absolute timestamps.
#[derive(Clone, Debug)]
pub struct ResolverReport {
    pub operation: Option<OperationRef>,
    pub field: Option<FieldInfo>,
    pub context: ContextToken,
    pub start_offset: Option<Duration>,
    pub end_offset: Option<Duration>,
}

impl ResolverReport {
    // A report missing its operation, field info or either offset can neither
    // be attributed nor measured.
    fn is_complete(&self) -> bool {
        self.operation.is_some()
            && self.field.is_some()
            && self.start_offset.is_some()
            && self.end_offset.is_some()
    }
}

/// Per-query bookkeeping record: the registration info plus the resolver
/// reports reconciliation has attached to it.
#[derive(Debug)]
pub struct QueryDescriptor {
    info: QueryInfo,
    resolvers: Vec<ResolverReport>,
}

impl QueryDescriptor {
    pub fn info(&self) -> &QueryInfo {
        &self.info
    }

    pub fn resolvers(&self) -> &[ResolverReport] {
        &self.resolvers
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Accepting query registrations and resolver reports.
    Open,
    /// The one-shot end-of-request pass is running.
    Reconciling,
    /// Aggregation finished or failed; no further mutation is accepted.
    Closed,
}

/// Per-request correlation arena: the token table, the pending-report buffer
/// and the request-level duration, all request-local. It lives exactly as
/// long as one request and is passed explicitly through the hook interface
/// rather than hung off an ambient request object.
#[derive(Debug)]
pub struct RequestTelemetry {
    phase: Phase,
    // One list per token because a caller may legally reuse a token for more
    // than one query in a batch; insertion order is what reconciliation scans.
    queries: IndexMap<ContextToken, Vec<QueryDescriptor>>,
    pending_reports: Vec<ResolverReport>,
    request_duration: Option<Duration>,
}

impl RequestTelemetry {
    fn new() -> Self {
        Self {
            phase: Phase::Open,
            queries: IndexMap::new(),
            pending_reports: Vec::new(),
            request_duration: None,
        }
    }

    fn register_query_start(&mut self, info: QueryInfo, token: ContextToken) {
        if self.phase != Phase::Open {
            tracing::debug!("query registered after request completion; ignoring");
            return;
        }
        self.queries.entry(token).or_default().push(QueryDescriptor {
            info,
            resolvers: Vec::new(),
        });
    }

    fn record_resolver_report(&mut self, report: ResolverReport) {
        if self.phase != Phase::Open {
            tracing::debug!("resolver report arrived after request completion; ignoring");
            return;
        }
        // No validation here; completeness is checked during reconciliation.
        self.pending_reports.push(report);
    }

    /// Match every buffered report to the first descriptor registered under
    /// its token with the identical operation.
    ///
    /// First match wins and descriptors stay in consideration, so a token
    /// shared by two queries over the same operation instance funnels every
    /// report into the first descriptor; callers that need exact attribution
    /// in that case must keep tokens unique per query. Incomplete reports and
    /// reports matching no descriptor are dropped.
    fn reconcile(&mut self) {
        for report in std::mem::take(&mut self.pending_reports) {
            if !report.is_complete() {
                continue;
            }
            let Some(descriptors) = self.queries.get_mut(&report.context) else {
                continue;
            };
            if let Some(descriptor) = descriptors
                .iter_mut()
                .find(|descriptor| Some(&descriptor.info.operation) == report.operation.as_ref())
            {
                descriptor.resolvers.push(report);
            }
        }
    }

    pub(crate) fn descriptors(&self) -> impl Iterator<Item = &QueryDescriptor> {
        self.queries.values().flatten()
    }

    pub(crate) fn request_duration(&self) -> Option<Duration> {
        self.request_duration
    }
}

/// Ambient per-request state handed to every hook. Requests that are not
/// GraphQL, or that have telemetry disabled, carry no arena; every hook on
/// them is a silent no-op rather than an error.
#[derive(Debug)]
pub struct RequestState {
    telemetry: Option<RequestTelemetry>,
}

impl RequestState {
    /// State for an instrumented request.
    pub fn instrumented() -> Self {
        Self {
            telemetry: Some(RequestTelemetry::new()),
        }
    }

    /// State for a request that bypasses telemetry entirely.
    pub fn passthrough() -> Self {
        Self { telemetry: None }
    }

    /// Record the request-level elapsed time used for the root histogram.
    /// `elapsed` is a delta measured by the host, not a timestamp.
    pub fn set_request_duration(&mut self, elapsed: Duration) {
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.request_duration = Some(elapsed);
        }
    }

    /// Hook: called once per query within a request, and more than once for
    /// batched requests.
    pub fn on_query_start(&mut self, info: QueryInfo, token: ContextToken) {
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.register_query_start(info, token);
        }
    }

    /// Hook: buffer one resolver timing report.
    pub fn on_resolver_report(&mut self, report: ResolverReport) {
        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.record_resolver_report(report);
        }
    }

    /// Hook: called exactly once when the whole request completes.
    ///
    /// Runs reconciliation and metric emission inside a fault boundary:
    /// whatever goes wrong in here is logged and swallowed, because telemetry
    /// must never fail the host request. Afterwards the arena is closed and
    /// all further hooks are ignored.
    pub fn on_request_end(&mut self, sink: &dyn MetricsSink) {
        let Some(telemetry) = self.telemetry.as_mut() else {
            return;
        };
        if telemetry.phase != Phase::Open {
            return;
        }
        telemetry.phase = Phase::Reconciling;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            telemetry.reconcile();
            metrics::emit_request_metrics(telemetry, sink);
        }));
        telemetry.phase = Phase::Closed;

        if let Err(fault) = outcome {
            tracing::error!(
                fault = panic_message(fault.as_ref()),
                "request reconciliation aborted; telemetry for this request is lost"
            );
        }
    }
}

fn panic_message(fault: &(dyn std::any::Any + Send)) -> &str {
    fault
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| fault.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown fault")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use apollo_compiler::ExecutableDocument;
    use apollo_compiler::Schema;
    use test_log::test;

    use super::*;
    use crate::metrics::SinkError;
    use crate::metrics::ROOT_REQUEST_TIME;
    use crate::metrics::TYPE_REQUEST_TIME;

    const SCHEMA: &str = "type Query { a(x: Int, y: String): Int b: Int }";

    fn compile(query: &str) -> ExecutableDocument {
        let schema = Schema::parse_and_validate(SCHEMA, "schema.graphql").unwrap();
        ExecutableDocument::parse(&schema, query, "query.graphql").unwrap()
    }

    fn operation_ref(document: &ExecutableDocument, name: Option<&str>) -> OperationRef {
        OperationRef::new(document.operations.get(name).unwrap().clone())
    }

    fn query_info(operation: &OperationRef, field_name: &str) -> QueryInfo {
        QueryInfo {
            operation: operation.clone(),
            field_name: field_name.to_string(),
        }
    }

    fn report(
        operation: &OperationRef,
        token: ContextToken,
        field_name: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> ResolverReport {
        ResolverReport {
            operation: Some(operation.clone()),
            field: Some(FieldInfo {
                type_name: "Query".to_string(),
                field_name: field_name.to_string(),
            }),
            context: token,
            start_offset: Some(Duration::from_millis(start_ms)),
            end_offset: Some(Duration::from_millis(end_ms)),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        observations: Mutex<Vec<(String, f64, Vec<String>)>>,
    }

    impl RecordingSink {
        fn observations(&self) -> Vec<(String, f64, Vec<String>)> {
            self.observations.lock().unwrap().clone()
        }
    }

    impl MetricsSink for RecordingSink {
        fn histogram(&self, name: &str, value: f64, tags: &[String]) -> Result<(), SinkError> {
            self.observations
                .lock()
                .unwrap()
                .push((name.to_string(), value, tags.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn batched_queries_sharing_a_token_do_not_cross_contaminate() {
        let document = compile("query QueryA { a(x: 1, y: \"v\") } query QueryB { b }");
        let op_a = operation_ref(&document, Some("QueryA"));
        let op_b = operation_ref(&document, Some("QueryB"));
        let token = ContextToken::new();

        let mut state = RequestState::instrumented();
        state.on_query_start(query_info(&op_a, "a"), token);
        state.on_query_start(query_info(&op_b, "b"), token);
        state.on_resolver_report(report(&op_b, token, "b", 1, 6));
        state.on_resolver_report(report(&op_a, token, "a", 2, 12));
        state.set_request_duration(Duration::from_millis(20));

        let sink = RecordingSink::default();
        state.on_request_end(&sink);

        let telemetry = state.telemetry.as_ref().unwrap();
        let descriptors: Vec<_> = telemetry.descriptors().collect();
        assert_eq!(descriptors.len(), 2);

        let by_field = |field: &str| {
            descriptors
                .iter()
                .find(|d| d.info().field_name == field)
                .unwrap()
        };
        let desc_a = by_field("a");
        assert_eq!(desc_a.resolvers().len(), 1);
        assert_eq!(desc_a.resolvers()[0].field.as_ref().unwrap().field_name, "a");
        let desc_b = by_field("b");
        assert_eq!(desc_b.resolvers().len(), 1);
        assert_eq!(desc_b.resolvers()[0].field.as_ref().unwrap().field_name, "b");

        let roots: Vec<_> = sink
            .observations()
            .into_iter()
            .filter(|(name, _, _)| name == ROOT_REQUEST_TIME)
            .collect();
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn incomplete_report_is_dropped_without_blocking_others() {
        let document = compile("{ a b }");
        let operation = operation_ref(&document, None);
        let token = ContextToken::new();

        let mut state = RequestState::instrumented();
        state.on_query_start(query_info(&operation, "a"), token);

        let mut missing_end = report(&operation, token, "a", 1, 2);
        missing_end.end_offset = None;
        state.on_resolver_report(missing_end);
        state.on_resolver_report(report(&operation, token, "b", 3, 8));

        let sink = RecordingSink::default();
        state.on_request_end(&sink);

        let telemetry = state.telemetry.as_ref().unwrap();
        let descriptor = telemetry.descriptors().next().unwrap();
        assert_eq!(descriptor.resolvers().len(), 1);
        assert_eq!(
            descriptor.resolvers()[0].field.as_ref().unwrap().field_name,
            "b"
        );

        let types: Vec<_> = sink
            .observations()
            .into_iter()
            .filter(|(name, _, _)| name == TYPE_REQUEST_TIME)
            .collect();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].1, 5.0);
    }

    #[test]
    fn unmatched_report_is_silently_discarded() {
        let document = compile("{ a }");
        let operation = operation_ref(&document, None);
        let registered = ContextToken::new();
        let unknown = ContextToken::new();

        let mut state = RequestState::instrumented();
        state.on_query_start(query_info(&operation, "a"), registered);
        state.on_resolver_report(report(&operation, unknown, "a", 0, 4));

        let sink = RecordingSink::default();
        state.on_request_end(&sink);

        let telemetry = state.telemetry.as_ref().unwrap();
        assert!(telemetry.descriptors().next().unwrap().resolvers().is_empty());
        // No request duration was set either, so nothing at all is emitted.
        assert!(sink.observations().is_empty());
    }

    #[test]
    fn passthrough_requests_ignore_every_hook() {
        let document = compile("{ a }");
        let operation = operation_ref(&document, None);
        let token = ContextToken::new();

        let mut state = RequestState::passthrough();
        state.on_query_start(query_info(&operation, "a"), token);
        state.on_resolver_report(report(&operation, token, "a", 0, 1));
        state.set_request_duration(Duration::from_millis(5));

        let sink = RecordingSink::default();
        state.on_request_end(&sink);
        assert!(sink.observations().is_empty());
    }

    #[test]
    fn hooks_after_request_end_are_ignored() {
        let document = compile("{ a }");
        let operation = operation_ref(&document, None);
        let token = ContextToken::new();

        let mut state = RequestState::instrumented();
        state.on_query_start(query_info(&operation, "a"), token);
        state.set_request_duration(Duration::from_millis(5));

        let sink = RecordingSink::default();
        state.on_request_end(&sink);
        let emitted = sink.observations().len();
        assert_eq!(emitted, 1);

        state.on_query_start(query_info(&operation, "a"), token);
        state.on_resolver_report(report(&operation, token, "a", 0, 1));
        state.on_request_end(&sink);
        assert_eq!(sink.observations().len(), emitted);
    }

    #[test]
    fn token_reuse_over_one_operation_funnels_into_first_descriptor() {
        let document = compile("{ a }");
        let operation = operation_ref(&document, None);
        let token = ContextToken::new();

        let mut state = RequestState::instrumented();
        state.on_query_start(query_info(&operation, "a"), token);
        state.on_query_start(query_info(&operation, "a"), token);
        state.on_resolver_report(report(&operation, token, "a", 0, 1));
        state.on_resolver_report(report(&operation, token, "a", 2, 3));

        let sink = RecordingSink::default();
        state.on_request_end(&sink);

        let telemetry = state.telemetry.as_ref().unwrap();
        let descriptors: Vec<_> = telemetry.descriptors().collect();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].resolvers().len(), 2);
        assert!(descriptors[1].resolvers().is_empty());
    }

    #[test]
    fn operation_identity_is_per_node_not_structural() {
        // Same node, even through separate handles: equal.
        let document = compile("{ a }");
        let first = operation_ref(&document, None);
        let second = operation_ref(&document, None);
        assert_eq!(first, second);
        assert_eq!(first, first.clone());

        // Structurally identical but separately compiled: distinct.
        let other = operation_ref(&compile("{ a }"), None);
        assert_ne!(first, other);
    }

    #[test]
    fn panicking_sink_never_escapes_request_end() {
        struct PanickingSink;
        impl MetricsSink for PanickingSink {
            fn histogram(&self, _: &str, _: f64, _: &[String]) -> Result<(), SinkError> {
                panic!("sink blew up");
            }
        }

        let document = compile("{ a }");
        let operation = operation_ref(&document, None);
        let token = ContextToken::new();

        let mut state = RequestState::instrumented();
        state.on_query_start(query_info(&operation, "a"), token);
        state.set_request_duration(Duration::from_millis(5));

        // Must not unwind past the hook, and must leave the arena closed.
        state.on_request_end(&PanickingSink);
        let sink = RecordingSink::default();
        state.on_request_end(&sink);
        assert!(sink.observations().is_empty());
    }
}
