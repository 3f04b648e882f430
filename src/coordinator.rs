//! Drives the span lifecycle for in-flight server requests.

use std::cell::RefCell;
use std::collections::HashMap;

use http::HeaderMap;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_debug, Context, ContextGuard, KeyValue};
use opentelemetry_http::HeaderExtractor;
use opentelemetry_semantic_conventions::attribute;

use crate::headers::HeaderAttributeMapping;
use crate::request::{Fault, RequestId, RequestKind, ServerRequest, ServerResponse};

thread_local! {
    /// Side-table of in-flight requests, keyed by the host's request id.
    ///
    /// All notifications for one request must arrive on the execution context
    /// that started it; the scope guards stored here rely on the same
    /// thread-local context stack and cannot move threads. Requests handled
    /// on other threads get their own table, so concurrent requests never
    /// contend on shared state.
    static ACTIVE_REQUESTS: RefCell<HashMap<RequestId, RequestState>> =
        RefCell::new(HashMap::new());
}

/// Everything the coordinator tracks for one in-flight request.
struct RequestState {
    /// The context carrying this request's span; span mutations go through
    /// [`TraceContextExt::span`].
    cx: Context,
    /// Guard keeping `cx` active. `take` on detach makes a second detach a
    /// no-op.
    scope: Option<ContextGuard>,
    /// Message of the most recent fault, pending status resolution.
    pending_fault: Option<String>,
    kind: RequestKind,
    /// Set once the span has been ended on any path.
    ended: bool,
}

/// Coordinates one span per logical server request across the host
/// framework's ordered lifecycle notifications.
///
/// The host calls the `on_*` methods in request order:
/// `on_request_start`, optionally `on_route_resolved` /
/// `on_controller_selected` / `on_controller_arguments_resolved` /
/// `on_view_produced` / `on_fault` / `on_response_ready`, then
/// `on_request_finishing` for every request and `on_request_terminate` for
/// the top-level request once the response has been fully sent.
///
/// Each request gets exactly one span, ended exactly once, regardless of how
/// the request terminates. Sub-requests are parented on the currently active
/// context and end at their own finishing notification; top-level spans stay
/// open until terminate so attributes recorded during response transmission
/// still land. Notifications for unknown request ids are no-ops: requests
/// can legitimately bypass the coordinator (rejected before start, or not
/// traced at all).
///
/// One instance is shared per process. Its only state is the configuration
/// captured at construction; per-request state lives with the execution
/// context handling that request. If the host never delivers a terminal
/// notification for a request, that request's span and scope leak.
#[derive(Debug)]
pub struct RequestSpanCoordinator<T> {
    tracer: T,
    headers: HeaderAttributeMapping,
    propagator: Option<Box<dyn TextMapPropagator + Send + Sync>>,
}

impl RequestSpanCoordinator<BoxedTracer> {
    /// Start building a coordinator backed by the globally registered tracer
    /// provider.
    pub fn with_global_tracer() -> RequestSpanCoordinatorBuilder<BoxedTracer> {
        RequestSpanCoordinator::builder(global::tracer(env!("CARGO_PKG_NAME")))
    }
}

impl<T> RequestSpanCoordinator<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    /// Start building a coordinator that creates its spans with `tracer`.
    pub fn builder(tracer: T) -> RequestSpanCoordinatorBuilder<T> {
        RequestSpanCoordinatorBuilder {
            tracer,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            propagator: None,
        }
    }

    /// Handles the start notification: starts and activates this request's
    /// span.
    ///
    /// Top-level requests get a `SERVER` span whose parent is extracted from
    /// the inbound headers and whose start timestamp honors the request's
    /// wall-clock hint; sub-requests get an `INTERNAL` span parented on the
    /// currently active context. Well-known request attributes and the
    /// configured request headers are recorded before the span starts, so
    /// they are visible to samplers.
    pub fn on_request_start(&self, id: RequestId, request: &ServerRequest<'_>, kind: RequestKind) {
        let already_tracked = ACTIVE_REQUESTS.with(|requests| requests.borrow().contains_key(&id));
        if already_tracked {
            otel_debug!(name: "RequestSpanCoordinator.DuplicateStart", request_id = id.into_u64());
            return;
        }

        let parent_cx = match kind {
            RequestKind::TopLevel => self.extract_parent(request.headers),
            RequestKind::SubRequest => Context::current(),
        };

        let mut attributes = request.attributes();
        attributes.extend(self.headers.request_attributes(request.headers));

        let mut builder = self
            .tracer
            .span_builder(format!("HTTP {}", request.method))
            .with_kind(match kind {
                RequestKind::TopLevel => SpanKind::Server,
                RequestKind::SubRequest => SpanKind::Internal,
            })
            .with_attributes(attributes);
        if kind == RequestKind::TopLevel {
            if let Some(start_time) = request.start_time {
                builder = builder.with_start_time(start_time);
            }
        }

        let span = self.tracer.build_with_context(builder, &parent_cx);
        let cx = parent_cx.with_span(span);
        let scope = cx.clone().attach();

        ACTIVE_REQUESTS.with(|requests| {
            requests.borrow_mut().insert(
                id,
                RequestState {
                    cx,
                    scope: Some(scope),
                    pending_fault: None,
                    kind,
                    ended: false,
                },
            );
        });
    }

    /// Handles route resolution: renames the span to the route identifier
    /// and records `http.route`. An absent or empty route leaves the span
    /// name untouched.
    pub fn on_route_resolved(&self, id: RequestId, route: Option<&str>) {
        let Some(route) = route.filter(|route| !route.is_empty()) else {
            return;
        };
        let route = route.to_owned();
        let _ = self.with_state(id, |state| {
            let span = state.cx.span();
            span.update_name(route.clone());
            span.set_attribute(KeyValue::new(attribute::HTTP_ROUTE, route));
        });
    }

    /// Reserved extension point, fired when the host has selected the
    /// handler for the request. Records nothing today.
    pub fn on_controller_selected(&self, id: RequestId) {
        self.touch(id);
    }

    /// Reserved extension point, fired when the host has resolved the
    /// handler's arguments. Records nothing today.
    pub fn on_controller_arguments_resolved(&self, id: RequestId) {
        self.touch(id);
    }

    /// Reserved extension point, fired when the handler produced a view
    /// instead of a response. Records nothing today.
    pub fn on_view_produced(&self, id: RequestId) {
        self.touch(id);
    }

    /// Handles a fault surfaced while the request was being handled: records
    /// it as an `exception` event and keeps its message for status
    /// resolution. The span stays open; lifecycle processing continues.
    pub fn on_fault(&self, id: RequestId, fault: &Fault) {
        let _ = self.with_state(id, |state| {
            state.cx.span().add_event("exception", fault.event_attributes());
            state.pending_fault = Some(fault.message.clone());
        });
    }

    /// Handles the response becoming available: records status code, body
    /// size, and the configured response headers, and resolves the span
    /// status from the status code (`Error` for 5xx, `Ok` otherwise).
    ///
    /// A response supersedes any stashed fault, even one produced by an
    /// error handler; the fault message is kept as the error description
    /// when the response itself is a server error. Does nothing if the span
    /// has already ended.
    pub fn on_response_ready(&self, id: RequestId, response: &ServerResponse<'_>) {
        let _ = self.with_state(id, |state| {
            let fault_message = state.pending_fault.take();
            let span = state.cx.span();
            if !span.is_recording() {
                return;
            }
            span.set_attribute(KeyValue::new(
                attribute::HTTP_RESPONSE_STATUS_CODE,
                i64::from(response.status.as_u16()),
            ));
            if let Some(size) = response.body_size_attribute() {
                span.set_attribute(KeyValue::new(attribute::HTTP_RESPONSE_BODY_SIZE, size));
            }
            if response.status.is_server_error() {
                span.set_status(Status::error(fault_message.unwrap_or_default()));
            } else {
                span.set_status(Status::Ok);
            }
            for attribute in self.headers.response_attributes(response.headers) {
                span.set_attribute(attribute);
            }
        });
    }

    /// Handles the finishing notification, fired for every request once the
    /// host pops it from its handling stack.
    ///
    /// Detaches the scope unconditionally, restoring the parent context.
    /// A request terminating with an unresolved fault gets `Error` status
    /// with the fault message and ends now, trading attribute completeness
    /// for a correct status. Sub-requests end now and are released;
    /// top-level spans are deferred to [`on_request_terminate`].
    ///
    /// Calling this twice for the same request is a no-op the second time.
    ///
    /// [`on_request_terminate`]: RequestSpanCoordinator::on_request_terminate
    pub fn on_request_finishing(&self, id: RequestId) {
        ACTIVE_REQUESTS.with(|requests| {
            let mut requests = requests.borrow_mut();
            let Some(state) = requests.get_mut(&id) else {
                otel_debug!(name: "RequestSpanCoordinator.UntrackedRequest", request_id = id.into_u64());
                return;
            };

            drop(state.scope.take());

            let kind = state.kind;
            if let Some(message) = state.pending_fault.take() {
                let span = state.cx.span();
                span.set_status(Status::error(message));
                if !state.ended {
                    span.end();
                    state.ended = true;
                }
            } else if kind == RequestKind::SubRequest && !state.ended {
                state.cx.span().end();
                state.ended = true;
            }

            // Finishing is the terminal notification for sub-requests.
            if kind == RequestKind::SubRequest {
                requests.remove(&id);
            }
        });
    }

    /// Handles the terminate notification, fired once for the top-level
    /// request after the response has been fully transmitted: ends the span
    /// unless a fault already ended it, and releases the request's state.
    pub fn on_request_terminate(&self, id: RequestId) {
        ACTIVE_REQUESTS.with(|requests| {
            let Some(mut state) = requests.borrow_mut().remove(&id) else {
                otel_debug!(name: "RequestSpanCoordinator.UntrackedRequest", request_id = id.into_u64());
                return;
            };

            // Normally detached at finishing; taken again here so terminate
            // stays safe for hosts that skip the finishing notification.
            drop(state.scope.take());

            if !state.ended {
                state.cx.span().end();
            }
        });
    }

    fn extract_parent(&self, headers: &HeaderMap) -> Context {
        let extractor = HeaderExtractor(headers);
        match &self.propagator {
            Some(propagator) => propagator.extract(&extractor),
            None => global::get_text_map_propagator(|propagator| propagator.extract(&extractor)),
        }
    }

    fn touch(&self, id: RequestId) {
        let _ = self.with_state(id, |_state| {});
    }

    fn with_state<R>(&self, id: RequestId, f: impl FnOnce(&mut RequestState) -> R) -> Option<R> {
        let result = ACTIVE_REQUESTS.with(|requests| requests.borrow_mut().get_mut(&id).map(f));
        if result.is_none() {
            otel_debug!(name: "RequestSpanCoordinator.UntrackedRequest", request_id = id.into_u64());
        }
        result
    }
}

/// Configures and builds a [`RequestSpanCoordinator`].
#[derive(Debug)]
pub struct RequestSpanCoordinatorBuilder<T> {
    tracer: T,
    request_headers: Vec<String>,
    response_headers: Vec<String>,
    propagator: Option<Box<dyn TextMapPropagator + Send + Sync>>,
}

impl<T> RequestSpanCoordinatorBuilder<T> {
    /// Request headers to copy into `http.request.header.*` attributes at
    /// span start.
    pub fn with_request_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.request_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Response headers to copy into `http.response.header.*` attributes
    /// when the response is ready.
    pub fn with_response_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.response_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Propagator used to extract the parent trace context from inbound
    /// request headers. Defaults to the globally registered propagator.
    pub fn with_propagator(
        mut self,
        propagator: impl TextMapPropagator + Send + Sync + 'static,
    ) -> Self {
        self.propagator = Some(Box::new(propagator));
        self
    }

    /// Builds the coordinator, freezing the header mapping.
    pub fn build(self) -> RequestSpanCoordinator<T> {
        RequestSpanCoordinator {
            tracer: self.tracer,
            headers: HeaderAttributeMapping::new(self.request_headers, self.response_headers),
            propagator: self.propagator,
        }
    }
}
