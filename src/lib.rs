//! Request-scoped span lifecycle coordination for server-side OpenTelemetry
//! instrumentations.
//!
//! Web frameworks that dispatch ordered lifecycle notifications per request
//! (request started, route resolved, response ready, request finished, ...)
//! can drive the [`RequestSpanCoordinator`] from a thin event-subscriber
//! layer and get exactly one correctly parented, correctly terminated span
//! per logical request, including internally dispatched sub-requests such as
//! error-page rendering.
//!
//! The coordinator is a pure reactor over the host's lifecycle: it starts a
//! `SERVER` span for the outermost request (extracting the remote parent
//! from the inbound headers through the configured propagator) and an
//! `INTERNAL` span for nested sub-requests, keeps the span's context active
//! while the request is being handled, records well-known request/response
//! attributes plus a configured set of headers, and resolves status and span
//! end exactly once on every termination path: normal responses, nested
//! sub-requests, and unhandled faults. Span creation, sampling, propagation
//! wire formats, and export remain entirely with the OpenTelemetry API/SDK.
//!
//! # Getting started
//!
//! ```no_run
//! use http::{HeaderMap, Method, StatusCode};
//! use opentelemetry_request_lifecycle::{
//!     RequestId, RequestKind, RequestSpanCoordinator, ServerRequest, ServerResponse,
//! };
//!
//! // One coordinator per process, built against the globally installed
//! // tracer provider and propagator.
//! let coordinator = RequestSpanCoordinator::with_global_tracer()
//!     .with_request_headers(["x-request-id"])
//!     .with_response_headers(["content-type"])
//!     .build();
//!
//! // Driven by the host framework, in lifecycle order:
//! let id = RequestId::new(1);
//! let headers = HeaderMap::new();
//! let request = ServerRequest::new(Method::GET, "/orders", &headers)
//!     .with_host("shop.example.com")
//!     .with_scheme("https");
//! coordinator.on_request_start(id, &request, RequestKind::TopLevel);
//! coordinator.on_route_resolved(id, Some("orders_list"));
//!
//! let response_headers = HeaderMap::new();
//! let response = ServerResponse::new(StatusCode::OK, &response_headers);
//! coordinator.on_response_ready(id, &response);
//! coordinator.on_request_finishing(id);
//! coordinator.on_request_terminate(id);
//! ```
//!
//! # Limitations
//!
//! All notifications for one request must be delivered on the execution
//! context that handled its start notification; the active-context scopes
//! this crate manages are thread-bound, exactly like the underlying
//! [`opentelemetry::Context`] stack. If the host aborts a request without
//! ever delivering a terminal notification, that request's span and scope
//! leak; hosts must deliver `on_request_finishing` (and
//! `on_request_terminate` for top-level requests) on abnormal termination
//! paths too.

mod coordinator;
mod headers;
mod request;

pub use coordinator::{RequestSpanCoordinator, RequestSpanCoordinatorBuilder};
pub use request::{Fault, RequestId, RequestKind, ServerRequest, ServerResponse};
