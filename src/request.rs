//! Framework-neutral views of the request lifecycle payloads.
//!
//! Host integrations translate their own request/response/error objects into
//! these types before handing them to the
//! [`RequestSpanCoordinator`](crate::RequestSpanCoordinator). Everything is a
//! borrow of data the host already owns; the coordinator copies what it needs
//! into span attributes and never retains a payload.

use std::borrow::Cow;
use std::net::IpAddr;
use std::time::SystemTime;

use http::{header, HeaderMap, Method, StatusCode, Version};
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute;

/// Stable identity of one logical request, assigned by the host.
///
/// The coordinator keys all per-request state by this value, so the host must
/// hand the same id to every lifecycle notification of a given request and
/// must not reuse an id while that request is still in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Create a request id from the host's stable request handle.
    pub fn new(id: u64) -> Self {
        RequestId(id)
    }

    /// Returns the underlying id value.
    pub fn into_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId(id)
    }
}

/// Whether a request entered the process from the outside or was dispatched
/// internally while another request was already being handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// The outermost request of its execution context. Gets a `SERVER` span
    /// whose parent is extracted from the inbound headers.
    TopLevel,
    /// An internally dispatched request nested inside a top-level one (error
    /// page rendering, forwards, ...). Gets an `INTERNAL` span parented on
    /// the currently active context.
    SubRequest,
}

/// The request-side payload of the start notification.
///
/// Only method, path, and headers are mandatory; everything else is attached
/// with the `with_*` methods as far as the host can supply it. Absent fields
/// simply produce no span attribute.
#[derive(Debug)]
pub struct ServerRequest<'a> {
    /// Request method.
    pub method: Method,
    /// Request path as received, e.g. `/orders/42`.
    pub path: &'a str,
    /// Inbound headers, also used as the trace-context extraction carrier.
    pub headers: &'a HeaderMap,
    /// Virtual host serving the request.
    pub host: Option<&'a str>,
    /// URI scheme, e.g. `https`.
    pub scheme: Option<&'a str>,
    /// HTTP protocol version.
    pub version: Option<Version>,
    /// Network address of the caller.
    pub client_address: Option<IpAddr>,
    /// Network port of the caller.
    pub client_port: Option<u16>,
    /// Server-side socket address the request arrived on.
    pub local_address: Option<IpAddr>,
    /// Server-side socket port the request arrived on.
    pub local_port: Option<u16>,
    /// Wall-clock hint for when the request actually started, for hosts that
    /// observe requests later than the listener accepted them.
    pub start_time: Option<SystemTime>,
}

impl<'a> ServerRequest<'a> {
    /// Create a request payload from the mandatory fields.
    pub fn new(method: Method, path: &'a str, headers: &'a HeaderMap) -> Self {
        ServerRequest {
            method,
            path,
            headers,
            host: None,
            scheme: None,
            version: None,
            client_address: None,
            client_port: None,
            local_address: None,
            local_port: None,
            start_time: None,
        }
    }

    /// Attach the virtual host.
    pub fn with_host(mut self, host: &'a str) -> Self {
        self.host = Some(host);
        self
    }

    /// Attach the URI scheme.
    pub fn with_scheme(mut self, scheme: &'a str) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Attach the HTTP protocol version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Attach the caller's network address and port.
    pub fn with_client(mut self, address: IpAddr, port: u16) -> Self {
        self.client_address = Some(address);
        self.client_port = Some(port);
        self
    }

    /// Attach the server-side socket address and port.
    pub fn with_local(mut self, address: IpAddr, port: u16) -> Self {
        self.local_address = Some(address);
        self.local_port = Some(port);
        self
    }

    /// Attach a wall-clock hint for the span start timestamp.
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Well-known request attributes recorded at span start.
    pub(crate) fn attributes(&self) -> Vec<KeyValue> {
        let mut attributes = Vec::with_capacity(11);
        attributes.push(KeyValue::new(
            attribute::HTTP_REQUEST_METHOD,
            self.method.as_str().to_owned(),
        ));
        attributes.push(KeyValue::new(attribute::URL_PATH, self.path.to_owned()));
        if let Some(host) = self.host {
            attributes.push(KeyValue::new(attribute::SERVER_ADDRESS, host.to_owned()));
        }
        if let Some(scheme) = self.scheme {
            attributes.push(KeyValue::new(attribute::URL_SCHEME, scheme.to_owned()));
        }
        if let Some(version) = self.version.and_then(protocol_version) {
            attributes.push(KeyValue::new(attribute::NETWORK_PROTOCOL_VERSION, version));
        }
        if let Some(user_agent) = header_str(self.headers, header::USER_AGENT) {
            attributes.push(KeyValue::new(
                attribute::USER_AGENT_ORIGINAL,
                user_agent.to_owned(),
            ));
        }
        if let Some(size) = content_length(self.headers) {
            attributes.push(KeyValue::new(attribute::HTTP_REQUEST_BODY_SIZE, size));
        }
        if let Some(address) = self.client_address {
            attributes.push(KeyValue::new(
                attribute::CLIENT_ADDRESS,
                address.to_string(),
            ));
        }
        if let Some(port) = self.client_port {
            attributes.push(KeyValue::new(attribute::CLIENT_PORT, i64::from(port)));
        }
        if let Some(address) = self.local_address {
            attributes.push(KeyValue::new(
                attribute::NETWORK_LOCAL_ADDRESS,
                address.to_string(),
            ));
        }
        if let Some(port) = self.local_port {
            attributes.push(KeyValue::new(attribute::NETWORK_LOCAL_PORT, i64::from(port)));
        }
        attributes
    }
}

/// The response-side payload of the response-ready notification.
#[derive(Debug)]
pub struct ServerResponse<'a> {
    /// Response status code.
    pub status: StatusCode,
    /// Outbound headers.
    pub headers: &'a HeaderMap,
    /// Response body size, when the host knows it ahead of the
    /// `Content-Length` header (streamed or mutated responses).
    pub body_size: Option<u64>,
}

impl<'a> ServerResponse<'a> {
    /// Create a response payload.
    pub fn new(status: StatusCode, headers: &'a HeaderMap) -> Self {
        ServerResponse {
            status,
            headers,
            body_size: None,
        }
    }

    /// Attach an explicit body size, overriding the `Content-Length` header.
    pub fn with_body_size(mut self, body_size: u64) -> Self {
        self.body_size = Some(body_size);
        self
    }

    pub(crate) fn body_size_attribute(&self) -> Option<i64> {
        match self.body_size {
            Some(size) => i64::try_from(size).ok(),
            None => content_length(self.headers),
        }
    }
}

/// A fault surfaced by the host while it was handling a request.
///
/// Recorded on the span as an `exception` event; the message additionally
/// feeds status resolution when the request terminates without a response.
#[derive(Clone, Debug)]
pub struct Fault {
    /// Type of the fault, e.g. the exception class or error type name.
    pub kind: Cow<'static, str>,
    /// Human-readable fault message.
    pub message: String,
    /// Stacktrace rendered by the host, if it has one.
    pub stacktrace: Option<String>,
}

impl Fault {
    /// Create a fault from a type name and message.
    pub fn new(kind: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Fault {
            kind: kind.into(),
            message: message.into(),
            stacktrace: None,
        }
    }

    /// Create a fault from any error value, using its type name as the kind.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Fault::new(std::any::type_name::<E>(), err.to_string())
    }

    /// Attach a rendered stacktrace.
    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    pub(crate) fn event_attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(attribute::EXCEPTION_TYPE, self.kind.to_string()),
            KeyValue::new(attribute::EXCEPTION_MESSAGE, self.message.clone()),
        ];
        if let Some(stacktrace) = &self.stacktrace {
            attributes.push(KeyValue::new(
                attribute::EXCEPTION_STACKTRACE,
                stacktrace.clone(),
            ));
        }
        attributes
    }
}

/// Numeric protocol version with the transport prefix stripped, per the
/// `network.protocol.version` conventions.
fn protocol_version(version: Version) -> Option<&'static str> {
    if version == Version::HTTP_09 {
        Some("0.9")
    } else if version == Version::HTTP_10 {
        Some("1.0")
    } else if version == Version::HTTP_11 {
        Some("1.1")
    } else if version == Version::HTTP_2 {
        Some("2")
    } else if version == Version::HTTP_3 {
        Some("3")
    } else {
        None
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    header_str(headers, header::CONTENT_LENGTH).and_then(|value| value.parse().ok())
}
