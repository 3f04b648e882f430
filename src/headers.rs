//! Header-to-attribute capture configuration.

use http::HeaderMap;
use opentelemetry::{Array, Key, KeyValue, StringValue, Value};

/// Immutable mapping from configured header names to span attribute keys.
///
/// Built once when the coordinator is constructed and read-only afterwards.
/// Attribute keys are derived as
/// `http.<request|response>.header.<lowercased-header-with-dashes-as-underscores>`.
#[derive(Debug, Default)]
pub(crate) struct HeaderAttributeMapping {
    request: Vec<(String, Key)>,
    response: Vec<(String, Key)>,
}

impl HeaderAttributeMapping {
    pub(crate) fn new<I, O>(request_headers: I, response_headers: O) -> Self
    where
        I: IntoIterator<Item = String>,
        O: IntoIterator<Item = String>,
    {
        HeaderAttributeMapping {
            request: build_mapping("request", request_headers),
            response: build_mapping("response", response_headers),
        }
    }

    /// Attributes for the configured request headers present in `headers`.
    pub(crate) fn request_attributes(&self, headers: &HeaderMap) -> Vec<KeyValue> {
        capture(&self.request, headers)
    }

    /// Attributes for the configured response headers present in `headers`.
    pub(crate) fn response_attributes(&self, headers: &HeaderMap) -> Vec<KeyValue> {
        capture(&self.response, headers)
    }
}

fn build_mapping<I>(direction: &str, names: I) -> Vec<(String, Key)>
where
    I: IntoIterator<Item = String>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.to_ascii_lowercase();
            let key = Key::new(format!(
                "http.{direction}.header.{}",
                name.replace('-', "_")
            ));
            (name, key)
        })
        .collect()
}

/// Copies all values of each configured header into a string-array attribute.
/// Headers that are absent, or whose values are not valid ASCII, are skipped
/// entirely rather than recorded as empty.
fn capture(mapping: &[(String, Key)], headers: &HeaderMap) -> Vec<KeyValue> {
    let mut attributes = Vec::new();
    for (name, key) in mapping {
        let values: Vec<StringValue> = headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(|value| StringValue::from(value.to_owned()))
            .collect();
        if !values.is_empty() {
            attributes.push(KeyValue::new(
                key.clone(),
                Value::Array(Array::String(values)),
            ));
        }
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn mapping(request: &[&str], response: &[&str]) -> HeaderAttributeMapping {
        HeaderAttributeMapping::new(
            request.iter().map(|name| (*name).to_owned()),
            response.iter().map(|name| (*name).to_owned()),
        )
    }

    #[test]
    fn derives_attribute_key_from_header_name() {
        let mapping = mapping(&["X-Request-Id"], &["Content-Type"]);

        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc-123"));
        let attributes = mapping.request_attributes(&headers);
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].key.as_str(), "http.request.header.x_request_id");

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let attributes = mapping.response_attributes(&headers);
        assert_eq!(attributes.len(), 1);
        assert_eq!(
            attributes[0].key.as_str(),
            "http.response.header.content_type"
        );
        assert_eq!(
            attributes[0].value,
            Value::Array(Array::String(vec![StringValue::from(
                "application/json".to_owned()
            )])),
        );
    }

    #[test]
    fn copies_all_values_of_a_multi_valued_header() {
        let mapping = mapping(&[], &["Set-Cookie"]);

        let mut headers = HeaderMap::new();
        headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("a=1"),
        );
        headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("b=2"),
        );

        let attributes = mapping.response_attributes(&headers);
        assert_eq!(attributes.len(), 1);
        assert_eq!(
            attributes[0].value,
            Value::Array(Array::String(vec![
                StringValue::from("a=1".to_owned()),
                StringValue::from("b=2".to_owned()),
            ])),
        );
    }

    #[test]
    fn unconfigured_headers_are_never_copied() {
        let mapping = mapping(&[], &["content-type"]);

        let mut headers = HeaderMap::new();
        headers.insert("x-powered-by", HeaderValue::from_static("coffee"));

        assert!(mapping.response_attributes(&headers).is_empty());
    }

    #[test]
    fn absent_headers_produce_no_attribute() {
        let mapping = mapping(&["accept"], &["content-type"]);
        let headers = HeaderMap::new();

        assert!(mapping.request_attributes(&headers).is_empty());
        assert!(mapping.response_attributes(&headers).is_empty());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mapping = mapping(&["ACCEPT"], &[]);

        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));

        let attributes = mapping.request_attributes(&headers);
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].key.as_str(), "http.request.header.accept");
    }
}
