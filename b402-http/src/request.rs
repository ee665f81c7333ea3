//! Mapping HTTP requests onto [`GateRequest`]s.

use b402::receipt::Metadata;
use b402::{GateRequest, TenantId};
use http::{HeaderMap, Request, header};
use serde_json::Value;

use crate::constants::{
    CONSUMER_HEADERS, CONSUMER_QUERY_PARAMS, FORWARDED_FOR_HEADER, MAX_USER_AGENT_CHARS, RECEIPT,
};

/// Builds the gate's view of `req`.
///
/// The tenant comes from a [`TenantId`] request extension, the receipt from
/// `X-402-Receipt`, and the consumer from the `consumer`/`customer` query
/// parameters or the `X-Consumer-ID`/`X-Customer-ID` headers.
pub fn gate_request<B>(req: &Request<B>) -> GateRequest {
    let headers = req.headers();
    let query = query_pairs(req.uri().query());
    let consumer = consumer_from_query(&query).or_else(|| consumer_from_headers(headers));

    let mut request = GateRequest::new(req.method().as_str(), req.uri().path())
        .with_tenant(req.extensions().get::<TenantId>().copied())
        .with_consumer(consumer)
        .with_request_meta(request_meta(headers, &query));
    if let Some(receipt) = header_str(headers, RECEIPT) {
        request = request.with_receipt(receipt);
    }
    request
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn consumer_from_query(query: &[(String, String)]) -> Option<String> {
    CONSUMER_QUERY_PARAMS.iter().find_map(|param| {
        query
            .iter()
            .find(|(key, value)| key == param && !value.trim().is_empty())
            .map(|(_, value)| value.trim().to_owned())
    })
}

fn consumer_from_headers(headers: &HeaderMap) -> Option<String> {
    CONSUMER_HEADERS
        .iter()
        .find_map(|name| header_str(headers, name))
        .map(str::to_owned)
}

/// Client details recorded on the receipt: `ip`, `user_agent`, `host` and
/// the query parameters.
fn request_meta(headers: &HeaderMap, query: &[(String, String)]) -> Metadata {
    let mut meta = Metadata::new();
    if let Some(ip) = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        meta.insert("ip".into(), ip.into());
    }
    if let Some(agent) = header_str(headers, header::USER_AGENT.as_str()) {
        let agent: String = agent.chars().take(MAX_USER_AGENT_CHARS).collect();
        meta.insert("user_agent".into(), agent.into());
    }
    if let Some(host) = header_str(headers, header::HOST.as_str()) {
        meta.insert("host".into(), host.into());
    }
    if !query.is_empty() {
        let params: Metadata = query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        meta.insert("query".into(), Value::Object(params));
    }
    meta
}
