//! HTTP-specific constants of the x402 gate.

pub use b402::challenge::header::{
    AMOUNT, CALLBACK, CURRENCY, NETWORK, NONCE, PAY_TO, PROTOCOL, RECEIPT,
};

/// CORS header name for exposing custom headers.
pub const ACCESS_CONTROL_EXPOSE_HEADERS: &str = "Access-Control-Expose-Headers";

/// Headers naming the consumer of a credit plan, in lookup order.
pub const CONSUMER_HEADERS: [&str; 2] = ["X-Consumer-ID", "X-Customer-ID"];

/// Query parameters naming the consumer, checked before the headers.
pub const CONSUMER_QUERY_PARAMS: [&str; 2] = ["consumer", "customer"];

/// Proxy header whose first hop is recorded as the client address.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// User agents are cut to this many characters before being recorded.
pub const MAX_USER_AGENT_CHARS: usize = 512;

/// Body detail of every `402` response.
pub const PAYMENT_REQUIRED_DETAIL: &str = "Payment required";
