//! Maps Hetzner Cloud HTTP failures onto [`ProviderError`].

use crate::provider::ProviderError;

use super::types::ApiErrorEnvelope;

/// Classifies a non-success API response.
pub(super) fn classify(status: u16, body: &str) -> ProviderError {
    let (code, raw_message) = match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (String::new(), body.trim().to_owned()),
    };
    let message = if raw_message.is_empty() {
        format!("HTTP {status}")
    } else {
        raw_message
    };

    // Hetzner answers 403 for exhausted limits too, so the code wins over the status.
    if code == "resource_limit_exceeded" || message.to_ascii_lowercase().contains("quota") {
        return ProviderError::Quota(message);
    }
    if status == 401
        || (status == 403 && code.is_empty())
        || matches!(code.as_str(), "unauthorized" | "forbidden")
    {
        return ProviderError::Auth(message);
    }
    if status == 429
        || status >= 500
        || matches!(
            code.as_str(),
            "rate_limit_exceeded" | "locked" | "conflict" | "timeout" | "unavailable"
        )
    {
        return ProviderError::Transient(message);
    }
    ProviderError::Rejected(message)
}

/// Wraps transport failures; the request URL is dropped from the message.
pub(super) fn transport(err: reqwest::Error) -> ProviderError {
    ProviderError::Transient(err.without_url().to_string())
}
