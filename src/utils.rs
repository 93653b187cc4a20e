use crate::types::{Header, ProtocolError, Target};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use url::Url;

pub const USER_AGENT: &str = "riph2flow/0.1.0";
pub const CONTENT_LENGTH_HEADER: &str = "content-length";
pub const USER_AGENT_HEADER: &str = "user-agent";

// Common header names as constants to avoid allocations
pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const APPLICATION_RAW: &str = "application/raw";

pub fn ensure_user_agent(headers: &mut Vec<Header>) {
    if !headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case(USER_AGENT_HEADER))
    {
        headers.push(Header::new(USER_AGENT_HEADER, USER_AGENT));
    }
}

/// Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Parses an `http://host:port/` target. Only cleartext HTTP/2 with prior
/// knowledge is spoken, so any other scheme is rejected.
pub fn parse_target(target: &str) -> Result<Target, ProtocolError> {
    let url = Url::parse(target)
        .map_err(|e| ProtocolError::InvalidTarget(format!("{} ({})", target, e)))?;

    if url.scheme() != "http" {
        return Err(ProtocolError::InvalidTarget(format!(
            "Target '{}' must use the http scheme",
            target
        )));
    }

    if url.host_str().is_none() {
        return Err(ProtocolError::InvalidTarget(format!(
            "Target '{}' is missing a host",
            target
        )));
    }

    Ok(Target::new(url))
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| h.value.as_deref())
}

pub async fn timeout_result<F, T>(duration: Option<Duration>, future: F) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    if let Some(dur) = duration {
        match timeout(dur, future).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        }
    } else {
        future.await
    }
}
