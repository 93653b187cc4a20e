use riph2flow::types::Header;
use riph2flow::utils::{ensure_user_agent, header_value, USER_AGENT};

#[test]
fn test_header_value_is_case_insensitive() {
    let headers = vec![Header::new("Content-Length", "18")];
    assert_eq!(header_value(&headers, "content-length"), Some("18"));
    assert_eq!(header_value(&headers, "content-type"), None);
}

#[test]
fn test_ensure_user_agent_keeps_caller_value() {
    let mut headers = vec![Header::new("User-Agent", "custom/1.0")];
    ensure_user_agent(&mut headers);
    assert_eq!(headers.len(), 1);
    assert_eq!(header_value(&headers, "user-agent"), Some("custom/1.0"));

    let mut empty = Vec::new();
    ensure_user_agent(&mut empty);
    assert_eq!(header_value(&empty, "user-agent"), Some(USER_AGENT));
}
