use riph2flow::types::ProtocolError;
use riph2flow::utils::parse_target;

#[test]
fn parse_target_with_default_port() {
    let http = parse_target("http://example.com/path?q=1").expect("valid http");
    assert_eq!(http.scheme(), "http");
    assert_eq!(http.port().unwrap(), 80);
    assert_eq!(http.authority().unwrap(), "example.com");
}

#[test]
fn parse_target_explicit_port() {
    let target = parse_target("http://localhost:8080/foo").expect("valid");
    assert_eq!(target.port().unwrap(), 8080);
    assert_eq!(target.authority().unwrap(), "localhost:8080");
}

#[test]
fn parse_target_invalid_inputs() {
    let err = parse_target("not a url").unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidTarget(_)));

    let missing_host = parse_target("http://:8080").unwrap_err();
    assert!(matches!(missing_host, ProtocolError::InvalidTarget(_)));
}

#[test]
fn parse_target_rejects_tls_schemes() {
    let err = parse_target("https://example.com").unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidTarget(_)));
}
