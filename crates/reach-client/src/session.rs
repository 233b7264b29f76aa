use std::future::Future;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::time::Duration;

use reach_core::error::AppError;
use reach_core::traits::{Session, SessionFactory};
use reqwest::{Client, StatusCode};
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; Reach/0.1; +contact-discovery)";

/// A session that can load a page and hand back its HTML.
pub trait PageSource: Session {
    fn load(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Creates plain HTTP sessions backed by reqwest.
///
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g. when targets are known local test servers).
#[derive(Clone)]
pub struct HttpSessionFactory {
    user_agent: String,
    ssrf_protection: bool,
}

impl HttpSessionFactory {
    pub fn new() -> Self {
        Self {
            user_agent: USER_AGENT.to_string(),
            ssrf_protection: true,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Default for HttpSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn open(&self) -> Result<HttpSession, AppError> {
        let client = Client::builder()
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| AppError::SessionError(format!("HTTP client: {e}")))?;

        Ok(HttpSession {
            client,
            ssrf_protection: self.ssrf_protection,
        })
    }
}

/// One worker's HTTP client. Reuses its connection pool across rows.
pub struct HttpSession {
    client: Client,
    ssrf_protection: bool,
}

impl Session for HttpSession {
    async fn close(self) {}
}

impl PageSource for HttpSession {
    async fn load(&self, url: &str, timeout: Duration) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        response
            .text()
            .await
            .map_err(|e| request_error(e, timeout))
    }
}

/// Map a reqwest failure onto the error taxonomy by its kind, not its text.
fn request_error(e: reqwest::Error, timeout: Duration) -> AppError {
    let e = e.without_url();
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else if e.is_request() || (e.is_body() && interrupted_io(&e)) {
        AppError::NetworkError(format!("Transfer interrupted: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// True if the error was caused by the connection dropping mid-transfer.
fn interrupted_io(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
            );
        }
        source = err.source();
    }
    false
}

/// Server-side trouble is worth another attempt; client errors are not.
fn status_error(status: StatusCode, url: &str) -> AppError {
    let message = format!("HTTP {} for {}", status.as_u16(), url);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AppError::NetworkError(message)
    } else {
        AppError::HttpError(message)
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
pub(crate) async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::InvalidTarget(format!("{url}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidTarget(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidTarget(format!("{url}: no host")))?;

    // IP literals are checked directly; brackets are stripped from IPv6 hosts.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::InvalidTarget(format!(
                "SSRF blocked: {host} is a private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::InvalidTarget(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16 (cloud metadata)
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ipv4() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.169.254".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_status_error_classification() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "https://a.test").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "https://a.test").is_retryable());
        assert!(!status_error(StatusCode::NOT_FOUND, "https://a.test").is_retryable());
    }

    #[test]
    fn test_client_errors_on_network_sounding_hosts_are_permanent() {
        let not_found = status_error(StatusCode::NOT_FOUND, "https://www.networksolutions.com/");
        assert!(matches!(not_found, AppError::HttpError(_)));
        assert!(!not_found.is_retryable());

        let gone = status_error(StatusCode::GONE, "https://dnsimple.com/about");
        assert!(!gone.is_retryable());

        let overloaded = status_error(StatusCode::BAD_GATEWAY, "https://www.networksolutions.com/");
        assert!(overloaded.is_retryable());
    }

    #[tokio::test]
    async fn test_validate_url_rejects_private_ip() {
        let err = validate_url("http://127.0.0.1/admin").await.unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bracketed_ipv6_loopback() {
        let err = validate_url("http://[::1]:8080/").await.unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bad_scheme() {
        let err = validate_url("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_ssrf_blocked_before_any_request() {
        let session = HttpSessionFactory::new().open().await.unwrap();
        let err = session
            .load("http://169.254.169.254/latest/meta-data/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let session = HttpSessionFactory::new()
            .allow_private_urls()
            .open()
            .await
            .unwrap();
        // Port 9 (discard) is closed on practically every host.
        let err = session
            .load("http://127.0.0.1:9/", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
