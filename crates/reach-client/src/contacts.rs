//! Email and social-profile extraction from rendered pages.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use reach_core::error::AppError;
use reach_core::models::ContactInfo;
use reach_core::traits::Extractor;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::session::PageSource;
use crate::verify::{EmailVerifier, Unverified, Verdict};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+").expect("valid email regex")
});

static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid anchor selector"));

/// Profile URLs at or above this length are share widgets or tracking links.
const MAX_PROFILE_URL_LEN: usize = 100;

/// Matches of the email pattern that are really asset file names (`logo@2x.png`).
const ASSET_SUFFIXES: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".css", ".js",
];

/// Loads a target page and extracts email addresses and social profiles.
#[derive(Debug, Clone, Default)]
pub struct ContactExtractor<V = Unverified> {
    verifier: V,
}

impl ContactExtractor<Unverified> {
    pub fn new() -> Self {
        Self {
            verifier: Unverified,
        }
    }
}

impl<V: EmailVerifier> ContactExtractor<V> {
    /// Replace the email verifier.
    pub fn with_verifier<W: EmailVerifier>(self, verifier: W) -> ContactExtractor<W> {
        ContactExtractor { verifier }
    }
}

impl<S, V> Extractor<S> for ContactExtractor<V>
where
    S: PageSource,
    V: EmailVerifier,
{
    async fn extract(
        &self,
        session: &S,
        url: &str,
        timeout: Duration,
    ) -> Result<ContactInfo, AppError> {
        let html = session.load(url, timeout).await?;
        let mut contacts = parse_contacts(&html, url);

        let found = contacts.emails.len();
        let mut kept = Vec::with_capacity(found);
        for email in std::mem::take(&mut contacts.emails) {
            if self.verifier.verify(&email).await == Verdict::Valid {
                kept.push(email);
            }
        }
        contacts.emails = kept;

        tracing::debug!(
            %url,
            emails = contacts.emails.len(),
            rejected = found - contacts.emails.len(),
            platforms = contacts.social_links.len(),
            "Contacts extracted"
        );
        Ok(contacts)
    }
}

/// Pull emails and social-profile links out of an HTML document.
///
/// Emails come from `mailto:` links and from pattern matches over the raw
/// source; relative anchors are resolved against `page_url`. Both lists are
/// de-duplicated in first-seen order.
pub fn parse_contacts(html: &str, page_url: &str) -> ContactInfo {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let mut emails = Vec::new();
    let mut social_links: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };

        if let Some(address) = strip_mailto(href) {
            if let Some(m) = EMAIL_RE.find(address) {
                push_email(&mut emails, m.as_str());
            }
            continue;
        }

        let resolved = match &base {
            Some(base) => base.join(href),
            None => Url::parse(href),
        };
        let Ok(link) = resolved else {
            continue;
        };
        if let Some(platform) = classify_social(&link) {
            let links = social_links.entry(platform.to_string()).or_default();
            let link = link.to_string();
            if !links.contains(&link) {
                links.push(link);
            }
        }
    }

    for m in EMAIL_RE.find_iter(html) {
        push_email(&mut emails, m.as_str());
    }

    ContactInfo {
        emails,
        social_links,
    }
}

fn strip_mailto(href: &str) -> Option<&str> {
    let prefix = href.get(..7)?;
    if !prefix.eq_ignore_ascii_case("mailto:") {
        return None;
    }
    href[7..].split('?').next()
}

fn push_email(emails: &mut Vec<String>, raw: &str) {
    let email = raw.trim_end_matches(['.', '-']).to_ascii_lowercase();
    if ASSET_SUFFIXES.iter().any(|s| email.ends_with(s)) {
        return;
    }
    if !emails.contains(&email) {
        emails.push(email);
    }
}

/// Map a link to the social platform whose profile it points at, if any.
///
/// Share, intent and story links are not profiles. LinkedIn links must
/// point at a person (`/in/`) or a company (`/company/`).
pub fn classify_social(link: &Url) -> Option<&'static str> {
    if !matches!(link.scheme(), "http" | "https") || link.as_str().len() >= MAX_PROFILE_URL_LEN {
        return None;
    }
    let host = link.host_str()?.to_ascii_lowercase();
    let path = link.path();
    if path == "/" || path.is_empty() {
        return None;
    }
    let lower = link.as_str().to_ascii_lowercase();
    let shared = lower.contains("share");

    if on_domain(&host, "facebook.com") || on_domain(&host, "fb.com") {
        (!shared).then_some("facebook")
    } else if on_domain(&host, "instagram.com") {
        (!shared && !lower.contains("stories")).then_some("instagram")
    } else if on_domain(&host, "linkedin.com") {
        let profile = path.starts_with("/in/") || path.starts_with("/company/");
        (profile && !shared).then_some("linkedin")
    } else if on_domain(&host, "x.com") || on_domain(&host, "twitter.com") {
        (!shared && !lower.contains("intent")).then_some("x")
    } else {
        None
    }
}

fn on_domain(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::FormatCheck;
    use reach_core::traits::Session;

    const PAGE: &str = r#"
        <html><head><title>Acme Bakery</title></head>
        <body>
          <header><img src="/img/logo@2x.png"></header>
          <p>Write to info@acme.test. Or SALES@Acme.test for orders.</p>
          <a href="mailto:Owner@acme.test?subject=Hello">Mail the owner</a>
          <a href="mailto:info@acme.test">Duplicate</a>
          <a href="https://www.facebook.com/acmebakery">Facebook</a>
          <a href="https://www.facebook.com/sharer/sharer.php?u=acme">Share</a>
          <a href="https://facebook.com/acmebakery">Facebook again</a>
          <a href="https://instagram.com/acme_bakes">Instagram</a>
          <a href="https://instagram.com/stories/acme_bakes">Story</a>
          <a href="https://www.linkedin.com/company/acme-bakery">LinkedIn</a>
          <a href="https://www.linkedin.com/feed/">LinkedIn feed</a>
          <a href="https://www.linkedin.com/sharing/share-offsite/?url=x">LinkedIn share</a>
          <a href="https://twitter.com/acmebakery">Twitter</a>
          <a href="https://twitter.com/intent/tweet?text=hi">Tweet</a>
          <a href="https://x.com/share?url=acme">X share</a>
          <a href="https://notfacebook.com/acme">Lookalike</a>
          <a href="/contact">Contact</a>
          <a href="javascript:void(0)">Menu</a>
        </body></html>
    "#;

    #[test]
    fn test_parse_emails() {
        let contacts = parse_contacts(PAGE, "https://acme.test/");
        assert_eq!(
            contacts.emails,
            vec!["owner@acme.test", "info@acme.test", "sales@acme.test"]
        );
    }

    #[test]
    fn test_parse_social_links() {
        let contacts = parse_contacts(PAGE, "https://acme.test/");
        assert_eq!(
            contacts.links_for("facebook"),
            ["https://www.facebook.com/acmebakery", "https://facebook.com/acmebakery"]
        );
        assert_eq!(contacts.links_for("instagram"), ["https://instagram.com/acme_bakes"]);
        assert_eq!(
            contacts.links_for("linkedin"),
            ["https://www.linkedin.com/company/acme-bakery"]
        );
        assert_eq!(contacts.links_for("x"), ["https://twitter.com/acmebakery"]);
        assert_eq!(contacts.social_links.len(), 4);
    }

    #[test]
    fn test_relative_social_links_resolve_against_page() {
        let html = r#"<a href="/in/jane-doe">Me</a>"#;
        let contacts = parse_contacts(html, "https://www.linkedin.com/company/acme");
        assert_eq!(contacts.links_for("linkedin"), ["https://www.linkedin.com/in/jane-doe"]);
    }

    #[test]
    fn test_long_profile_urls_are_dropped() {
        let long = format!("https://x.com/{}", "a".repeat(100));
        let html = format!(r#"<a href="{long}">X</a>"#);
        assert!(parse_contacts(&html, "https://acme.test/").social_links.is_empty());
    }

    #[test]
    fn test_bare_platform_homepage_is_not_a_profile() {
        let link = Url::parse("https://www.instagram.com/").unwrap();
        assert_eq!(classify_social(&link), None);
    }

    #[test]
    fn test_empty_page_yields_nothing() {
        let contacts = parse_contacts("", "https://acme.test/");
        assert!(contacts.is_empty());
    }

    struct FixedPage(&'static str);

    impl Session for FixedPage {
        async fn close(self) {}
    }

    impl PageSource for FixedPage {
        async fn load(&self, _url: &str, _timeout: Duration) -> Result<String, AppError> {
            Ok(self.0.to_string())
        }
    }

    struct BrokenPage;

    impl Session for BrokenPage {
        async fn close(self) {}
    }

    impl PageSource for BrokenPage {
        async fn load(&self, _url: &str, timeout: Duration) -> Result<String, AppError> {
            Err(AppError::Timeout(timeout.as_secs()))
        }
    }

    #[tokio::test]
    async fn test_extractor_applies_verifier() {
        let page = FixedPage(r#"<p>hello@acme.test, bogus@host.x1</p>"#);
        let url = "https://acme.test/";

        let unverified = ContactExtractor::new()
            .extract(&page, url, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(unverified.emails, vec!["hello@acme.test", "bogus@host.x1"]);

        let checked = ContactExtractor::new()
            .with_verifier(FormatCheck)
            .extract(&page, url, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(checked.emails, vec!["hello@acme.test"]);
    }

    #[tokio::test]
    async fn test_extractor_propagates_load_errors() {
        let err = ContactExtractor::new()
            .extract(&BrokenPage, "https://acme.test/", Duration::from_secs(15))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(15)));
    }
}
