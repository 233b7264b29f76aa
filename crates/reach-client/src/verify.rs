//! Email verification strategies applied to extracted addresses.

use std::future::Future;

/// Verification outcome for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Plausible but unconfirmed (e.g. the domain did not resolve).
    Doubtful,
    Invalid,
}

/// Decides whether an extracted email address is kept.
pub trait EmailVerifier: Send + Sync + Clone + 'static {
    fn verify(&self, email: &str) -> impl Future<Output = Verdict> + Send;
}

/// Accepts every address without checking it.
///
/// This is the default mode: the extractor's pattern is the only filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unverified;

impl EmailVerifier for Unverified {
    async fn verify(&self, _email: &str) -> Verdict {
        Verdict::Valid
    }
}

/// Structural check: one `@`, a non-empty local part, a dotted domain with
/// sane labels and an alphabetic top-level domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatCheck;

impl EmailVerifier for FormatCheck {
    async fn verify(&self, email: &str) -> Verdict {
        if is_well_formed(email) {
            Verdict::Valid
        } else {
            Verdict::Invalid
        }
    }
}

/// [`FormatCheck`] plus a DNS lookup of the domain.
///
/// Addresses whose domain does not resolve are reported as doubtful.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainCheck;

impl EmailVerifier for DomainCheck {
    async fn verify(&self, email: &str) -> Verdict {
        if !is_well_formed(email) {
            return Verdict::Invalid;
        }
        let Some((_, domain)) = email.rsplit_once('@') else {
            return Verdict::Invalid;
        };

        match tokio::net::lookup_host((domain, 25)).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    Verdict::Valid
                } else {
                    Verdict::Doubtful
                }
            }
            Err(e) => {
                tracing::debug!(%domain, error = %e, "Email domain did not resolve");
                Verdict::Doubtful
            }
        }
    }
}

/// Verification level selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerifyMode {
    #[default]
    None,
    Format,
    Domain,
}

impl std::str::FromStr for VerifyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "format" => Ok(Self::Format),
            "domain" => Ok(Self::Domain),
            other => Err(format!(
                "unknown verification mode '{other}' (expected none, format or domain)"
            )),
        }
    }
}

/// Runtime-selected verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeVerifier(pub VerifyMode);

impl EmailVerifier for ModeVerifier {
    async fn verify(&self, email: &str) -> Verdict {
        match self.0 {
            VerifyMode::None => Unverified.verify(email).await,
            VerifyMode::Format => FormatCheck.verify(email).await,
            VerifyMode::Domain => DomainCheck.verify(email).await,
        }
    }
}

fn is_well_formed(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld_ok = labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()));

    labels_ok && tld_ok
}
