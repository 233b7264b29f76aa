use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::ContactInfo;

/// A long-lived browser-automation (or HTTP) session owned by one worker.
///
/// Sessions are expensive to create; a worker opens one and reuses it for
/// every row it processes, then closes it when the worker exits. A session
/// is never used by two workers at the same time.
pub trait Session: Send + Sync + 'static {
    /// Release the underlying resources (browser process, connection pool).
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Creates sessions for workers.
pub trait SessionFactory: Send + Sync + Clone + 'static {
    type Session: Session;

    fn open(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// Pulls contact information out of a loaded target site.
///
/// Implementations must be idempotent and safe to retry.
pub trait Extractor<S: Session>: Send + Sync + Clone + 'static {
    fn extract(
        &self,
        session: &S,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<ContactInfo, AppError>> + Send;
}
