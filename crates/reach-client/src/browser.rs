use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use reach_core::error::AppError;
use reach_core::traits::{Session, SessionFactory};
use tokio::task::JoinHandle;

use crate::session::PageSource;

/// How long to wait for `<body>` once navigation has returned.
const BODY_WAIT: Duration = Duration::from_secs(10);

/// Launches one headless Chromium per worker session.
///
/// Unlike [`HttpSessionFactory`](crate::HttpSessionFactory), pages are
/// rendered with JavaScript before their HTML is read, which matters for
/// sites that inject contact details client-side.
///
/// Requires a Chromium / Chrome binary reachable via `$CHROME_BIN`, one of
/// the well-known install paths, or `chromiumoxide`'s own lookup.
#[derive(Debug, Clone, Default)]
pub struct BrowserSessionFactory {
    chrome_bin: Option<PathBuf>,
}

impl BrowserSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit browser binary instead of searching for one.
    pub fn with_chrome_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_bin = Some(path.into());
        self
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// On systems where Chromium is installed via **snap**, the wrapper at
    /// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode,
    /// so the binary inside the snap is preferred.
    fn find_chrome_binary() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(p);
            if path.exists() {
                return Some(path);
            }
        }

        CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl SessionFactory for BrowserSessionFactory {
    type Session = BrowserSession;

    async fn open(&self) -> Result<BrowserSession, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = self.chrome_bin.clone().or_else(Self::find_chrome_binary) {
            tracing::debug!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::SessionError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::SessionError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(BrowserSession {
            browser,
            handler_task,
        })
    }
}

/// A headless browser owned by one worker.
pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl Session for BrowserSession {
    async fn close(self) {
        let Self {
            mut browser,
            handler_task,
        } = self;
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "Browser did not close cleanly");
        }
        let _ = browser.wait().await;
        handler_task.abort();
    }
}

impl PageSource for BrowserSession {
    async fn load(&self, url: &str, timeout: Duration) -> Result<String, AppError> {
        let result = tokio::time::timeout(timeout, async {
            let page = self
                .browser
                .new_page(url)
                .await
                .map_err(|e| AppError::driver(format!("Failed to navigate to {url}"), e))?;

            let body = tokio::time::timeout(BODY_WAIT, page.find_element("body")).await;
            let html = match body {
                Ok(Ok(_)) => page
                    .content()
                    .await
                    .map_err(|e| AppError::driver("Failed to read page content", e)),
                Ok(Err(e)) => Err(AppError::ElementNotFound(format!("body on {url}: {e}"))),
                Err(_) => Err(AppError::Timeout(BODY_WAIT.as_secs())),
            };

            // Close the tab whatever happened so tabs do not pile up in the session.
            let _ = page.close().await;
            html
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(timeout.as_secs())),
        }
    }
}
