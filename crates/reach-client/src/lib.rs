#[cfg(feature = "browser")]
pub mod browser;
pub mod contacts;
pub mod session;
pub mod verify;

#[cfg(feature = "browser")]
pub use browser::{BrowserSession, BrowserSessionFactory};
pub use contacts::{ContactExtractor, parse_contacts};
pub use session::{HttpSession, HttpSessionFactory, PageSource};
pub use verify::{EmailVerifier, ModeVerifier, Verdict, VerifyMode};
