pub mod auth;
mod course;
pub mod model;
mod parser;
mod resource;
mod session;

pub use auth::{AuthError, Credentials, Portal};
pub use course::{Course, CourseError, DownloadError, DownloadOutcome};
pub use parser::{parse_attachment_links, ParseError};
pub use regex::Error as PatternError;
pub use resource::{Downloader, ParsePolicyError, Resource, ResourceType, UpdatePolicy};
pub use session::{Page, Session, SessionError};

#[cfg(feature = "rustls")]
use hyper::{client::HttpConnector, Client};
#[cfg(feature = "rustls")]
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};

/// A [`Session`](Session) over HTTPS, as created by [`https_session`](https_session).
#[cfg(feature = "rustls")]
pub type HttpsSession = Session<HttpsConnector<HttpConnector>>;

/// Creates an unauthenticated session trusting the platform's native root certificates.
#[cfg(feature = "rustls")]
pub fn https_session() -> HttpsSession {
    Session::new(
        Client::builder().build(
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_or_http()
                .enable_http1()
                .build(),
        ),
    )
}

/// Logs into TUM Moodle, returning `None` if any step of the handshake fails.
///
/// The reason for a failure is logged. Use [`auth::try_login`](auth::try_login) to inspect it.
#[cfg(feature = "rustls")]
pub async fn login(username: &str, password: &str) -> Option<HttpsSession> {
    auth::login(
        https_session(),
        &Portal::default(),
        &Credentials::new(username, password),
    )
    .await
}
