//! The Shibboleth single sign-on handshake in front of Moodle.
//!
//! Every step that depends on the identity provider's markup lives in its own `extract_*`
//! function. When the login page changes, the step that broke is the one to fix.

use std::fmt;

use hyper::{client::connect::Connect, StatusCode};
use thiserror::Error;
use url::Url;

use crate::{
    parser::Html,
    session::{Page, Session, SessionError},
};

const AUTH_URL: &str = "https://www.moodle.tum.de/Shibboleth.sso/Login?providerId=https%3A%2F%2Ftumidp.lrz.de%2Fidp%2Fshibboleth&target=https%3A%2F%2Fwww.moodle.tum.de%2Fauth%2Fshibboleth%2Findex.php";
const IDP_ORIGIN: &str = "https://login.tum.de";

const CSRF_FIELD: &str = "csrf_token";
const USERNAME_FIELD: &str = "j_username";
const PASSWORD_FIELD: &str = "j_password";
const DO_NOT_CACHE_FIELD: &str = "donotcache";
const PROCEED_FIELD: &str = "_eventId_proceed";
// Container holding the login form.
const CONTENT_SELECTOR: &str = "#content";

/// Endpoints the handshake talks to.
#[derive(Debug, Clone)]
pub struct Portal {
    /// Protected URL that redirects to the identity provider's login form.
    pub auth_url: Url,
    /// Origin the login form's relative `action` is resolved against.
    pub idp_origin: Url,
    /// How many consent/relay forms are posted after submitting credentials.
    pub relay_steps: usize,
}

impl Portal {
    pub fn new(auth_url: Url, idp_origin: Url) -> Self {
        Self {
            auth_url,
            idp_origin,
            relay_steps: 1,
        }
    }

    /// Adds another relay round-trip, for deployments that bounce through more than one
    /// auto-submitting form before landing back on the portal.
    pub fn with_relay_steps(mut self, relay_steps: usize) -> Self {
        self.relay_steps = relay_steps;
        self
    }
}

impl Default for Portal {
    fn default() -> Self {
        // Both are constants known to be valid URLs.
        Self::new(Url::parse(AUTH_URL).unwrap(), Url::parse(IDP_ORIGIN).unwrap())
    }
}

#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A step of the handshake, used to pinpoint where it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Fetching the protected URL and following it to the login form.
    Init,
    /// Reading the CSRF token and form action off the login page.
    LoginForm,
    /// Posting the credentials.
    Submitting,
    /// Reading the hidden fields of a consent/relay form.
    ConsentForm,
    /// Posting a consent/relay form.
    Accepting,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Step::Init => "init",
                Step::LoginForm => "login form",
                Step::Submitting => "submitting",
                Step::ConsentForm => "consent form",
                Step::Accepting => "accepting",
            }
        )
    }
}

/// The login form's target and the anti-forgery token to echo back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    /// Path of the form's `action`, relative to the identity provider's origin.
    pub action: String,
    pub csrf_token: String,
}

/// An auto-submitting form carrying the identity provider's assertion back to the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentForm {
    pub action: Url,
    pub fields: Vec<(String, String)>,
}

/// Finds the CSRF token input and the form inside `div#content` of the login page.
pub fn extract_login_form(html: &str) -> Result<LoginForm, AuthError> {
    let structure = |missing: &'static str| AuthError::Structure {
        step: Step::LoginForm,
        missing,
    };
    let html = Html::parse(html).map_err(|_| structure("parsable HTML"))?;

    let csrf_token = html
        .select("input")
        .find(|&input| html.attribute(input, "name").as_deref() == Some(CSRF_FIELD))
        .and_then(|input| html.attribute(input, "value"))
        .ok_or_else(|| structure("CSRF token input"))?;

    let content = html
        .select(CONTENT_SELECTOR)
        .next()
        .ok_or_else(|| structure("content container"))?;
    let action = html
        .select_within(content, "form")
        .next()
        .and_then(|form| html.attribute(form, "action"))
        .ok_or_else(|| structure("login form action"))?;

    Ok(LoginForm { action, csrf_token })
}

/// Collects every input inside the first container of the page's first form.
pub fn extract_consent_form(html: &str) -> Result<ConsentForm, AuthError> {
    let structure = |missing: &'static str| AuthError::Structure {
        step: Step::ConsentForm,
        missing,
    };
    let html = Html::parse(html).map_err(|_| structure("parsable HTML"))?;

    let form = html.select("form").next().ok_or_else(|| structure("form"))?;
    let action = html
        .attribute(form, "action")
        .ok_or_else(|| structure("form action"))?;
    // The action is already absolute. A relative one means this isn't the consent form, most
    // likely because the identity provider rendered its login page again.
    let action = Url::parse(&action).map_err(|_| AuthError::InvalidAction {
        step: Step::ConsentForm,
        action,
    })?;

    let container = html
        .select_within(form, "div")
        .next()
        .ok_or_else(|| structure("form container"))?;
    let fields = html
        .select_within(container, "input")
        .filter_map(|input| {
            let name = html.attribute(input, "name")?;
            Some((name, html.attribute(input, "value").unwrap_or_default()))
        })
        .collect();

    Ok(ConsentForm { action, fields })
}

/// Runs the handshake to completion, returning the authenticated session.
pub async fn try_login<T>(
    session: Session<T>,
    portal: &Portal,
    credentials: &Credentials,
) -> Result<Session<T>, AuthError>
where
    T: Connect + Clone + Send + Sync + 'static,
{
    tracing::debug!(url = %portal.auth_url, "starting Moodle session");
    let page = expect_ok(Step::Init, session.get(&portal.auth_url).await?)?;

    let login_form = extract_login_form(page.text().unwrap_or_default())?;
    tracing::debug!(action = %login_form.action, "found login form");

    let action = portal.idp_origin.join(&login_form.action)?;
    let mut page = expect_ok(
        Step::Submitting,
        session
            .post_form(
                &action,
                [
                    (CSRF_FIELD, login_form.csrf_token.as_str()),
                    (USERNAME_FIELD, credentials.username.as_str()),
                    (PASSWORD_FIELD, credentials.password.as_str()),
                    (DO_NOT_CACHE_FIELD, "1"),
                    (PROCEED_FIELD, ""),
                ],
            )
            .await?,
    )?;

    for relay in 0..portal.relay_steps {
        let consent_form = extract_consent_form(page.text().unwrap_or_default())?;
        tracing::debug!(
            relay,
            action = %consent_form.action,
            fields = consent_form.fields.len(),
            "posting consent form"
        );
        page = expect_ok(
            Step::Accepting,
            session
                .post_form(
                    &consent_form.action,
                    consent_form
                        .fields
                        .iter()
                        .map(|(name, value)| (name.as_str(), value.as_str())),
                )
                .await?,
        )?;
    }

    tracing::info!(username = credentials.username(), "login OK");
    Ok(session)
}

/// Runs the handshake, logging and discarding the reason if it fails.
pub async fn login<T>(
    session: Session<T>,
    portal: &Portal,
    credentials: &Credentials,
) -> Option<Session<T>>
where
    T: Connect + Clone + Send + Sync + 'static,
{
    match try_login(session, portal, credentials).await {
        Ok(session) => Some(session),
        Err(err) => {
            tracing::error!(category = err.category(), error = %err, "login failed");
            None
        }
    }
}

fn expect_ok(step: Step, page: Page) -> Result<Page, AuthError> {
    match page.status() {
        StatusCode::OK => Ok(page),
        status => Err(AuthError::Transport { step, status }),
    }
}

/// Represents errors that can occur during the login handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The request itself could not be completed.
    #[error(transparent)]
    Connection(#[from] SessionError),
    /// A step answered with something other than `200 OK`.
    #[error("{step} step returned status {status}")]
    Transport { step: Step, status: StatusCode },
    /// An element the step depends on was missing.
    /// The most likely cause of this issue is the login page being updated.
    #[error("{step} step could not find the {missing}")]
    Structure { step: Step, missing: &'static str },
    /// A form action could not be turned into a URL.
    #[error("{step} step found an unusable form action `{action}`")]
    InvalidAction { step: Step, action: String },
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        AuthError::Connection(SessionError::InvalidUrl(err))
    }
}

impl AuthError {
    /// Coarse failure category, recorded in logs.
    pub fn category(&self) -> &'static str {
        match self {
            AuthError::Connection(_) | AuthError::Transport { .. } => "transport",
            AuthError::Structure { .. } | AuthError::InvalidAction { .. } => "structure",
        }
    }
}

