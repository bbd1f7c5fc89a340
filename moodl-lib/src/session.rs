use std::{
    str,
    sync::{Mutex, PoisonError},
};

use cookie::Cookie;
use cookie_store::CookieStore;
use hyper::{
    body::{self, Bytes},
    client::connect::Connect,
    header::{self, HeaderMap},
    Body, Client, Method, Request, StatusCode,
};
use thiserror::Error;
use url::{form_urlencoded, Url};

const USER_AGENT: &str = "Mozilla/5.0";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const MAX_REDIRECTS: usize = 10;

/// An HTTP session holding every cookie handed out by the portal and the identity provider.
///
/// All requests made through the same [`Session`](Session) share one cookie store, which is what
/// lets the identity provider correlate the steps of the login handshake. Redirects are followed
/// automatically, recording cookies set at each hop.
pub struct Session<T> {
    client: Client<T, Body>,
    cookies: Mutex<CookieStore>,
}

impl<T> Session<T> {
    pub fn new(client: Client<T, Body>) -> Self {
        Self {
            client,
            cookies: Mutex::new(CookieStore::default()),
        }
    }

    /// Value of the cookie `name` that would be sent to `url`, if any.
    pub fn cookie(&self, url: &Url, name: &str) -> Option<String> {
        let cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let value = cookies
            .get_request_values(url)
            .find(|(cookie_name, _)| *cookie_name == name)
            .map(|(_, value)| value.to_owned());
        value
    }
}

impl<T> Session<T>
where
    T: Connect + Clone + Send + Sync + 'static,
{
    pub async fn get(&self, url: &Url) -> Result<Page, SessionError> {
        self.send(Method::GET, url.clone(), None).await
    }

    /// Submits `fields` as an `application/x-www-form-urlencoded` body.
    pub async fn post_form<'a, I>(&self, url: &Url, fields: I) -> Result<Page, SessionError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.send(Method::POST, url.clone(), Some(body)).await
    }

    async fn send(
        &self,
        mut method: Method,
        mut url: Url,
        mut form: Option<String>,
    ) -> Result<Page, SessionError> {
        for _ in 0..=MAX_REDIRECTS {
            let mut builder = Request::builder()
                .method(method.clone())
                .uri(url.as_str())
                .header(header::USER_AGENT, USER_AGENT)
                .header(header::ACCEPT, ACCEPT);
            if let Some(cookies) = self.cookie_header(&url) {
                builder = builder.header(header::COOKIE, cookies);
            }
            let request = match &form {
                Some(form) => builder
                    .header(header::CONTENT_TYPE, FORM_CONTENT_TYPE)
                    .body(Body::from(form.clone()))?,
                None => builder.body(Body::empty())?,
            };

            tracing::trace!(%method, %url, "sending request");
            let response = self.client.request(request).await?;
            self.store_cookies(&url, response.headers());

            let status = response.status();
            if status.is_redirection() {
                if let Some(location) = response.headers().get(header::LOCATION) {
                    let target = url.join(location.to_str()?)?;
                    tracing::trace!(%status, from = %url, to = %target, "following redirect");
                    // Only 307 and 308 preserve the method and body.
                    if status != StatusCode::TEMPORARY_REDIRECT
                        && status != StatusCode::PERMANENT_REDIRECT
                    {
                        method = Method::GET;
                        form = None;
                    }
                    url = target;
                    continue;
                }
            }

            let headers = response.headers().clone();
            let body = body::to_bytes(response.into_body()).await?;
            return Ok(Page {
                url,
                status,
                headers,
                body,
            });
        }

        Err(SessionError::TooManyRedirects(url))
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let header = cookies
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    /// Records the `Set-Cookie` headers of a response to `url`.
    ///
    /// Cookies for a domain `url` does not belong to are rejected, and expired ones remove any
    /// stored cookie they replace.
    fn store_cookies(&self, url: &Url, headers: &HeaderMap) {
        let mut cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        cookies.store_response_cookies(
            headers
                .get_all(header::SET_COOKIE)
                .iter()
                // If it can't be parsed then skip it
                .filter_map(|value| {
                    value
                        .to_str()
                        .ok()
                        .and_then(|raw_cookie| Cookie::parse(raw_cookie.to_owned()).ok())
                }),
            url,
        );
    }
}

/// A fully read response, after any redirects were followed.
#[derive(Debug, Clone)]
pub struct Page {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Page {
    /// Final URL of the response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Result<&str, str::Utf8Error> {
        str::from_utf8(&self.body)
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }
}

/// Represents errors that can occur while talking to the portal.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An argument to build the HTTP request was invalid.
    /// See more [here](https://docs.rs/http/0.2.8/http/request/struct.Builder.html#errors)
    #[error("an argument while building an HTTP request was invalid")]
    MalformedHttpArgs(#[from] hyper::http::Error),
    /// Failed to send HTTP request.
    #[error("failed to send HTTP request")]
    HttpRequestFailed(#[from] hyper::Error),
    /// A URL, or the target of a redirect, could not be parsed.
    #[error("could not parse URL")]
    InvalidUrl(#[from] url::ParseError),
    /// A header that must be text contained opaque bytes.
    #[error("received a header that is not valid text")]
    InvalidHeader(#[from] header::ToStrError),
    /// The server kept redirecting.
    #[error("too many redirects, last target was `{0}`")]
    TooManyRedirects(Url),
}
