use std::{
    io,
    path::{Path, PathBuf},
};

use hyper::client::connect::Connect;
use moodl_lib::{
    Downloader, Page, ParseError, Resource, ResourceType, Session, SessionError, UpdatePolicy,
};
use tokio::fs;
use url::Url;

const RESOURCE_VIEW_PATH: &str = "/mod/resource/view.php";
const FOLDER_DOWNLOAD_PATH: &str = "/mod/folder/download_folder.php";

/// Downloads files, folders and assignment attachments through an authenticated session.
///
/// Files are saved under their served name. Folders are saved as a zip archive, and the
/// attachments of an assignment go into a directory named after it.
pub struct FileDownloader<'a, T> {
    session: &'a Session<T>,
}

impl<'a, T> FileDownloader<'a, T> {
    pub fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }
}

impl<T> Downloader for FileDownloader<'_, T>
where
    T: Connect + Clone + Send + Sync + 'static,
{
    type Error = FileDownloadError;

    async fn download(
        &self,
        resource: &Resource,
        destination: &Path,
        policy: UpdatePolicy,
    ) -> Result<(), Self::Error> {
        match resource.kind() {
            ResourceType::File => {
                let page = self.fetch_file(&file_url(resource.url())).await?;
                let name = file_name(&page).ok_or_else(|| no_file_name(&page))?;
                save(&page, destination, &name, policy).await
            }
            ResourceType::Folder => {
                let page = self.fetch_file(&folder_url(resource.url())?).await?;
                let name = disposition_file_name(&page)
                    .and_then(sanitize)
                    .or_else(|| sanitize(format!("{}.zip", resource.name())))
                    .ok_or_else(|| no_file_name(&page))?;
                save(&page, destination, &name, policy).await
            }
            ResourceType::Assignment => {
                let page = self.session.get(resource.url()).await?;
                check_status(&page)?;
                let html = page.text().map_err(ParseError::from)?;
                let links = moodl_lib::parse_attachment_links(page.url(), html)?;
                if links.is_empty() {
                    tracing::info!(resource = resource.name(), "assignment has no attachments");
                    return Ok(());
                }

                let directory = match sanitize(resource.name().to_owned()) {
                    Some(name) => destination.join(name),
                    None => destination.to_owned(),
                };
                for link in links {
                    let page = self.fetch_file(&link).await?;
                    let name = file_name(&page).ok_or_else(|| no_file_name(&page))?;
                    save(&page, &directory, &name, policy).await?;
                }
                Ok(())
            }
            kind => Err(FileDownloadError::Unsupported(kind)),
        }
    }
}

impl<T> FileDownloader<'_, T>
where
    T: Connect + Clone + Send + Sync + 'static,
{
    /// Fetches `url`, failing if the portal answers with a web page instead of a file.
    async fn fetch_file(&self, url: &Url) -> Result<Page, FileDownloadError> {
        let page = self.session.get(url).await?;
        check_status(&page)?;
        // Moodle renders a page instead of redirecting when a file can't be served directly,
        // e.g. for resources displayed embedded or in a popup.
        if page
            .header("content-type")
            .map_or(false, |content_type| content_type.starts_with("text/html"))
        {
            return Err(FileDownloadError::NotAFile(page.url().clone()));
        }
        Ok(page)
    }
}

/// Writes `page` to `directory/name`, honoring `policy` when the file already exists.
async fn save(
    page: &Page,
    directory: &Path,
    name: &str,
    policy: UpdatePolicy,
) -> Result<(), FileDownloadError> {
    let path = directory.join(name);

    let exists = fs::metadata(&path).await.is_ok();
    match policy {
        UpdatePolicy::Skip if exists => {
            tracing::info!(path = %path.display(), "file exists, skipping");
            return Ok(());
        }
        UpdatePolicy::Update if exists => {
            let current = fs::read(&path).await.map_err(|err| io_error(&path, err))?;
            if current == page.bytes() {
                tracing::info!(path = %path.display(), "file is up to date");
                return Ok(());
            }
        }
        _ => {}
    }

    fs::create_dir_all(directory)
        .await
        .map_err(|err| io_error(directory, err))?;
    fs::write(&path, page.bytes())
        .await
        .map_err(|err| io_error(&path, err))?;
    tracing::info!(
        path = %path.display(),
        bytes = page.bytes().len(),
        "downloaded file"
    );
    Ok(())
}

fn check_status(page: &Page) -> Result<(), FileDownloadError> {
    match page.status().as_u16() {
        200 => Ok(()),
        status => Err(FileDownloadError::Status(status)),
    }
}

// Asks Moodle to redirect to the file instead of embedding it in a page.
fn file_url(url: &Url) -> Url {
    let mut url = url.clone();
    if url.path().ends_with(RESOURCE_VIEW_PATH) {
        url.query_pairs_mut().append_pair("redirect", "1");
    }
    url
}

/// Zip download of a folder, given the link to its view page (`/mod/folder/view.php?id=<id>`).
fn folder_url(url: &Url) -> Result<Url, FileDownloadError> {
    let id = url
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, id)| id.into_owned())
        .ok_or_else(|| FileDownloadError::MissingId(url.clone()))?;
    let mut download = url.join(FOLDER_DOWNLOAD_PATH).map_err(SessionError::from)?;
    download.query_pairs_mut().clear().append_pair("id", &id);
    Ok(download)
}

/// Name from `Content-Disposition`, falling back to the last segment of the final URL.
///
/// Segments naming a Moodle script (e.g. `view.php`) are never used, they would be shared by
/// every resource.
fn file_name(page: &Page) -> Option<String> {
    let name = disposition_file_name(page).or_else(|| {
        let segment = page.url().path_segments()?.last()?;
        if segment.ends_with(".php") {
            return None;
        }
        urlencoding::decode(segment).ok().map(|name| name.into_owned())
    })?;
    sanitize(name)
}

fn disposition_file_name(page: &Page) -> Option<String> {
    parse_disposition(page.header("content-disposition")?)
}

fn parse_disposition(value: &str) -> Option<String> {
    let params = value.split(';').map(str::trim);
    let mut plain = None;
    for param in params {
        // RFC 5987 style, e.g. `filename*=UTF-8''Lecture%201.pdf`
        if let Some(encoded) = param.strip_prefix("filename*=") {
            let encoded = encoded.rsplit('\'').next()?;
            return urlencoding::decode(encoded).ok().map(|name| name.into_owned());
        }
        if let Some(name) = param.strip_prefix("filename=") {
            plain = Some(name.trim_matches('"').to_owned());
        }
    }
    plain
}

// Never let a server-provided name escape the destination directory.
fn sanitize(name: String) -> Option<String> {
    let name = name.replace(['/', '\\'], "_");
    let name = name.trim();
    (!name.is_empty() && name != "." && name != "..").then(|| name.to_owned())
}

fn no_file_name(page: &Page) -> FileDownloadError {
    FileDownloadError::NoFileName(page.url().clone())
}

fn io_error(path: &Path, source: io::Error) -> FileDownloadError {
    FileDownloadError::Io {
        path: path.to_owned(),
        source,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileDownloadError {
    #[error("downloading {0} resources is not supported")]
    Unsupported(ResourceType),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("server returned status {0}")]
    Status(u16),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("`{0}` is a web page, not a file")]
    NotAFile(Url),
    #[error("could not find the module id in `{0}`")]
    MissingId(Url),
    #[error("could not determine a file name for `{0}`")]
    NoFileName(Url),
    #[error("could not write `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::TcpListener};

    use hyper::{
        client::HttpConnector,
        header,
        service::{make_service_fn, service_fn},
        Body, Client, Request, Response, Server, StatusCode,
    };
    use tempfile::TempDir;

    use super::*;

    const SLIDES: &[u8] = b"%PDF-1.5 lecture slides, second revision";
    const SHEET: &[u8] = b"%PDF-1.5 exercise sheet";
    const ARCHIVE: &[u8] = b"PK\x03\x04 code examples";

    fn file(content_type: &str, body: &'static [u8]) -> Response<Body> {
        Response::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    fn html(body: &'static str) -> Response<Body> {
        Response::builder()
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(body))
            .unwrap()
    }

    async fn handle(request: Request<Body>) -> Result<Response<Body>, Infallible> {
        let path = request.uri().path().to_owned();
        let query = request.uri().query().unwrap_or_default().to_owned();

        Ok(match (path.as_str(), query.as_str()) {
            // Redirects to the file, named by the final URL.
            (RESOURCE_VIEW_PATH, "id=1&redirect=1") => Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header(
                    header::LOCATION,
                    "/pluginfile.php/3/mod_resource/content/1/Lecture%201.pdf",
                )
                .body(Body::empty())
                .unwrap(),
            ("/pluginfile.php/3/mod_resource/content/1/Lecture%201.pdf", _) => {
                file("application/pdf", SLIDES)
            }
            // Serves the file directly, named by its disposition.
            (RESOURCE_VIEW_PATH, "id=2&redirect=1") => Response::builder()
                .header(header::CONTENT_TYPE, "application/pdf")
                .header(
                    header::CONTENT_DISPOSITION,
                    "inline; filename*=UTF-8''%C3%9Cbung%201.pdf",
                )
                .body(Body::from(SLIDES))
                .unwrap(),
            // Embedded resource, rendered as a page.
            (RESOURCE_VIEW_PATH, "id=3&redirect=1") => {
                html("<html><body><object data=\"x.pdf\"></object></body></html>")
            }
            (FOLDER_DOWNLOAD_PATH, "id=4") => Response::builder()
                .header(header::CONTENT_TYPE, "application/zip")
                .header(
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"Code Examples-20231019.zip\"",
                )
                .body(Body::from(ARCHIVE))
                .unwrap(),
            (FOLDER_DOWNLOAD_PATH, "id=5") => file("application/zip", ARCHIVE),
            ("/mod/assign/view.php", "id=6") => html(
                r#"<html><body>
                <a href="/pluginfile.php/9/mod_assign/introattachment/0/sheet.pdf?forcedownload=1">sheet.pdf</a>
                <a href="/pluginfile.php/9/mod_assign/introattachment/0/code.zip">code.zip</a>
                <a href="/mod/assign/view.php?id=6&amp;action=editsubmission">Add submission</a>
                </body></html>"#,
            ),
            ("/pluginfile.php/9/mod_assign/introattachment/0/sheet.pdf", _) => {
                file("application/pdf", SHEET)
            }
            ("/pluginfile.php/9/mod_assign/introattachment/0/code.zip", _) => {
                file("application/zip", ARCHIVE)
            }
            ("/mod/assign/view.php", "id=7") => html("<html><body><p>No files</p></body></html>"),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap(),
        })
    }

    /// Starts the stand-in portal, returning its base URL.
    fn serve() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let base = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();

        let make_service =
            make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
        tokio::spawn(Server::from_tcp(listener).unwrap().serve(make_service));

        base
    }

    fn session() -> Session<HttpConnector> {
        Session::new(Client::new())
    }

    fn resource(base: &Url, name: &str, kind: ResourceType, link: &str) -> Resource {
        Resource::new(
            name.to_owned(),
            kind,
            "Week 1".to_owned(),
            false,
            base.join(link).unwrap(),
        )
    }

    async fn download(
        resource: &Resource,
        destination: &Path,
        policy: UpdatePolicy,
    ) -> Result<(), FileDownloadError> {
        let session = session();
        FileDownloader::new(&session)
            .download(resource, destination, policy)
            .await
    }

    #[tokio::test]
    async fn file_is_named_after_final_url() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let slides = resource(&base, "Lecture 1", ResourceType::File, "/mod/resource/view.php?id=1");

        download(&slides, dir.path(), UpdatePolicy::Update)
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("Lecture 1.pdf")).unwrap(), SLIDES);
    }

    #[tokio::test]
    async fn file_is_named_after_disposition() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let slides = resource(&base, "Übung 1", ResourceType::File, "/mod/resource/view.php?id=2");

        download(&slides, dir.path(), UpdatePolicy::Update)
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("Übung 1.pdf")).unwrap(), SLIDES);
    }

    #[tokio::test]
    async fn update_policies_on_existing_file() {
        let base = serve();
        let slides = resource(&base, "Lecture 1", ResourceType::File, "/mod/resource/view.php?id=1");
        let cases: [(UpdatePolicy, &[u8], &[u8]); 4] = [
            (UpdatePolicy::Skip, b"old slides", b"old slides"),
            (UpdatePolicy::Update, b"old slides", SLIDES),
            (UpdatePolicy::Update, SLIDES, SLIDES),
            (UpdatePolicy::Replace, b"old slides", SLIDES),
        ];

        for (policy, existing, expected) in cases {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("Lecture 1.pdf");
            std::fs::write(&path, existing).unwrap();

            download(&slides, dir.path(), policy).await.unwrap();

            assert_eq!(std::fs::read(&path).unwrap(), expected, "policy {policy}");
        }
    }

    #[tokio::test]
    async fn missing_destination_is_created() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("slides").join("week 1");
        let slides = resource(&base, "Lecture 1", ResourceType::File, "/mod/resource/view.php?id=1");

        download(&slides, &destination, UpdatePolicy::Skip)
            .await
            .unwrap();

        assert_eq!(std::fs::read(destination.join("Lecture 1.pdf")).unwrap(), SLIDES);
    }

    #[tokio::test]
    async fn embedded_page_is_not_saved() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let embedded = resource(&base, "Notes", ResourceType::File, "/mod/resource/view.php?id=3");

        let result = download(&embedded, dir.path(), UpdatePolicy::Replace).await;

        assert!(matches!(result, Err(FileDownloadError::NotAFile(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn folder_is_saved_as_archive() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let named = resource(&base, "Code Examples", ResourceType::Folder, "/mod/folder/view.php?id=4");
        let unnamed = resource(&base, "Recordings", ResourceType::Folder, "/mod/folder/view.php?id=5");

        download(&named, dir.path(), UpdatePolicy::Update)
            .await
            .unwrap();
        download(&unnamed, dir.path(), UpdatePolicy::Update)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("Code Examples-20231019.zip")).unwrap(),
            ARCHIVE
        );
        assert_eq!(std::fs::read(dir.path().join("Recordings.zip")).unwrap(), ARCHIVE);
    }

    #[tokio::test]
    async fn assignment_attachments_go_into_its_directory() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let homework = resource(&base, "Homework 2", ResourceType::Assignment, "/mod/assign/view.php?id=6");

        download(&homework, dir.path(), UpdatePolicy::Update)
            .await
            .unwrap();

        let directory = dir.path().join("Homework 2");
        assert_eq!(std::fs::read(directory.join("sheet.pdf")).unwrap(), SHEET);
        assert_eq!(std::fs::read(directory.join("code.zip")).unwrap(), ARCHIVE);
    }

    #[tokio::test]
    async fn assignment_without_attachments_writes_nothing() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let quiz = resource(&base, "Homework 3", ResourceType::Assignment, "/mod/assign/view.php?id=7");

        download(&quiz, dir.path(), UpdatePolicy::Update)
            .await
            .unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn links_are_unsupported() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let website = resource(&base, "Chair website", ResourceType::Link, "/mod/url/view.php?id=8");

        let result = download(&website, dir.path(), UpdatePolicy::Update).await;

        assert!(matches!(
            result,
            Err(FileDownloadError::Unsupported(ResourceType::Link))
        ));
    }

    #[tokio::test]
    async fn failing_status_is_reported() {
        let base = serve();
        let dir = TempDir::new().unwrap();
        let missing = resource(&base, "Gone", ResourceType::File, "/mod/resource/view.php?id=99");

        let result = download(&missing, dir.path(), UpdatePolicy::Update).await;

        assert!(matches!(result, Err(FileDownloadError::Status(404))));
    }

    #[test]
    fn disposition_names() {
        assert_eq!(
            parse_disposition(r#"inline; filename="Lecture 1.pdf""#).as_deref(),
            Some("Lecture 1.pdf")
        );
        assert_eq!(
            parse_disposition("attachment; filename*=UTF-8''%C3%9Cbung%201.pdf").as_deref(),
            Some("Übung 1.pdf")
        );
        assert_eq!(parse_disposition("inline"), None);
    }

    #[test]
    fn resource_views_redirect_to_file() {
        let url = Url::parse("https://www.moodle.tum.de/mod/resource/view.php?id=12").unwrap();
        assert_eq!(
            file_url(&url).as_str(),
            "https://www.moodle.tum.de/mod/resource/view.php?id=12&redirect=1"
        );

        let url = Url::parse("https://www.moodle.tum.de/pluginfile.php/1/a.pdf").unwrap();
        assert_eq!(file_url(&url), url);
    }

    #[test]
    fn folder_views_map_to_archive_download() {
        let url = Url::parse("https://www.moodle.tum.de/mod/folder/view.php?id=42").unwrap();
        assert_eq!(
            folder_url(&url).unwrap().as_str(),
            "https://www.moodle.tum.de/mod/folder/download_folder.php?id=42"
        );

        let url = Url::parse("https://www.moodle.tum.de/mod/folder/view.php").unwrap();
        assert!(matches!(
            folder_url(&url),
            Err(FileDownloadError::MissingId(_))
        ));
    }

    #[test]
    fn names_are_kept_inside_destination() {
        assert_eq!(sanitize("../../etc/passwd".to_owned()).as_deref(), Some(".._.._etc_passwd"));
        assert_eq!(sanitize("..".to_owned()), None);
        assert_eq!(sanitize("  ".to_owned()), None);
    }
}
