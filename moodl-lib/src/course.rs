use std::{collections::HashMap, path::Path};

use hyper::{client::connect::Connect, StatusCode};
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::{
    parser::{self, ParseError},
    resource::{Downloader, Resource, UpdatePolicy},
    session::{Session, SessionError},
};

/// The resource catalog of a single course.
///
/// Resources are keyed by name in the order they appear on the course page. When a name was
/// already taken, the later resource is keyed as `"<name> <section>"` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    name: String,
    url: Url,
    resources: Vec<(String, Resource)>,
    // Position of each key in `resources`.
    index: HashMap<String, usize>,
    // Positions in `resources` of the resources in the current section.
    latest: Vec<usize>,
}

impl Course {
    /// Fetches the course page at `url` and builds its catalog.
    pub async fn new<T>(session: &Session<T>, name: &str, url: Url) -> Result<Self, CourseError>
    where
        T: Connect + Clone + Send + Sync + 'static,
    {
        tracing::debug!(course = name, %url, "fetching course page");
        let page = session.get(&url).await?;
        if page.status() != StatusCode::OK {
            return Err(CourseError::Status {
                url,
                status: page.status(),
            });
        }

        let html = page.text().map_err(ParseError::from)?;
        Self::from_html(name, url, html)
    }

    /// Builds the catalog from an already fetched course page.
    pub fn from_html(name: &str, url: Url, html: &str) -> Result<Self, CourseError> {
        let mut course = Self {
            name: name.to_owned(),
            resources: Vec::new(),
            index: HashMap::new(),
            latest: Vec::new(),
            url,
        };
        for resource in parser::parse_course_page(&course.url, html)? {
            course.insert(resource);
        }
        course.latest = course
            .resources
            .iter()
            .enumerate()
            .filter(|(_, (_, resource))| resource.is_recent())
            .map(|(position, _)| position)
            .collect();

        tracing::info!(
            course = %course.name,
            resources = course.resources.len(),
            latest = course.latest.len(),
            "built course catalog"
        );
        Ok(course)
    }

    fn insert(&mut self, resource: Resource) {
        let key = if self.index.contains_key(resource.name()) {
            format!("{} {}", resource.name(), resource.section())
        } else {
            resource.name().to_owned()
        };

        match self.index.get(&key) {
            Some(&position) => {
                tracing::warn!(
                    course = %self.name,
                    key = %key,
                    "resource name collides even with its section, replacing the earlier one"
                );
                self.resources[position].1 = resource;
            }
            None => {
                self.index.insert(key.clone(), self.resources.len());
                self.resources.push((key, resource));
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.index
            .get(name)
            .map(|&position| &self.resources[position].1)
    }

    /// Every resource with its key, in page order.
    pub fn list_all_resources(&self) -> impl Iterator<Item = (&str, &Resource)> + '_ {
        self.resources
            .iter()
            .map(|(key, resource)| (key.as_str(), resource))
    }

    /// Resources of the section marked current, in page order.
    pub fn list_latest_resources(&self) -> impl Iterator<Item = (&str, &Resource)> + '_ {
        self.latest.iter().map(|&position| {
            let (key, resource) = &self.resources[position];
            (key.as_str(), resource)
        })
    }

    /// Keys whose beginning matches `pattern`, in page order.
    pub fn match_resource_names(&self, pattern: &str) -> Result<Vec<&str>, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})"))?;
        Ok(self
            .resources
            .iter()
            .map(|(key, _)| key.as_str())
            .filter(|key| regex.is_match(key))
            .collect())
    }

    /// Downloads the resource keyed `name` into `destination`.
    ///
    /// Failures are logged and returned, they are never fatal to the catalog.
    pub async fn download_resource<D>(
        &self,
        name: &str,
        destination: &Path,
        policy: UpdatePolicy,
        downloader: &D,
    ) -> Result<(), DownloadError>
    where
        D: Downloader,
    {
        tracing::info!(course = %self.name, resource = name, "searching for resource");
        let result = match self.get(name) {
            Some(resource) => self
                .dispatch(name, resource, destination, policy, downloader)
                .await,
            None => Err(DownloadError::NotFound(name.to_owned())),
        };
        if let Err(err) = &result {
            tracing::error!(course = %self.name, error = %err, "could not download resource");
        }
        result
    }

    /// Downloads every resource of the current section, continuing past failures.
    pub async fn download_latest_resources<D>(
        &self,
        destination: &Path,
        policy: UpdatePolicy,
        downloader: &D,
    ) -> Vec<DownloadOutcome>
    where
        D: Downloader,
    {
        tracing::info!(course = %self.name, "downloading latest resources");
        if self.latest.is_empty() {
            tracing::info!(course = %self.name, "no resources categorized as latest found");
        }

        let mut outcomes = Vec::with_capacity(self.latest.len());
        for (key, resource) in self.list_latest_resources() {
            let result = self
                .dispatch(key, resource, destination, policy, downloader)
                .await;
            if let Err(err) = &result {
                tracing::error!(course = %self.name, error = %err, "could not download resource");
            }
            outcomes.push(DownloadOutcome {
                name: key.to_owned(),
                result,
            });
        }
        outcomes
    }

    async fn dispatch<D>(
        &self,
        key: &str,
        resource: &Resource,
        destination: &Path,
        policy: UpdatePolicy,
        downloader: &D,
    ) -> Result<(), DownloadError>
    where
        D: Downloader,
    {
        tracing::debug!(resource = key, kind = %resource.kind(), url = %resource.url(), "downloading");
        downloader
            .download(resource, destination, policy)
            .await
            .map_err(|err| DownloadError::Failed {
                name: key.to_owned(),
                source: Box::new(err),
            })
    }
}

/// Result of downloading one resource as part of a batch.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub name: String,
    pub result: Result<(), DownloadError>,
}

impl DownloadOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Represents errors that can occur downloading a single resource.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No resource in the catalog has this name.
    #[error("no resource matching `{0}` found")]
    NotFound(String),
    /// The downloader failed.
    #[error("failed to download `{name}`")]
    Failed {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Represents errors that can occur building a course catalog.
#[derive(Debug, Error)]
pub enum CourseError {
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The course page answered with something other than `200 OK`.
    #[error("course page `{url}` returned status {status}")]
    Status { url: Url, status: StatusCode },
    #[error(transparent)]
    Parse(#[from] ParseError),
}
