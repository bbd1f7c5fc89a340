use std::{fmt::Display, future::Future, path::Path, str::FromStr};

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// A downloadable item referenced from a course page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    name: String,
    kind: ResourceType,
    section: String,
    is_recent: bool,
    url: Url,
}

impl Resource {
    pub fn new(
        name: String,
        kind: ResourceType,
        section: String,
        is_recent: bool,
        url: Url,
    ) -> Self {
        Self {
            name,
            kind,
            section,
            is_recent,
            url,
        }
    }

    /// Label of the resource as displayed on the course page.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    /// Label of the section the resource was found under.
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Whether the resource belongs to the section the portal marks as current.
    pub fn is_recent(&self) -> bool {
        self.is_recent
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub enum ResourceType {
    File,
    Folder,
    Assignment,
    Link,
    Unknown,
}

impl ResourceType {
    /// Infers the kind of an activity from the module in its link (e.g. `/mod/folder/view.php`).
    pub fn from_activity_url(url: &Url) -> Self {
        let path = url.path();
        if path.contains("/mod/resource/") || path.contains("/pluginfile.php") {
            ResourceType::File
        } else if path.contains("/mod/folder/") {
            ResourceType::Folder
        } else if path.contains("/mod/assign/") {
            ResourceType::Assignment
        } else if path.contains("/mod/url/") {
            ResourceType::Link
        } else {
            ResourceType::Unknown
        }
    }

    /// Infers the kind of a link embedded in a label. Links leaving the portal are plain links.
    pub fn from_embedded_url(url: &Url, page_url: &Url) -> Self {
        match ResourceType::from_activity_url(url) {
            ResourceType::Unknown if url.host_str() != page_url.host_str() => ResourceType::Link,
            kind => kind,
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ResourceType::File => "file",
                ResourceType::Folder => "folder",
                ResourceType::Assignment => "assignment",
                ResourceType::Link => "link",
                ResourceType::Unknown => "unknown",
            }
        )
    }
}

/// How to treat a destination that already holds a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub enum UpdatePolicy {
    /// Overwrite the file if its contents changed.
    #[default]
    Update,
    /// Keep the existing file.
    Skip,
    /// Always overwrite the file.
    Replace,
}

impl FromStr for UpdatePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "update" => UpdatePolicy::Update,
            "skip" => UpdatePolicy::Skip,
            "replace" => UpdatePolicy::Replace,
            _ => return Err(ParsePolicyError(s.to_owned())),
        })
    }
}

impl Display for UpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                UpdatePolicy::Update => "update",
                UpdatePolicy::Skip => "skip",
                UpdatePolicy::Replace => "replace",
            }
        )
    }
}

#[derive(Debug, Error)]
#[error("unknown update policy `{0}`, expected one of `update`, `skip` or `replace`")]
pub struct ParsePolicyError(String);

/// Transfers a resource to disk.
///
/// The catalog only decides *what* to download; implementors decide how each kind of resource is
/// fetched and written.
pub trait Downloader {
    type Error: std::error::Error + Send + Sync + 'static;

    fn download(
        &self,
        resource: &Resource,
        destination: &Path,
        policy: UpdatePolicy,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}
