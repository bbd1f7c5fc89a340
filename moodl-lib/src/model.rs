//! Owned, serializable snapshots of a catalog.

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    course::Course,
    resource::{Resource, ResourceType},
};

/// Model of a [`Course`](Course) with every resource listed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct CourseModel {
    pub name: String,
    pub url: Url,
    pub resources: Vec<ResourceModel>,
    /// Keys of the resources in the current section.
    pub latest: Vec<String>,
}

/// Model of a [`Resource`](Resource) under its catalog key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct ResourceModel {
    pub key: String,
    pub name: String,
    pub kind: ResourceType,
    pub section: String,
    pub is_recent: bool,
    pub url: Url,
}

impl From<&Course> for CourseModel {
    fn from(course: &Course) -> Self {
        CourseModel {
            name: course.name().to_owned(),
            url: course.url().clone(),
            resources: course
                .list_all_resources()
                .map(ResourceModel::from)
                .collect(),
            latest: course
                .list_latest_resources()
                .map(|(key, _)| key.to_owned())
                .collect(),
        }
    }
}

impl From<(&str, &Resource)> for ResourceModel {
    fn from((key, resource): (&str, &Resource)) -> Self {
        ResourceModel {
            key: key.to_owned(),
            name: resource.name().to_owned(),
            kind: resource.kind(),
            section: resource.section().to_owned(),
            is_recent: resource.is_recent(),
            url: resource.url().clone(),
        }
    }
}
