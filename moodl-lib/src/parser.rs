use html_escape::decode_html_entities;
use thiserror::Error;
use tl::{HTMLTag, NodeHandle, ParserOptions, VDom};
use url::Url;

use crate::resource::{Resource, ResourceType};

// Lists holding the sections of a course, depending on the course format.
const WEEKS_SELECTOR: &str = ".weeks";
const TOPICS_SELECTOR: &str = ".topics";
const SECTION_SELECTOR: &str = ".section";
// Tells the section items apart from the activity lists, which also carry `section`.
const SECTION_CLASS: &str = "main";
// Marks the section of the current week.
const CURRENT_CLASS: &str = "current";
const SECTION_NAME_SELECTOR: &str = ".sectionname";
const ACTIVITY_SELECTOR: &str = ".activityinstance";
const INSTANCE_NAME_SELECTOR: &str = ".instancename";
// Screen reader suffix appended to activity names (e.g. " File").
const ACCESS_HIDE_SELECTOR: &str = ".accesshide";
// Labels and text blocks that may embed links.
const CONTENT_WITHOUT_LINK_SELECTOR: &str = ".contentwithoutlink";
// Files uploaded to Moodle are all served through this script.
const ATTACHMENT_PATH: &str = "/pluginfile.php/";

/// A parsed HTML document.
///
/// Nodes are passed around as [`NodeHandle`]s, which are only meaningful for the document they
/// were obtained from.
pub(crate) struct Html<'a> {
    dom: VDom<'a>,
}

impl<'a> Html<'a> {
    pub fn parse(input: &'a str) -> Result<Self, ParseError> {
        Ok(Self {
            dom: tl::parse(input, ParserOptions::default())?,
        })
    }

    /// All elements matching `selector`, in document order.
    pub fn select(&self, selector: &str) -> impl Iterator<Item = NodeHandle> {
        self.dom
            .query_selector(selector)
            .map(|iter| iter.collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
    }

    /// Descendants of `node` matching `selector`, in document order.
    pub fn select_within(
        &self,
        node: NodeHandle,
        selector: &str,
    ) -> impl Iterator<Item = NodeHandle> {
        self.tag(node)
            .and_then(|tag| tag.query_selector(self.dom.parser(), selector))
            .map(|iter| iter.collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
    }

    /// Value of the attribute `name`, with character references resolved.
    ///
    /// Attributes without a value (e.g. `<input disabled>`) are treated as missing.
    pub fn attribute(&self, node: NodeHandle, name: &'static str) -> Option<String> {
        let value = self.tag(node)?.attributes().get(name)??;
        Some(decode_html_entities(&value.as_utf8_str()).into_owned())
    }

    pub fn has_class(&self, node: NodeHandle, class: &str) -> bool {
        self.attribute(node, "class").map_or(false, |classes| {
            classes.split_whitespace().any(|name| name == class)
        })
    }

    /// Trimmed text content of `node` and all of its descendants.
    pub fn text(&self, node: NodeHandle) -> String {
        self.tag(node)
            .map(|tag| {
                // tl leaves character references untouched.
                decode_html_entities(tag.inner_text(self.dom.parser()).trim())
                    .trim()
                    .to_owned()
            })
            .unwrap_or_default()
    }

    fn tag(&self, node: NodeHandle) -> Option<&HTMLTag<'a>> {
        // Handles are obtained from this DOM, so the lookup only fails for foreign handles.
        node.get(self.dom.parser())?.as_tag()
    }
}

/// Parses a course page into its resources, in page order.
///
/// Relative links are resolved against `page_url`. Names are not yet disambiguated, that is
/// done when inserting into a [`Course`](crate::Course).
pub(crate) fn parse_course_page(page_url: &Url, html: &str) -> Result<Vec<Resource>, ParseError> {
    let html = Html::parse(html)?;
    let (sections, current) = extract_sections(&html);
    tracing::debug!(
        sections = sections.len(),
        has_current = current.is_some(),
        "found course sections"
    );

    let mut resources = Vec::new();
    for section in sections {
        let label = extract_section_label(&html, section)?;
        let is_recent = current.map_or(false, |current| same_node(current, section));

        for activity in html.select_within(section, ACTIVITY_SELECTOR) {
            match extract_activity(&html, activity, page_url, &label, is_recent)? {
                Some(resource) => resources.push(resource),
                None => tracing::debug!(section = %label, "skipping activity without a link"),
            }
        }
        for container in html.select_within(section, CONTENT_WITHOUT_LINK_SELECTOR) {
            resources.extend(extract_embedded_links(
                &html, container, page_url, &label, is_recent,
            )?);
        }
    }

    Ok(resources)
}

/// Sections of the page in order, along with the section marked current, if any.
///
/// Courses are organized by weeks, by topics, or rarely both. Only the weeks layout marks a
/// section as current; it is appended to the list if it wasn't already part of it.
fn extract_sections(html: &Html) -> (Vec<NodeHandle>, Option<NodeHandle>) {
    let mut sections = Vec::new();
    let mut current = None;

    if let Some(weeks) = html.select(WEEKS_SELECTOR).next() {
        sections.extend(
            html.select_within(weeks, SECTION_SELECTOR)
                .filter(|&section| html.has_class(section, SECTION_CLASS)),
        );
        current = html
            .select_within(weeks, SECTION_SELECTOR)
            .find(|&section| html.has_class(section, CURRENT_CLASS));
        if let Some(current) = current {
            if !sections.iter().any(|&section| same_node(section, current)) {
                sections.push(current);
            }
        }
    }

    if let Some(topics) = html.select(TOPICS_SELECTOR).next() {
        sections.extend(
            html.select_within(topics, SECTION_SELECTOR)
                .filter(|&section| html.has_class(section, SECTION_CLASS)),
        );
    }

    (sections, current)
}

fn extract_section_label(html: &Html, section: NodeHandle) -> Result<String, ParseError> {
    let heading = html
        .select_within(section, SECTION_NAME_SELECTOR)
        .next()
        .ok_or(ParseError::MissingTag("section heading"))?;
    let span = html
        .select_within(heading, "span")
        .next()
        .ok_or(ParseError::MissingTag("section heading label"))?;
    Ok(html.text(span))
}

fn extract_activity(
    html: &Html,
    activity: NodeHandle,
    page_url: &Url,
    section: &str,
    is_recent: bool,
) -> Result<Option<Resource>, ParseError> {
    // Restricted activities are rendered without a link.
    let Some(anchor) = html.select_within(activity, "a").next() else {
        return Ok(None);
    };
    let Some(href) = html.attribute(anchor, "href") else {
        return Ok(None);
    };
    let url = page_url.join(&href).map_err(|_| ParseError::InvalidLink(href))?;

    let name = match html.select_within(anchor, INSTANCE_NAME_SELECTOR).next() {
        Some(instance_name) => {
            let mut name = html.text(instance_name);
            for hidden in html.select_within(instance_name, ACCESS_HIDE_SELECTOR) {
                let hidden = html.text(hidden);
                if !hidden.is_empty() {
                    if let Some(stripped) = name.strip_suffix(hidden.as_str()) {
                        name = stripped.trim_end().to_owned();
                    }
                }
            }
            name
        }
        None => html.text(anchor),
    };

    Ok(Some(Resource::new(
        name,
        ResourceType::from_activity_url(&url),
        section.to_owned(),
        is_recent,
        url,
    )))
}

fn extract_embedded_links(
    html: &Html,
    container: NodeHandle,
    page_url: &Url,
    section: &str,
    is_recent: bool,
) -> Result<Vec<Resource>, ParseError> {
    let mut resources = Vec::new();
    for anchor in html.select_within(container, "a") {
        let Some(href) = html.attribute(anchor, "href") else {
            continue;
        };
        let url = page_url.join(&href).map_err(|_| ParseError::InvalidLink(href))?;
        resources.push(Resource::new(
            html.text(anchor),
            ResourceType::from_embedded_url(&url, page_url),
            section.to_owned(),
            is_recent,
            url,
        ));
    }
    Ok(resources)
}

/// Links to the files attached to an activity page (e.g. the sheets of an assignment), in page
/// order and without duplicates.
///
/// Relative links are resolved against `page_url`.
pub fn parse_attachment_links(page_url: &Url, html: &str) -> Result<Vec<Url>, ParseError> {
    let html = Html::parse(html)?;
    let mut links: Vec<Url> = Vec::new();
    for anchor in html.select("a") {
        let Some(href) = html.attribute(anchor, "href") else {
            continue;
        };
        let url = page_url.join(&href).map_err(|_| ParseError::InvalidLink(href))?;
        if url.path().contains(ATTACHMENT_PATH) && !links.contains(&url) {
            links.push(url);
        }
    }
    Ok(links)
}

fn same_node(a: NodeHandle, b: NodeHandle) -> bool {
    a.get_inner() == b.get_inner()
}

/// Represents errors that can occur while parsing a course page.
#[derive(Debug, Error)]
pub enum ParseError {
    /// HTML is not valid Utf-8.
    #[error("could not parse HTML due to invalid Utf-8 encoding")]
    HtmlInvalidUtf8(#[from] std::str::Utf8Error),
    /// HTML is not in a valid format.
    #[error("could not parse HTML due to invalid format")]
    InvalidHtmlFormat(#[from] tl::errors::ParseError),
    /// An element every page of this kind has is missing.
    /// The most likely cause of this issue is the website being updated. Please leave an issue on
    /// GitHub if this error occurs.
    #[error("could not find the {0} in HTML")]
    MissingTag(&'static str),
    /// A resource links somewhere that isn't a valid URL.
    #[error("could not resolve resource link `{0}`")]
    InvalidLink(String),
}
