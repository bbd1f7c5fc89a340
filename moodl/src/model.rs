use std::error::Error;

use moodl_lib::DownloadOutcome;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Matches<'a> {
    pub pattern: &'a str,
    pub names: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct DownloadReport {
    pub name: String,
    pub ok: bool,
    pub error: Option<String>,
}

impl From<&DownloadOutcome> for DownloadReport {
    fn from(outcome: &DownloadOutcome) -> Self {
        DownloadReport {
            name: outcome.name.clone(),
            ok: outcome.is_ok(),
            error: outcome.result.as_ref().err().map(|err| error_chain(err)),
        }
    }
}

/// Joins an error with all of its sources, e.g. `failed to download `x`: refused`.
pub fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}
