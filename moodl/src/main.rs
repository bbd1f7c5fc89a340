use clap::Parser;
use moodl_lib::{
    model::{CourseModel, ResourceModel},
    Course, DownloadOutcome,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::{
    download::FileDownloader,
    model::{error_chain, DownloadReport, Matches},
    options::{Command, DataFormat, Options},
};

mod download;
mod model;
mod options;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    let args = Options::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let session = moodl_lib::login(&args.username, &args.password)
        .await
        .ok_or(Error::LoginFailed)?;
    let course = Course::new(&session, &args.name, args.course_url.clone()).await?;
    tracing::info!(course = course.name(), resources = course.len(), "loaded course");

    match &args.command {
        Command::List { latest } => {
            let resources: Vec<_> = match *latest {
                true => course.list_latest_resources().collect(),
                false => course.list_all_resources().collect(),
            };
            match args.format {
                DataFormat::Text => {
                    for (key, resource) in resources {
                        println!("{key} ---- type: {}", resource.kind());
                    }
                }
                DataFormat::Json if *latest => print_json(
                    &resources
                        .into_iter()
                        .map(ResourceModel::from)
                        .collect::<Vec<_>>(),
                    args.pretty,
                )?,
                DataFormat::Json => print_json(&CourseModel::from(&course), args.pretty)?,
            }
        }
        Command::Match { pattern } => {
            let names = course.match_resource_names(pattern)?;
            match args.format {
                DataFormat::Text => names.iter().for_each(|name| println!("{name}")),
                DataFormat::Json => print_json(&Matches { pattern, names }, args.pretty)?,
            }
        }
        Command::Download {
            names,
            latest,
            dest,
            update,
        } => {
            let downloader = FileDownloader::new(&session);
            let outcomes = match *latest {
                true => {
                    course
                        .download_latest_resources(dest, *update, &downloader)
                        .await
                }
                false => {
                    let mut outcomes = Vec::with_capacity(names.len());
                    for name in names {
                        let result = course
                            .download_resource(name, dest, *update, &downloader)
                            .await;
                        outcomes.push(DownloadOutcome {
                            name: name.to_owned(),
                            result,
                        });
                    }
                    outcomes
                }
            };

            match args.format {
                DataFormat::Text => {
                    for outcome in &outcomes {
                        match &outcome.result {
                            Ok(()) => println!("{}: ok", outcome.name),
                            Err(err) => println!("{}: {}", outcome.name, error_chain(err)),
                        }
                    }
                }
                DataFormat::Json => print_json(
                    &outcomes.iter().map(DownloadReport::from).collect::<Vec<_>>(),
                    args.pretty,
                )?,
            }

            let failed = outcomes.iter().filter(|outcome| !outcome.is_ok()).count();
            if failed > 0 {
                return Err(Error::DownloadsFailed(failed));
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<(), Error> {
    let result = match pretty {
        true => serde_json::to_string_pretty(value)?,
        false => serde_json::to_string(value)?,
    };
    println!("{result}");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to log in, run with `-v` for details")]
    LoginFailed,
    #[error(transparent)]
    CourseError(#[from] moodl_lib::CourseError),
    #[error(transparent)]
    InvalidPattern(#[from] moodl_lib::PatternError),
    #[error(transparent)]
    JsonSerializeFailed(#[from] serde_json::Error),
    #[error("{0} resource(s) failed to download")]
    DownloadsFailed(usize),
}
