use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use moodl_lib::UpdatePolicy;
use url::Url;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Options {
    /// Course page to read (e.g. https://www.moodle.tum.de/course/view.php?id=12345)
    pub course_url: Url,
    /// TUM username used to log in
    #[arg(short, long, env = "MOODL_USERNAME")]
    pub username: String,
    /// Password used to log in
    #[arg(short, long, env = "MOODL_PASSWORD", hide_env_values = true)]
    pub password: String,
    /// Name to refer to the course by in logs and output
    #[arg(long, default_value = "course")]
    pub name: String,
    /// Format to output data
    #[arg(long, value_enum, default_value_t = DataFormat::Text)]
    pub format: DataFormat,
    /// Pretty print JSON output
    #[arg(long)]
    pub pretty: bool,
    /// Increase log verbosity (`RUST_LOG` takes precedence)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the resources of the course
    List {
        /// Only list resources of the current week
        #[arg(long)]
        latest: bool,
    },
    /// Print the resource names starting with a regular expression
    Match {
        /// Pattern matched against the beginning of each name
        pattern: String,
    },
    /// Download resources by name, or the ones of the current week
    Download {
        /// Names of the resources to download
        #[arg(required_unless_present = "latest")]
        names: Vec<String>,
        /// Download every resource of the current week
        #[arg(long, conflicts_with = "names")]
        latest: bool,
        /// Directory to save files in
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
        /// What to do when a file already exists: update, skip or replace
        #[arg(long, default_value_t = UpdatePolicy::Update)]
        update: UpdatePolicy,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataFormat {
    Text,
    Json,
}
