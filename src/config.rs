//! Command line and environment configuration of the `bulk-load` binary.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{CommandFactory, Parser, error::ErrorKind};
use snafu::Snafu;

use crate::{
    adaptive_concurrency::LoaderSettings,
    loader::LoadTarget,
    store::{CollectionRef, cosmos::ConnectionPolicy},
};

/// Locations tried, in order, when no data directory is given.
pub const DEFAULT_DATA_DIRS: [&str; 2] = ["../data", "../../../data"];

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display(
        "Expected one collection for every file or four (actors featured genres movies), got {}",
        count
    ))]
    CollectionCount { count: usize },

    #[snafu(display("Can't find data files; tried {}", tried.join(", ")))]
    DataDirNotFound { tried: Vec<String> },
}

/// Load the IMDb sample data set into a Cosmos DB account.
#[derive(Debug, Parser)]
#[command(name = "bulk-load", version, about, long_about = None)]
pub struct Cli {
    /// Cosmos DB account name, or the full endpoint URL
    pub account: String,

    /// Account master key (base64)
    pub key: String,

    /// Database holding the collections
    pub database: String,

    /// One collection for every file, or four: actors featured genres movies
    #[arg(required = true, num_args = 1..)]
    pub collections: Vec<String>,

    /// Directory holding featured.json, genres.json, movies.json and actors.json
    #[arg(long, env = "BULK_LOAD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Initial number of concurrently loading batches (at least 3)
    #[arg(long, env = "BULK_LOAD_MAX_LOADERS", default_value_t = 6)]
    pub max_loaders: usize,

    /// Documents per batch
    #[arg(long, env = "BULK_LOAD_BATCH_SIZE", default_value_t = 25)]
    pub batch_size: usize,

    /// Successful upserts between two progress lines
    #[arg(long, env = "BULK_LOAD_PROGRESS_EVERY", default_value_t = 100)]
    pub progress_every: u64,

    /// JSON pointer of the partition key inside each document, e.g. /type
    #[arg(long, env = "BULK_LOAD_PARTITION_KEY")]
    pub partition_key: Option<String>,

    /// Timeout of a single request, in seconds
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    /// Throttled requests the client retries before the loader sees them
    #[arg(long, default_value_t = 10)]
    pub max_throttle_retries: usize,

    /// Cumulative wait the client spends on those retries, in seconds
    #[arg(long, default_value_t = 120)]
    pub max_retry_wait_secs: u64,

    /// Grow the concurrency window again after this many consecutive successes
    #[arg(long, env = "BULK_LOAD_RECOVER_AFTER")]
    pub recover_after: Option<u64>,

    /// Abort the run when a document is throttled more than this many times
    #[arg(long, env = "BULK_LOAD_MAX_DOCUMENT_RETRIES")]
    pub max_document_retries: Option<usize>,
}

/// Collection names per input file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionNames {
    pub actors: String,
    pub featured: String,
    pub genres: String,
    pub movies: String,
}

impl Cli {
    /// Parses the process arguments and exits with usage on invalid input.
    pub fn parse_args() -> Self {
        let cli = Self::parse();
        if let Err(error) = cli.collection_names() {
            Self::command()
                .error(ErrorKind::WrongNumberOfValues, error)
                .exit();
        }
        cli
    }

    pub fn collection_names(&self) -> Result<CollectionNames, ConfigError> {
        let names: Vec<&str> = self.collections.iter().map(|c| c.trim()).collect();
        match names.as_slice() {
            [shared] => Ok(CollectionNames {
                actors: shared.to_string(),
                featured: shared.to_string(),
                genres: shared.to_string(),
                movies: shared.to_string(),
            }),
            [actors, featured, genres, movies] => Ok(CollectionNames {
                actors: actors.to_string(),
                featured: featured.to_string(),
                genres: genres.to_string(),
                movies: movies.to_string(),
            }),
            other => CollectionCountSnafu { count: other.len() }.fail(),
        }
    }

    pub fn to_settings(&self) -> LoaderSettings {
        LoaderSettings::builder()
            .max_loaders(self.max_loaders)
            .batch_size(self.batch_size)
            .progress_every(self.progress_every)
            .maybe_recover_after(self.recover_after)
            .maybe_max_document_retries(self.max_document_retries)
            .max_retry_wait(Duration::from_secs(self.max_retry_wait_secs))
            .build()
    }

    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy::builder()
            .max_connections(self.to_settings().max_loaders() * 2)
            .request_timeout(Duration::from_secs(self.request_timeout_secs))
            .max_retry_attempts_on_throttle(self.max_throttle_retries)
            .max_retry_wait(Duration::from_secs(self.max_retry_wait_secs))
            .build()
    }

    /// The data directory given on the command line, or the first default that exists.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        DEFAULT_DATA_DIRS
            .iter()
            .map(Path::new)
            .find(|dir| dir.is_dir())
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::DataDirNotFound {
                tried: DEFAULT_DATA_DIRS.iter().map(|d| d.to_string()).collect(),
            })
    }

    /// Files to load, in load order: featured, genres, movies, actors.
    pub fn load_plan(&self) -> Result<Vec<LoadTarget>, ConfigError> {
        let names = self.collection_names()?;
        Ok(plan_for(&self.data_dir()?, self.database.trim(), &names))
    }
}

pub fn plan_for(data_dir: &Path, database: &str, names: &CollectionNames) -> Vec<LoadTarget> {
    [
        ("featured.json", &names.featured),
        ("genres.json", &names.genres),
        ("movies.json", &names.movies),
        ("actors.json", &names.actors),
    ]
    .into_iter()
    .map(|(file, collection)| {
        LoadTarget::new(data_dir.join(file), CollectionRef::new(database, collection))
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bulk-load").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn one_collection_is_shared_by_every_file() {
        let cli = parse(&["acct", "a2V5", "imdb", "movies"]);
        let names = cli.collection_names().unwrap();
        assert_eq!(names.actors, "movies");
        assert_eq!(names.featured, "movies");
        assert_eq!(names.genres, "movies");
        assert_eq!(names.movies, "movies");
    }

    #[test]
    fn four_collections_map_to_actors_featured_genres_movies() {
        let cli = parse(&["acct", "a2V5", "imdb", "a", "f", "g", "m"]);
        assert_eq!(
            cli.collection_names().unwrap(),
            CollectionNames {
                actors: "a".into(),
                featured: "f".into(),
                genres: "g".into(),
                movies: "m".into(),
            }
        );
    }

    #[test]
    fn other_collection_counts_are_rejected() {
        let cli = parse(&["acct", "a2V5", "imdb", "a", "b"]);
        assert!(matches!(
            cli.collection_names(),
            Err(ConfigError::CollectionCount { count: 2 })
        ));

        let missing = Cli::try_parse_from(["bulk-load", "acct", "a2V5", "imdb"]);
        assert!(missing.is_err());
    }

    #[test]
    fn load_order_is_featured_genres_movies_actors() {
        let names = CollectionNames {
            actors: "a".into(),
            featured: "f".into(),
            genres: "g".into(),
            movies: "m".into(),
        };
        let plan = plan_for(Path::new("/data"), "imdb", &names);
        let files: Vec<_> = plan
            .iter()
            .map(|t| t.path.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(
            files,
            vec!["featured.json", "genres.json", "movies.json", "actors.json"]
        );
        let collections: Vec<_> = plan.iter().map(|t| t.collection.collection()).collect();
        assert_eq!(collections, vec!["f", "g", "m", "a"]);
        assert!(plan.iter().all(|t| t.collection.database() == "imdb"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[
            "acct",
            "a2V5",
            "imdb",
            "movies",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]);
        let plan = cli.load_plan().unwrap();
        assert_eq!(plan[0].path, dir.path().join("featured.json"));
    }

    #[test]
    fn settings_and_policy_follow_the_flags() {
        let cli = parse(&[
            "acct",
            "a2V5",
            "imdb",
            "movies",
            "--max-loaders",
            "10",
            "--batch-size",
            "20",
            "--recover-after",
            "500",
            "--max-throttle-retries",
            "3",
        ]);
        let settings = cli.to_settings();
        assert_eq!(settings.max_loaders(), 10);
        assert_eq!(settings.floor(), 5);
        assert_eq!(settings.batch_size(), 20);
        assert_eq!(settings.recover_after(), Some(500));
        assert_eq!(settings.max_document_retries(), None);

        let policy = cli.connection_policy();
        assert_eq!(policy.max_connections(), 20);
        assert_eq!(policy.max_retry_attempts_on_throttle(), 3);
        assert_eq!(policy.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
