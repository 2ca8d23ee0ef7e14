//! CSV exchange file shared between the scraper and the importer.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ScrapedStory;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange file {0} not found")]
    Missing(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Overwrites `path` with a `title,url` CSV. Returns the number of rows written.
pub fn write_exchange_file(path: &Path, stories: &[ScrapedStory]) -> Result<usize, ExchangeError> {
    let csv_err = |source| ExchangeError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for story in stories {
        writer.serialize(story).map_err(csv_err)?;
    }
    if stories.is_empty() {
        writer.write_record(["title", "url"]).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| ExchangeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(stories.len())
}

/// Rows with a missing column deserialize as empty strings.
pub fn read_exchange_file(path: &Path) -> Result<Vec<ScrapedStory>, ExchangeError> {
    let file = File::open(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ExchangeError::Missing(path.to_path_buf())
        } else {
            ExchangeError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    reader
        .deserialize::<ScrapedStory>()
        .map(|row| {
            row.map_err(|source| ExchangeError::Csv {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}
