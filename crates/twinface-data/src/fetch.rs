//! LFW archive download and extraction.
//!
//! Resolution order:
//! 1. `<data_dir>/<dataset_dir>` already exists: use it.
//! 2. `<data_dir>/<archive>` already downloaded: extract it.
//! 3. Download the archive, then extract it.
//!
//! Both the archive and the dataset directory appear only once complete: the
//! download goes through a `.part` file and extraction through a hidden
//! staging directory that is renamed into place.

use flate2::read::GzDecoder;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_DATASET_URL: &str = "http://vis-www.cs.umass.edu/lfw/lfw-deepfunneled.tgz";
pub const DEFAULT_DATASET_DIR: &str = "lfw-deepfunneled";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download failed for {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to extract {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive {archive} did not contain {expected}")]
    MissingAfterExtract { archive: PathBuf, expected: PathBuf },
    #[error("could not determine data directory")]
    NoDataDir,
}

/// Default location for downloaded datasets (`$XDG_DATA_HOME/twinface` on Linux).
pub fn default_data_dir() -> Result<PathBuf, FetchError> {
    dirs::data_dir()
        .map(|d| d.join("twinface"))
        .ok_or(FetchError::NoDataDir)
}

/// Make sure `<data_dir>/<dataset_dir>` exists, fetching `url` if needed.
pub fn ensure_dataset(data_dir: &Path, url: &str, dataset_dir: &str) -> Result<PathBuf, FetchError> {
    let target = data_dir.join(dataset_dir);
    if target.is_dir() {
        tracing::debug!(path = %target.display(), "dataset already present");
        return Ok(target);
    }

    fs::create_dir_all(data_dir).map_err(|source| FetchError::DataDir {
        path: data_dir.to_path_buf(),
        source,
    })?;

    let archive = data_dir.join(archive_name(url));
    if archive.is_file() {
        tracing::info!(archive = %archive.display(), "reusing downloaded archive");
    } else {
        tracing::info!(url, dest = %archive.display(), "downloading dataset");
        download(url, &archive)?;
    }

    let staging = data_dir.join(format!(".{dataset_dir}.extracting"));
    if let Err(e) = extract_into_place(&archive, &staging, dataset_dir, &target) {
        remove_staging(&staging);
        if matches!(e, FetchError::Extract { .. }) {
            // Drop a damaged archive so the next run downloads it again.
            tracing::warn!(archive = %archive.display(), error = %e, "removing unreadable archive");
            if let Err(err) = fs::remove_file(&archive) {
                tracing::warn!(archive = %archive.display(), error = %err, "could not remove archive");
            }
        }
        return Err(e);
    }
    remove_staging(&staging);

    tracing::info!(path = %target.display(), "dataset ready");
    Ok(target)
}

/// Unpack `archive` under `staging`, then move `<staging>/<dataset_dir>` to `target`.
fn extract_into_place(archive: &Path, staging: &Path, dataset_dir: &str, target: &Path) -> Result<(), FetchError> {
    remove_staging(staging);
    extract(archive, staging)?;

    let unpacked = staging.join(dataset_dir);
    if !unpacked.is_dir() {
        return Err(FetchError::MissingAfterExtract {
            archive: archive.to_path_buf(),
            expected: target.to_path_buf(),
        });
    }
    fs::rename(&unpacked, target).map_err(|source| FetchError::Write {
        path: target.to_path_buf(),
        source,
    })
}

fn remove_staging(staging: &Path) {
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(staging) {
            tracing::warn!(path = %staging.display(), error = %e, "could not remove staging directory");
        }
    }
}

/// Last path segment of `url`, used as the local archive file name.
fn archive_name(url: &str) -> &str {
    url.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("dataset.tgz")
}

fn download(url: &str, dest: &Path) -> Result<(), FetchError> {
    let download_err = |source| FetchError::Download {
        url: url.to_string(),
        source,
    };

    let mut response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(download_err)?;

    // Stream into a temp file, then rename, so a failed run leaves no archive.
    let temp_path = dest.with_extension("part");
    let write_err = |source| FetchError::Write {
        path: temp_path.clone(),
        source,
    };
    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    let bytes = match response.copy_to(&mut file) {
        Ok(bytes) => bytes,
        Err(source) => {
            drop(file);
            let _ = fs::remove_file(&temp_path);
            return Err(download_err(source));
        }
    };
    file.flush().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, dest).map_err(|source| FetchError::Write {
        path: dest.to_path_buf(),
        source,
    })?;

    tracing::info!(bytes, path = %dest.display(), "download complete");
    Ok(())
}

/// Unpack a gzip-compressed tarball into `dest`.
pub fn extract(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    let extract_err = |source| FetchError::Extract {
        path: archive.to_path_buf(),
        source,
    };

    tracing::info!(archive = %archive.display(), dest = %dest.display(), "extracting");
    let file = fs::File::open(archive).map_err(extract_err)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tarball.unpack(dest).map_err(extract_err)?;
    Ok(())
}
