//! ZIP extraction
//!
//! The whole archive is downloaded into memory before it is opened; archives are
//! expected to be small enough for that. Every regular `.csv` member (extension
//! matched case-insensitively) is decompressed and written back to the object store
//! under `{prefix}/{tenant}/{sanitized job id}/{member path}`.

use bulkport_common::JobKey;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use zip::ZipArchive;

use crate::error::{ImportError, ImportResult};
use crate::storage::ObjectStore;

/// Decompressed CSV member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvMember {
    pub name: String,
    pub data: Vec<u8>,
}

fn is_csv(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".csv")
}

/// Decompress every regular CSV member of `data`
pub fn csv_members(data: &[u8]) -> ImportResult<Vec<CsvMember>> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut members = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        if file.is_dir() {
            continue;
        }

        // Rejects absolute paths and `..` components
        let Some(path) = file.enclosed_name() else {
            debug!(name = %file.name(), "Skipping member with unsafe path");
            continue;
        };
        let name = path.to_string_lossy().replace('\\', "/");

        if !is_csv(&name) {
            debug!(name = %name, "Skipping non-CSV member");
            continue;
        }

        let mut contents = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut contents)?;

        debug!(name = %name, size = contents.len(), "Extracted CSV member");
        members.push(CsvMember {
            name,
            data: contents,
        });
    }

    Ok(members)
}

#[derive(Clone)]
pub struct ZipExtractor {
    objects: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ZipExtractor {
    pub fn new(objects: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            objects,
            prefix: prefix.into(),
        }
    }

    /// Object key an extracted member is uploaded to
    pub fn key_for(&self, job_key: &JobKey, member: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            job_key.tenant(),
            job_key.sanitized_id(),
            member
        )
    }

    /// Extract and upload the CSV members of `archive_key`.
    ///
    /// Returns the uploaded keys sorted lexicographically. An archive without CSV
    /// members is [`ImportError::EmptyArchive`].
    #[instrument(skip(self), fields(job_key = %job_key))]
    pub async fn extract(&self, archive_key: &str, job_key: &JobKey) -> ImportResult<Vec<String>> {
        let data = self.objects.get(archive_key).await?;
        debug!(size = data.len(), "Downloaded archive");

        let members = tokio::task::spawn_blocking(move || csv_members(&data))
            .await
            .map_err(|e| ImportError::Io(std::io::Error::other(e)))??;

        if members.is_empty() {
            return Err(ImportError::EmptyArchive);
        }

        let mut keys = Vec::with_capacity(members.len());
        for member in members {
            let key = self.key_for(job_key, &member.name);
            self.objects.put(&key, member.data, Some("text/csv")).await?;
            keys.push(key);
        }
        keys.sort();

        info!(files = keys.len(), "Extracted CSV files from archive");
        Ok(keys)
    }
}
