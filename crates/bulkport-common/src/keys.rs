//! Composite job keys
//!
//! Every import job is addressed by a partition key (`{PREFIX}#{tenant}`) and a sort key.
//! The string form of a key is `partition#sort`. Child jobs embed their parent's full key
//! in their own sort key, followed by the child id, so the parent of any child can be
//! recovered by dropping the last `#` segment:
//!
//! ```text
//! CSV_IMPORT#acme | widgets#01J...A                   master
//! IMPORT#acme     | CSV_IMPORT#acme#widgets#01J...A#01J...B   child row
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CommonError, Result};

/// Separator between key segments
pub const KEY_SEPARATOR: char = '#';

/// Which handler owns a job, derived from its partition prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A single record reconciled against the target system
    Record,
    /// A CSV file fanned out into record jobs
    CsvMaster,
    /// A ZIP archive fanned out into sequential CSV masters
    ZipMaster,
}

impl JobKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            JobKind::Record => "IMPORT",
            JobKind::CsvMaster => "CSV_IMPORT",
            JobKind::ZipMaster => "ZIP_IMPORT",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "IMPORT" => Some(JobKind::Record),
            "CSV_IMPORT" => Some(JobKind::CsvMaster),
            "ZIP_IMPORT" => Some(JobKind::ZipMaster),
            _ => None,
        }
    }

    /// Partition key for this kind of job owned by `tenant`
    pub fn partition_key(self, tenant: &str) -> String {
        format!("{}{KEY_SEPARATOR}{tenant}", self.prefix())
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Partition + sort key of a job record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl JobKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }

    /// Parse the `partition#sort` string form.
    ///
    /// The partition key is the first two segments, the sort key is everything after.
    pub fn parse(id: &str) -> Result<Self> {
        let mut parts = id.splitn(3, KEY_SEPARATOR);
        let (Some(prefix), Some(tenant), Some(sort_key)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CommonError::InvalidKey(id.to_string()));
        };

        if prefix.is_empty() || tenant.is_empty() || sort_key.is_empty() {
            return Err(CommonError::InvalidKey(id.to_string()));
        }

        Ok(Self::new(format!("{prefix}{KEY_SEPARATOR}{tenant}"), sort_key))
    }

    /// String form, `partition#sort`
    pub fn id(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.partition_key, self.sort_key)
    }

    pub fn kind(&self) -> Option<JobKind> {
        self.partition_key
            .split(KEY_SEPARATOR)
            .next()
            .and_then(JobKind::from_prefix)
    }

    /// Tenant code, the partition key segment after the prefix
    pub fn tenant(&self) -> &str {
        self.partition_key
            .split_once(KEY_SEPARATOR)
            .map(|(_, tenant)| tenant)
            .unwrap_or_default()
    }

    /// Parent job derived from the sort key, if this key was built as a child key.
    pub fn parent(&self) -> Option<JobKey> {
        let (head, _) = self.sort_key.rsplit_once(KEY_SEPARATOR)?;
        JobKey::parse(head).ok().filter(|parent| parent.kind().is_some())
    }

    /// Sort key for a child of this job
    pub fn child_sort_key(&self, child_id: &str) -> String {
        format!("{}{KEY_SEPARATOR}{child_id}", self.id())
    }

    /// Key id with every character outside `[A-Za-z0-9]` replaced by `_`,
    /// safe for use as an object store path segment.
    pub fn sanitized_id(&self) -> String {
        self.id()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.partition_key, self.sort_key)
    }
}

impl FromStr for JobKey {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        JobKey::parse(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_partition_and_sort() {
        let key = JobKey::parse("CSV_IMPORT#acme#widgets#01J").unwrap();
        assert_eq!(key.partition_key, "CSV_IMPORT#acme");
        assert_eq!(key.sort_key, "widgets#01J");
        assert_eq!(key.kind(), Some(JobKind::CsvMaster));
        assert_eq!(key.tenant(), "acme");
        assert_eq!(key.id(), "CSV_IMPORT#acme#widgets#01J");
    }

    #[test]
    fn test_parse_rejects_short_ids() {
        assert!(JobKey::parse("IMPORT#acme").is_err());
        assert!(JobKey::parse("IMPORT##x").is_err());
        assert!("".parse::<JobKey>().is_err());
    }

    #[test]
    fn test_parent_is_recovered_from_sort_key() {
        let master = JobKey::parse("CSV_IMPORT#acme#widgets#01J").unwrap();
        let child = JobKey::new(
            JobKind::Record.partition_key("acme"),
            master.child_sort_key("01K"),
        );

        assert_eq!(child.sort_key, "CSV_IMPORT#acme#widgets#01J#01K");
        assert_eq!(child.parent(), Some(master));
    }

    #[test]
    fn test_top_level_job_has_no_parent() {
        let key = JobKey::new("IMPORT#acme", "widgets#01K");
        assert_eq!(key.parent(), None);

        let master = JobKey::new("ZIP_IMPORT#acme", "ZIP#01J");
        assert_eq!(master.parent(), None);
    }

    #[test]
    fn test_sanitized_id() {
        let key = JobKey::new("ZIP_IMPORT#acme", "ZIP#01J-x");
        assert_eq!(key.sanitized_id(), "ZIP_IMPORT_acme_ZIP_01J_x");
    }

    #[test]
    fn test_unknown_prefix_has_no_kind() {
        let key = JobKey::new("OTHER#acme", "x");
        assert_eq!(key.kind(), None);
    }
}
