//! Bulkport Common Library
//!
//! Shared wire types, logging setup and error handling for the Bulkport workspace.
//!
//! # Overview
//!
//! - **Keys**: composite job keys (`partition#sort`) and the prefixes that route them
//! - **Status**: the import job lifecycle enum
//! - **Notifications**: the envelope published on the status bus
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use bulkport_common::keys::{JobKey, JobKind};
//!
//! let key = JobKey::parse("CSV_IMPORT#acme#widgets#01J0000000").unwrap();
//! assert_eq!(key.kind(), Some(JobKind::CsvMaster));
//! assert_eq!(key.tenant(), "acme");
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod keys;
pub mod logging;
pub mod notification;
pub mod status;

pub use error::{CommonError, Result};
pub use keys::{JobKey, JobKind, KEY_SEPARATOR};
pub use notification::{Notification, NotificationAction, NotificationContent};
pub use status::ImportStatus;
