//! Messages published on the notification bus

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::keys::JobKey;
use crate::status::ImportStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationAction {
    /// A job moved to a new status
    #[serde(rename = "import-status")]
    ImportStatus,
    /// A job failed in a way operators should look at
    #[serde(rename = "alarm")]
    Alarm,
    /// A downstream command sink settled a write it accepted earlier
    #[serde(rename = "command-status")]
    CommandStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Job id that issued the command, only set on `command-status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// `{action, partitionKey, sortKey, tenant, content}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub action: NotificationAction,
    pub partition_key: String,
    pub sort_key: String,
    pub tenant: String,
    pub content: NotificationContent,
}

impl Notification {
    /// Status change event. Failed jobs carry their result under `error`.
    pub fn status_changed(key: &JobKey, status: ImportStatus, result: Option<Value>) -> Self {
        let (result, error) = match status {
            ImportStatus::Failed => (None, result),
            _ => (result, None),
        };

        Self {
            action: NotificationAction::ImportStatus,
            partition_key: key.partition_key.clone(),
            sort_key: key.sort_key.clone(),
            tenant: key.tenant().to_string(),
            content: NotificationContent {
                status: Some(status.to_string()),
                result,
                error,
                source: None,
            },
        }
    }

    pub fn alarm(key: &JobKey, error: Value) -> Self {
        Self {
            action: NotificationAction::Alarm,
            partition_key: key.partition_key.clone(),
            sort_key: key.sort_key.clone(),
            tenant: key.tenant().to_string(),
            content: NotificationContent {
                error: Some(error),
                ..Default::default()
            },
        }
    }

    /// Settlement of a command that was issued on behalf of `source`
    pub fn command_status(command: &JobKey, source: &JobKey, status: impl Into<String>) -> Self {
        Self {
            action: NotificationAction::CommandStatus,
            partition_key: command.partition_key.clone(),
            sort_key: command.sort_key.clone(),
            tenant: command.tenant().to_string(),
            content: NotificationContent {
                status: Some(status.into()),
                source: Some(source.id()),
                ..Default::default()
            },
        }
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.partition_key.clone(), self.sort_key.clone())
    }

    /// Parsed import status, `None` for other actions or unknown values
    pub fn import_status(&self) -> Option<ImportStatus> {
        if self.action != NotificationAction::ImportStatus {
            return None;
        }
        self.content.status.as_deref()?.parse().ok()
    }
}
