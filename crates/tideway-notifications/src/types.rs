use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NotificationError;

/// One outbound notification, addressed by template.
///
/// Rendering happens downstream; this side only names the template and
/// supplies the variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub template: String,
    pub recipient: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

fn default_locale() -> String {
    "en".to_string()
}

impl NotificationRequest {
    pub fn new(template: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            recipient: recipient.into(),
            locale: default_locale(),
            variables: BTreeMap::new(),
        }
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), NotificationError> {
        if self.template.trim().is_empty() {
            return Err(NotificationError::InvalidRequest("template is empty".into()));
        }
        if self.recipient.trim().is_empty() {
            return Err(NotificationError::InvalidRequest("recipient is empty".into()));
        }
        Ok(())
    }
}

/// Result of sending a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
}

impl SendResult {
    pub fn delivered(external_id: Option<String>) -> Self {
        Self {
            success: true,
            external_id,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(error.into()),
        }
    }
}
