//! The MCP method catalog.
//!
//! Known methods are enumerated; anything else is carried through as
//! [`Method::Custom`] rather than failing, so embedders can extend the
//! protocol without touching this crate.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A JSON-RPC method name: a known MCP method or a custom string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// `initialize`
    Initialize,
    /// `ping`
    Ping,
    /// `tools/list`
    ToolsList,
    /// `tools/call`
    ToolsCall,
    /// `prompts/list`
    PromptsList,
    /// `prompts/get`
    PromptsGet,
    /// `resources/list`
    ResourcesList,
    /// `resources/templates/list`
    ResourcesTemplatesList,
    /// `resources/read`
    ResourcesRead,
    /// `resources/subscribe`
    ResourcesSubscribe,
    /// `resources/unsubscribe`
    ResourcesUnsubscribe,
    /// `logging/setLevel`
    LoggingSetLevel,
    /// `sampling/createMessage`
    SamplingCreateMessage,
    /// `roots/list`
    RootsList,
    /// `elicitation/create`
    ElicitationCreate,
    /// `notifications/initialized`
    NotificationInitialized,
    /// `notifications/cancelled`
    NotificationCancelled,
    /// `notifications/progress`
    NotificationProgress,
    /// `notifications/message`
    NotificationMessage,
    /// `notifications/resources/updated`
    NotificationResourcesUpdated,
    /// `notifications/resources/list_changed`
    NotificationResourcesListChanged,
    /// `notifications/tools/list_changed`
    NotificationToolsListChanged,
    /// `notifications/prompts/list_changed`
    NotificationPromptsListChanged,
    /// `notifications/roots/list_changed`
    NotificationRootsListChanged,
    /// Any method not in the catalog
    Custom(String),
}

impl Method {
    /// The wire name of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialize => "initialize",
            Self::Ping => "ping",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::PromptsList => "prompts/list",
            Self::PromptsGet => "prompts/get",
            Self::ResourcesList => "resources/list",
            Self::ResourcesTemplatesList => "resources/templates/list",
            Self::ResourcesRead => "resources/read",
            Self::ResourcesSubscribe => "resources/subscribe",
            Self::ResourcesUnsubscribe => "resources/unsubscribe",
            Self::LoggingSetLevel => "logging/setLevel",
            Self::SamplingCreateMessage => "sampling/createMessage",
            Self::RootsList => "roots/list",
            Self::ElicitationCreate => "elicitation/create",
            Self::NotificationInitialized => "notifications/initialized",
            Self::NotificationCancelled => "notifications/cancelled",
            Self::NotificationProgress => "notifications/progress",
            Self::NotificationMessage => "notifications/message",
            Self::NotificationResourcesUpdated => "notifications/resources/updated",
            Self::NotificationResourcesListChanged => "notifications/resources/list_changed",
            Self::NotificationToolsListChanged => "notifications/tools/list_changed",
            Self::NotificationPromptsListChanged => "notifications/prompts/list_changed",
            Self::NotificationRootsListChanged => "notifications/roots/list_changed",
            Self::Custom(name) => name,
        }
    }

    /// True for `notifications/*` methods.
    pub fn is_notification(&self) -> bool {
        self.as_str().starts_with("notifications/")
    }
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        match name {
            "initialize" => Self::Initialize,
            "ping" => Self::Ping,
            "tools/list" => Self::ToolsList,
            "tools/call" => Self::ToolsCall,
            "prompts/list" => Self::PromptsList,
            "prompts/get" => Self::PromptsGet,
            "resources/list" => Self::ResourcesList,
            "resources/templates/list" => Self::ResourcesTemplatesList,
            "resources/read" => Self::ResourcesRead,
            "resources/subscribe" => Self::ResourcesSubscribe,
            "resources/unsubscribe" => Self::ResourcesUnsubscribe,
            "logging/setLevel" => Self::LoggingSetLevel,
            "sampling/createMessage" => Self::SamplingCreateMessage,
            "roots/list" => Self::RootsList,
            "elicitation/create" => Self::ElicitationCreate,
            "notifications/initialized" => Self::NotificationInitialized,
            "notifications/cancelled" => Self::NotificationCancelled,
            "notifications/progress" => Self::NotificationProgress,
            "notifications/message" => Self::NotificationMessage,
            "notifications/resources/updated" => Self::NotificationResourcesUpdated,
            "notifications/resources/list_changed" => Self::NotificationResourcesListChanged,
            "notifications/tools/list_changed" => Self::NotificationToolsListChanged,
            "notifications/prompts/list_changed" => Self::NotificationPromptsListChanged,
            "notifications/roots/list_changed" => Self::NotificationRootsListChanged,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for Method {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Method {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_roundtrip() {
        for name in [
            "initialize",
            "tools/call",
            "resources/templates/list",
            "notifications/resources/updated",
        ] {
            let method = Method::from(name);
            assert!(!matches!(method, Method::Custom(_)), "{name} should be known");
            assert_eq!(method.as_str(), name);
        }
    }

    #[test]
    fn unknown_methods_become_custom() {
        let method = Method::from("x/experimental");
        assert_eq!(method, Method::Custom("x/experimental".to_string()));
        assert_eq!(method.as_str(), "x/experimental");
    }

    #[test]
    fn notification_detection() {
        assert!(Method::NotificationCancelled.is_notification());
        assert!(!Method::ToolsCall.is_notification());
        assert!(Method::from("notifications/custom").is_notification());
    }

    #[test]
    fn serde_as_plain_string() {
        let json = serde_json::to_string(&Method::ToolsList).unwrap();
        assert_eq!(json, "\"tools/list\"");
        let back: Method = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Method::ToolsList);
    }
}
