//! Capability gating.
//!
//! The assertion matrix: client-provided methods require the matching client
//! capability, server-provided methods require the server's own declaration,
//! and list-changed notifications require the corresponding `listChanged`
//! flag. Assertions run before anything reaches the transport.

use polymcp_protocol::types::{ClientCapabilities, ServerCapabilities};
use polymcp_protocol::{McpError, McpResult, Method};

/// Assert the client declared the capability a server→client method needs.
pub(crate) fn assert_client_capability(
    capabilities: Option<&ClientCapabilities>,
    method: &Method,
) -> McpResult<()> {
    let declared = match method {
        Method::SamplingCreateMessage => {
            capabilities.is_some_and(|caps| caps.sampling.is_some())
        }
        Method::RootsList => capabilities.is_some_and(|caps| caps.roots.is_some()),
        Method::ElicitationCreate => {
            capabilities.is_some_and(|caps| caps.elicitation.is_some())
        }
        _ => true,
    };
    if declared {
        Ok(())
    } else {
        Err(McpError::MissingCapability(method.as_str().to_string()))
    }
}

/// Assert this server declared the capability behind an outbound
/// notification or a server-provided method.
pub(crate) fn assert_server_capability(
    capabilities: &ServerCapabilities,
    method: &Method,
) -> McpResult<()> {
    if server_supports(capabilities, method) {
        Ok(())
    } else {
        Err(McpError::MissingCapability(method.as_str().to_string()))
    }
}

/// Non-asserting form of the server-side matrix, used by the notification
/// fan-out to skip rather than fail.
pub(crate) fn server_supports(capabilities: &ServerCapabilities, method: &Method) -> bool {
    match method {
        Method::ToolsList | Method::ToolsCall => capabilities.tools.is_some(),
        Method::NotificationToolsListChanged => capabilities
            .tools
            .as_ref()
            .is_some_and(|tools| tools.list_changed == Some(true)),
        Method::PromptsList | Method::PromptsGet => capabilities.prompts.is_some(),
        Method::NotificationPromptsListChanged => capabilities
            .prompts
            .as_ref()
            .is_some_and(|prompts| prompts.list_changed == Some(true)),
        Method::ResourcesList
        | Method::ResourcesTemplatesList
        | Method::ResourcesRead
        | Method::NotificationResourcesUpdated => capabilities.resources.is_some(),
        Method::ResourcesSubscribe | Method::ResourcesUnsubscribe => capabilities
            .resources
            .as_ref()
            .is_some_and(|resources| resources.subscribe == Some(true)),
        Method::NotificationResourcesListChanged => capabilities
            .resources
            .as_ref()
            .is_some_and(|resources| resources.list_changed == Some(true)),
        Method::LoggingSetLevel | Method::NotificationMessage => capabilities.logging.is_some(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_side_matrix() {
        let none: Option<&ClientCapabilities> = None;
        assert!(assert_client_capability(none, &Method::SamplingCreateMessage).is_err());

        let mut caps = ClientCapabilities::default();
        assert!(assert_client_capability(Some(&caps), &Method::RootsList).is_err());
        caps.roots = Some(Default::default());
        assert!(assert_client_capability(Some(&caps), &Method::RootsList).is_ok());
        // Ping needs nothing.
        assert!(assert_client_capability(Some(&caps), &Method::Ping).is_ok());
    }

    #[test]
    fn server_side_matrix() {
        let caps = ServerCapabilities::default();
        assert!(assert_server_capability(&caps, &Method::ToolsList).is_err());
        assert!(assert_server_capability(&caps, &Method::LoggingSetLevel).is_err());

        let caps = ServerCapabilities::default()
            .with_tools(false)
            .with_resources(true, true)
            .with_logging();
        assert!(assert_server_capability(&caps, &Method::ToolsCall).is_ok());
        // listChanged flag declared false: notification not allowed.
        assert!(assert_server_capability(&caps, &Method::NotificationToolsListChanged).is_err());
        assert!(assert_server_capability(&caps, &Method::ResourcesSubscribe).is_ok());
        assert!(
            assert_server_capability(&caps, &Method::NotificationResourcesListChanged).is_ok()
        );
        assert!(assert_server_capability(&caps, &Method::NotificationMessage).is_ok());
    }

    #[test]
    fn subscribe_needs_the_subscribe_flag() {
        let caps = ServerCapabilities::default().with_resources(false, true);
        assert!(assert_server_capability(&caps, &Method::ResourcesRead).is_ok());
        assert!(assert_server_capability(&caps, &Method::ResourcesSubscribe).is_err());
    }
}
