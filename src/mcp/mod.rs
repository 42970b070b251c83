pub mod connection;
pub mod factory;
pub mod oauth;
pub mod protocol;
pub mod targets;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

/// Separates the service name from the tool name in the merged catalog.
pub const TOOL_NAMESPACE_DELIMITER: &str = "__";
