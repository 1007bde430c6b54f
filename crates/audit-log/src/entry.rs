use serde::{Deserialize, Serialize};

/// A single audit log entry representing one relay lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub source: AuditSource,
    pub details: serde_json::Value,
}

impl AuditEntry {
    /// Create a new `AuditEntry` with an auto-generated UUID v4 and the current
    /// UTC timestamp. The caller supplies the event type, source, and
    /// free-form details JSON value.
    pub fn new(
        event_type: AuditEventType,
        source: AuditSource,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
        }
    }
}

/// The category of audit event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionEvicted,
    ProviderRegistered,
    ProviderSuperseded,
    ConsumerRegistered,
    AuthenticationFailed,
    ProcessStarted,
    ProcessStopped,
}

/// Identifies the component and optional connection metadata for the event
/// source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl AuditSource {
    /// Convenience constructor that only requires the component name.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            remote_addr: None,
            connection_id: None,
        }
    }

    /// Attach the connection this event concerns.
    pub fn with_connection(
        mut self,
        connection_id: impl ToString,
        remote_addr: impl ToString,
    ) -> Self {
        self.connection_id = Some(connection_id.to_string());
        self.remote_addr = Some(remote_addr.to_string());
        self
    }
}
