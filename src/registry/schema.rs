//! Registry schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Subscribers table schema.
#[derive(Iden)]
pub enum Subscribers {
    Table,
    #[iden = "username"]
    Username,
    #[iden = "role"]
    Role,
    #[iden = "channel_ref"]
    ChannelRef,
    #[iden = "auth_credential"]
    AuthCredential,
    #[iden = "agent_endpoint"]
    AgentEndpoint,
    #[iden = "created_at"]
    CreatedAt,
}

/// Subscriptions table schema.
#[derive(Iden)]
pub enum Subscriptions {
    Table,
    #[iden = "username"]
    Username,
    #[iden = "event_type"]
    EventType,
    #[iden = "command"]
    Command,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// ACL functions table schema.
#[derive(Iden)]
pub enum AclFunctions {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "reference"]
    Reference,
}

/// Event to ACL function mapping table schema.
#[derive(Iden)]
pub enum EventAclMapping {
    Table,
    #[iden = "event_type"]
    EventType,
    #[iden = "function_name"]
    FunctionName,
    #[iden = "position"]
    Position,
}

/// SQL for creating the subscribers table.
pub const CREATE_SUBSCRIBERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS subscribers (
    username TEXT PRIMARY KEY,
    role TEXT NOT NULL CHECK (role IN ('admin', 'user')),
    channel_ref TEXT NOT NULL UNIQUE,
    auth_credential TEXT NOT NULL,
    agent_endpoint TEXT,
    created_at TEXT NOT NULL
);
"#;

/// SQL for creating the subscriptions table.
pub const CREATE_SUBSCRIPTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    username TEXT NOT NULL,
    event_type TEXT NOT NULL,
    command TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (username, event_type),
    FOREIGN KEY (username) REFERENCES subscribers(username) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_event_type ON subscriptions(event_type);
"#;

/// SQL for creating the ACL functions table.
pub const CREATE_ACL_FUNCTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS acl_functions (
    name TEXT PRIMARY KEY,
    reference TEXT NOT NULL
);
"#;

/// SQL for creating the event to ACL function mapping table.
pub const CREATE_EVENT_ACL_MAPPING_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS event_acl_mapping (
    event_type TEXT NOT NULL,
    function_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (event_type, function_name),
    FOREIGN KEY (function_name) REFERENCES acl_functions(name) ON DELETE CASCADE
);
"#;
