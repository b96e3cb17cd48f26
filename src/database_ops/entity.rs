use serde::Serialize;

/// Added to legacy ids of direct-message topics and posts so they share the
/// numeric id space with public content without colliding.
pub const PRIVATE_OFFSET: i64 = 1 << 30;

/// System user that owns rows whose author is unknown.
pub const SYSTEM_USER_ID: i64 = -1;

/// Custom-field name used for durable import references.
pub const IMPORT_ID_FIELD: &str = "import_id";

/// Side table for entities without a custom-fields table.
pub const IMPORT_REFERENCES_TABLE: &str = "import_references";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Group,
    User,
    Category,
    Topic,
    Post,
    Tag,
    Upload,
    Badge,
    Notification,
    PostAction,
}

/// Where an entity's import references are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportRefStore {
    CustomField {
        table: &'static str,
        fk: &'static str,
    },
    SideTable,
}

impl Entity {
    pub const ALL: [Entity; 10] = [
        Entity::Group,
        Entity::User,
        Entity::Category,
        Entity::Topic,
        Entity::Post,
        Entity::Tag,
        Entity::Upload,
        Entity::Badge,
        Entity::Notification,
        Entity::PostAction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Group => "group",
            Entity::User => "user",
            Entity::Category => "category",
            Entity::Topic => "topic",
            Entity::Post => "post",
            Entity::Tag => "tag",
            Entity::Upload => "upload",
            Entity::Badge => "badge",
            Entity::Notification => "notification",
            Entity::PostAction => "post_action",
        }
    }

    /// Destination table holding the entity's rows.
    pub fn table(self) -> &'static str {
        match self {
            Entity::Group => "groups",
            Entity::User => "users",
            Entity::Category => "categories",
            Entity::Topic => "topics",
            Entity::Post => "posts",
            Entity::Tag => "tags",
            Entity::Upload => "uploads",
            Entity::Badge => "badges",
            Entity::Notification => "notifications",
            Entity::PostAction => "post_actions",
        }
    }

    pub fn import_ref_store(self) -> ImportRefStore {
        match self {
            Entity::Group => ImportRefStore::CustomField {
                table: "group_custom_fields",
                fk: "group_id",
            },
            Entity::User => ImportRefStore::CustomField {
                table: "user_custom_fields",
                fk: "user_id",
            },
            Entity::Category => ImportRefStore::CustomField {
                table: "category_custom_fields",
                fk: "category_id",
            },
            Entity::Topic => ImportRefStore::CustomField {
                table: "topic_custom_fields",
                fk: "topic_id",
            },
            Entity::Post => ImportRefStore::CustomField {
                table: "post_custom_fields",
                fk: "post_id",
            },
            Entity::Tag
            | Entity::Upload
            | Entity::Badge
            | Entity::Notification
            | Entity::PostAction => ImportRefStore::SideTable,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRange {
    Public,
    Private,
}

impl IdRange {
    pub fn of(legacy_id: i64) -> Self {
        if legacy_id >= PRIVATE_OFFSET {
            IdRange::Private
        } else {
            IdRange::Public
        }
    }
}

/// Pairing of a destination row with the legacy id it was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRef {
    pub entity: Entity,
    pub legacy_id: i64,
    pub new_id: i64,
}

impl ImportRef {
    pub fn new(entity: Entity, legacy_id: i64, new_id: i64) -> Self {
        Self {
            entity,
            legacy_id,
            new_id,
        }
    }
}
