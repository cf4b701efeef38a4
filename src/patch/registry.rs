//! Patch handler registry
//!
//! Describes, per entity type, where its cached collection and detail
//! records live and which field identifies a record. Built once at startup
//! and shared read-only.

use std::collections::HashMap;

use crate::cache::QueryKey;

/// Default identity field of a cached record
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// How to find cached copies of one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHandler {
    /// The cached collection for this entity type
    pub list_key: QueryKey,
    /// Detail keys are this prefix plus the entity id
    pub detail_prefix: QueryKey,
    /// Field matched against the entity id inside the collection
    pub identity_field: String,
}

impl PatchHandler {
    pub fn new(list_key: QueryKey, detail_prefix: QueryKey) -> Self {
        Self {
            list_key,
            detail_prefix,
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
        }
    }

    /// Conventional `[<resource>, "list"]` / `[<resource>, "detail", id]` layout
    pub fn for_resource(resource: &str) -> Self {
        Self::new(
            QueryKey::new([resource, "list"]),
            QueryKey::new([resource, "detail"]),
        )
    }

    pub fn with_identity_field(mut self, field: &str) -> Self {
        self.identity_field = field.to_string();
        self
    }

    /// Cached single-record view for `id`
    pub fn detail_key(&self, id: &str) -> QueryKey {
        self.detail_prefix.child(id)
    }
}

/// Collects handlers before the registry is frozen
#[derive(Debug, Default)]
pub struct PatchRegistryBuilder {
    handlers: HashMap<String, PatchHandler>,
}

impl PatchRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same type wins
    pub fn register(mut self, entity_type: &str, handler: PatchHandler) -> Self {
        self.handlers.insert(entity_type.to_string(), handler);
        self
    }

    pub fn build(self) -> PatchRegistry {
        PatchRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable entity-type → handler table
#[derive(Debug, Default, Clone)]
pub struct PatchRegistry {
    handlers: HashMap<String, PatchHandler>,
}

impl PatchRegistry {
    pub fn builder() -> PatchRegistryBuilder {
        PatchRegistryBuilder::new()
    }

    /// Handlers for the back-office entity types
    pub fn standard() -> Self {
        Self::builder()
            .register("act", PatchHandler::for_resource("acts"))
            .register("invoice", PatchHandler::for_resource("invoices"))
            .register("order", PatchHandler::for_resource("orders"))
            .register("project", PatchHandler::for_resource("projects"))
            .register("stage", PatchHandler::for_resource("stages"))
            .register("client", PatchHandler::for_resource("clients"))
            .register("material", PatchHandler::for_resource("materials"))
            .register("warehouse", PatchHandler::for_resource("warehouses"))
            .register("document", PatchHandler::for_resource("documents"))
            .register("attachment", PatchHandler::for_resource("attachments"))
            .register(
                "draft",
                PatchHandler::for_resource("drafts").with_identity_field("draftId"),
            )
            .register("user", PatchHandler::for_resource("users"))
            .register("worklog", PatchHandler::for_resource("worklogs"))
            .build()
    }

    /// A miss means no structured patch is possible
    pub fn lookup(&self, entity_type: &str) -> Option<&PatchHandler> {
        self.handlers.get(entity_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered entity types, sorted
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
