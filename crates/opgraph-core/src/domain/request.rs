//! Store requests - 取得・保存リクエストのモデル
//!
//! A `StoreRequest` is what a caller hands to the manager. The transaction
//! splits it into `RequestComponents` (one per partition), the request builder
//! resolves those into a `RequestDescriptor`, and the transport sends that.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::form_urlencoded;

use super::ids::ObjectId;

/// Metadata key holding an entity's time-to-live in seconds (as a string).
pub const TIME_TO_LIVE_KEY: &str = "timeToLive";

/// Metadata key holding an entity's URL path segment.
pub const PATH_KEY: &str = "path";

/// Description of a remote entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A conjunction of `key=value` clauses.
///
/// Clause order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    clauses: Vec<(String, String)>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new().and(key, value)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    /// Parse `k=v` clauses separated by `&`. Returns `None` on a clause
    /// without `=`.
    pub fn parse(input: &str) -> Option<Self> {
        let mut predicate = Self::new();
        for clause in input.split('&').filter(|c| !c.is_empty()) {
            let (key, value) = clause.split_once('=')?;
            predicate = predicate.and(key.trim(), value.trim());
        }
        Some(predicate)
    }

    pub fn clauses(&self) -> &[(String, String)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Clauses form-urlencoded in order, so a `&` or `=` inside a value
    /// can never be mistaken for a clause boundary.
    pub fn signature(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.clauses {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Type hint telling the decoder how to classify a response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    #[default]
    Document,
    Binary,
    Other(String),
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Document => f.write_str("document"),
            PayloadKind::Binary => f.write_str("binary"),
            PayloadKind::Other(other) => f.write_str(other),
        }
    }
}

/// Per-request URL overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOverrides {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Values substituted for `{token}` placeholders.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

impl RequestOverrides {
    pub fn with_token(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tokens.insert(key.into(), value.into());
        self
    }
}

/// An object written to (or read back from) a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub id: ObjectId,
    pub entity: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ManagedObject {
    pub fn new(id: impl Into<ObjectId>, entity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub entity: Option<EntityDescription>,
    pub property: Option<String>,
    #[serde(default)]
    pub predicate: Predicate,
    #[serde(default)]
    pub payload: PayloadKind,
    #[serde(default)]
    pub overrides: RequestOverrides,
}

impl FetchRequest {
    pub fn new(entity: EntityDescription) -> Self {
        Self {
            entity: Some(entity),
            ..Self::default()
        }
    }

    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn payload(mut self, payload: PayloadKind) -> Self {
        self.payload = payload;
        self
    }

    pub fn overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub entity: Option<EntityDescription>,
    #[serde(default)]
    pub inserted: Vec<ManagedObject>,
    #[serde(default)]
    pub updated: Vec<ManagedObject>,
    #[serde(default)]
    pub deleted: Vec<ManagedObject>,
    #[serde(default)]
    pub overrides: RequestOverrides,
}

impl SaveRequest {
    pub fn new(entity: EntityDescription) -> Self {
        Self {
            entity: Some(entity),
            ..Self::default()
        }
    }

    pub fn insert(mut self, object: ManagedObject) -> Self {
        self.inserted.push(object);
        self
    }

    pub fn update(mut self, object: ManagedObject) -> Self {
        self.updated.push(object);
        self
    }

    pub fn delete(mut self, object: ManagedObject) -> Self {
        self.deleted.push(object);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// One logical request submitted to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreRequest {
    Fetch(FetchRequest),
    Save(SaveRequest),
}

impl StoreRequest {
    pub fn entity(&self) -> Option<&EntityDescription> {
        match self {
            StoreRequest::Fetch(fetch) => fetch.entity.as_ref(),
            StoreRequest::Save(save) => save.entity.as_ref(),
        }
    }

    pub fn overrides_mut(&mut self) -> &mut RequestOverrides {
        match self {
            StoreRequest::Fetch(fetch) => &mut fetch.overrides,
            StoreRequest::Save(save) => &mut save.overrides,
        }
    }

    pub fn is_fetch(&self) -> bool {
        matches!(self, StoreRequest::Fetch(_))
    }
}

impl From<FetchRequest> for StoreRequest {
    fn from(value: FetchRequest) -> Self {
        StoreRequest::Fetch(value)
    }
}

impl From<SaveRequest> for StoreRequest {
    fn from(value: SaveRequest) -> Self {
        StoreRequest::Save(value)
    }
}

/// What a partition does against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Fetch,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn method(self) -> Method {
        match self {
            Operation::Fetch => Method::Get,
            Operation::Insert => Method::Post,
            Operation::Update => Method::Put,
            Operation::Delete => Method::Delete,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Fetch => "fetch",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// The logical triple (plus operation and objects) of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestComponents {
    pub operation: Operation,
    pub entity: Option<EntityDescription>,
    pub property: Option<String>,
    pub predicate: Predicate,
    pub objects: Vec<ManagedObject>,
    pub payload: PayloadKind,
    pub overrides: RequestOverrides,
}

impl RequestComponents {
    /// Components of one partition of a fetch.
    pub fn fetch(request: &FetchRequest) -> Self {
        Self {
            operation: Operation::Fetch,
            entity: request.entity.clone(),
            property: request.property.clone(),
            predicate: request.predicate.clone(),
            objects: Vec::new(),
            payload: request.payload.clone(),
            overrides: request.overrides.clone(),
        }
    }

    /// Components of one partition of a save.
    pub fn save(request: &SaveRequest, operation: Operation, objects: Vec<ManagedObject>) -> Self {
        Self {
            operation,
            entity: request.entity.clone(),
            property: None,
            predicate: Predicate::new(),
            objects,
            payload: PayloadKind::Document,
            overrides: request.overrides.clone(),
        }
    }

    pub fn entity_name(&self) -> Option<&str> {
        self.entity.as_ref().map(|e| e.name.as_str())
    }
}

/// A resolved request, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: url::Url,
    pub body: Option<Vec<u8>>,
    pub payload: PayloadKind,
    pub entity: Option<EntityDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_signature_keeps_clause_order() {
        let predicate = Predicate::eq("id", "1").and("color", "blue");
        assert_eq!(predicate.signature(), "id=1&color=blue");
        assert_eq!(Predicate::new().signature(), "");
    }

    #[test]
    fn separators_inside_values_keep_signatures_apart() {
        let two_clauses = Predicate::eq("a", "1").and("b", "2");
        let one_clause = Predicate::eq("a", "1&b=2");
        assert_ne!(two_clauses.signature(), one_clause.signature());
        assert_eq!(one_clause.signature(), "a=1%26b%3D2");
        assert_ne!(
            Predicate::eq("a=b", "c").signature(),
            Predicate::eq("a", "b=c").signature()
        );
    }

    #[test]
    fn predicate_parse() {
        let predicate = Predicate::parse("id=1&name = gear").unwrap();
        assert_eq!(predicate, Predicate::eq("id", "1").and("name", "gear"));
        assert!(Predicate::parse("id").is_none());
        assert!(Predicate::parse("").unwrap().is_empty());
    }

    #[test]
    fn save_components_take_the_request_entity() {
        let save = SaveRequest::new(EntityDescription::new("Widget"))
            .insert(ManagedObject::new("w-1", "Widget"));
        let components = RequestComponents::save(&save, Operation::Insert, save.inserted.clone());
        assert_eq!(components.entity_name(), Some("Widget"));
        assert_eq!(components.operation.method(), Method::Post);
        assert_eq!(components.objects.len(), 1);
    }

    #[test]
    fn store_request_serializes_with_kind_tag() {
        let request: StoreRequest = FetchRequest::new(EntityDescription::new("Widget")).into();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "fetch");
        assert_eq!(json["entity"]["name"], "Widget");
    }
}
