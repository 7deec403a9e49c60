//! JsonDecoder - JSON レスポンスをワークスペースへ
//!
//! Documents are a JSON object or an array of objects, each carrying a string
//! or numeric `id`. A binary payload becomes one asset object.

use serde_json::{Map, Value};

use crate::domain::{ManagedObject, ObjectId, PayloadKind, RequestDescriptor, TaskError};
use crate::ports::{PayloadDecoder, Workspace};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl JsonDecoder {
    fn entity_name(request: &RequestDescriptor) -> String {
        request
            .entity
            .as_ref()
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }

    fn object(entity: &str, fields: Map<String, Value>) -> Result<ManagedObject, TaskError> {
        let id = match fields.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(TaskError::DecodeFailure("object without an id".into())),
        };
        Ok(ManagedObject {
            id: ObjectId::new(id),
            entity: entity.to_string(),
            fields,
        })
    }

    fn document(bytes: &[u8], entity: &str) -> Result<Vec<ManagedObject>, TaskError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| TaskError::DecodeFailure(e.to_string()))?;
        let items = match value {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            other => {
                return Err(TaskError::DecodeFailure(format!(
                    "expected an object or an array, found {other}"
                )));
            }
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::Object(fields) => Self::object(entity, fields),
                other => Err(TaskError::DecodeFailure(format!(
                    "expected an object, found {other}"
                ))),
            })
            .collect()
    }

    fn asset(bytes: &[u8], request: &RequestDescriptor, entity: &str) -> ManagedObject {
        let id = request
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or(entity)
            .to_string();
        ManagedObject::new(id, entity)
            .with_field("url", Value::String(request.url.to_string()))
            .with_field("length", Value::from(bytes.len()))
            .with_field(
                "data",
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            )
    }
}

impl PayloadDecoder for JsonDecoder {
    fn decode(
        &self,
        bytes: &[u8],
        request: &RequestDescriptor,
        workspace: &dyn Workspace,
    ) -> Result<Vec<ObjectId>, TaskError> {
        let entity = Self::entity_name(request);
        let objects = match &request.payload {
            PayloadKind::Document => Self::document(bytes, &entity)?,
            PayloadKind::Binary => vec![Self::asset(bytes, request, &entity)],
            PayloadKind::Other(kind) => return Err(TaskError::UnsupportedPayloadType(kind.clone())),
        };

        let ids = objects.iter().map(|o| o.id.clone()).collect();
        for object in objects {
            workspace.write(object);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityDescription, Method};
    use crate::impls::InMemoryWorkspace;
    use rstest::rstest;

    fn request(payload: PayloadKind, url: &str) -> RequestDescriptor {
        RequestDescriptor {
            method: Method::Get,
            url: url::Url::parse(url).unwrap(),
            body: None,
            payload,
            entity: Some(EntityDescription::new("Widget")),
        }
    }

    fn document() -> RequestDescriptor {
        request(PayloadKind::Document, "https://store.test/widget")
    }

    #[test]
    fn array_document_writes_every_object() {
        let workspace = InMemoryWorkspace::new();
        let ids = JsonDecoder
            .decode(br#"[{"id": "a", "n": 1}, {"id": 2}]"#, &document(), &workspace)
            .unwrap();

        assert_eq!(ids, vec![ObjectId::new("a"), ObjectId::new("2")]);
        let a = workspace.get(&ObjectId::new("a")).unwrap();
        assert_eq!(a.entity, "Widget");
        assert_eq!(a.fields["n"], 1);
    }

    #[test]
    fn single_object_document() {
        let workspace = InMemoryWorkspace::new();
        let ids = JsonDecoder
            .decode(br#"{"id": "only"}"#, &document(), &workspace)
            .unwrap();
        assert_eq!(ids, vec![ObjectId::new("only")]);
    }

    #[rstest]
    #[case::not_json(b"<html>".as_slice())]
    #[case::scalar(b"42".as_slice())]
    #[case::no_id(br#"[{"name": "x"}]"#.as_slice())]
    #[case::nested_scalar(br#"[1, 2]"#.as_slice())]
    fn malformed_documents_fail(#[case] body: &[u8]) {
        let workspace = InMemoryWorkspace::new();
        let error = JsonDecoder.decode(body, &document(), &workspace).unwrap_err();
        assert!(matches!(error, TaskError::DecodeFailure(_)));
        assert!(!workspace.has_changes());
    }

    #[test]
    fn binary_payload_becomes_one_asset() {
        let workspace = InMemoryWorkspace::new();
        let request = request(PayloadKind::Binary, "https://store.test/assets/logo.png");
        let ids = JsonDecoder.decode(&[1, 2, 3], &request, &workspace).unwrap();

        assert_eq!(ids, vec![ObjectId::new("logo.png")]);
        let asset = workspace.get(&ids[0]).unwrap();
        assert_eq!(asset.fields["length"], 3);
    }

    #[test]
    fn other_payloads_are_unsupported() {
        let workspace = InMemoryWorkspace::new();
        let request = request(PayloadKind::Other("video".into()), "https://store.test/clip");
        assert_eq!(
            JsonDecoder.decode(b"{}", &request, &workspace),
            Err(TaskError::UnsupportedPayloadType("video".into()))
        );
    }
}
