//! TemplateRequestBuilder - URL テンプレートからリクエストを組み立てる
//!
//! The path comes from the entity's `path` metadata, falling back to the
//! lowercased entity name. `{token}` placeholders are filled from the
//! override tokens; `{property}` is filled from the request's property.

use serde::Serialize;
use url::Url;

use crate::domain::{
    ManagedObject, Operation, RequestComponent, RequestComponents, RequestDescriptor, TaskError,
    request::PATH_KEY,
};
use crate::ports::RequestBuilder;

#[derive(Debug, Clone)]
pub struct TemplateRequestBuilder {
    base_url: Url,
}

impl TemplateRequestBuilder {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn expand(template: &str, components: &RequestComponents) -> Result<String, TaskError> {
        let mut expanded = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            expanded.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                return Err(TaskError::MissingRequestComponent(RequestComponent::Metadata));
            };
            let token = &after[..close];
            let value = if token == "property" {
                components
                    .property
                    .as_deref()
                    .ok_or(TaskError::MissingRequestComponent(RequestComponent::Property))?
            } else {
                components
                    .overrides
                    .tokens
                    .get(token)
                    .map(String::as_str)
                    .ok_or(TaskError::MissingRequestComponent(RequestComponent::Metadata))?
            };
            expanded.push_str(value);
            rest = &after[close + 1..];
        }
        expanded.push_str(rest);
        Ok(expanded)
    }

    fn body(components: &RequestComponents) -> Result<Option<Vec<u8>>, TaskError> {
        fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Option<Vec<u8>>, TaskError> {
            serde_json::to_vec(value)
                .map(Some)
                .map_err(|e| TaskError::Other(format!("failed to encode request body: {e}")))
        }
        match components.operation {
            Operation::Insert => encode(&components.objects),
            Operation::Update => encode(Self::first_object(components)?),
            Operation::Fetch | Operation::Delete => Ok(None),
        }
    }

    fn first_object(components: &RequestComponents) -> Result<&ManagedObject, TaskError> {
        components
            .objects
            .first()
            .ok_or_else(|| TaskError::Other(format!("{} without objects", components.operation)))
    }
}

impl RequestBuilder for TemplateRequestBuilder {
    fn build(&self, components: &RequestComponents) -> Result<RequestDescriptor, TaskError> {
        let entity = components
            .entity
            .as_ref()
            .ok_or(TaskError::MissingRequestComponent(RequestComponent::Entity))?;

        let mut url = match &components.overrides.base_url {
            Some(base) => Url::parse(&Self::expand(base, components)?)
                .map_err(|e| TaskError::Other(format!("invalid base url '{base}': {e}")))?,
            None => self.base_url.clone(),
        };

        let template = entity
            .metadata(PATH_KEY)
            .map(str::to_string)
            .unwrap_or_else(|| entity.name.to_lowercase());
        let path = Self::expand(&template, components)?;

        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(property) = &components.property {
            if !template.contains("{property}") {
                segments.push(property.clone());
            }
        }
        if matches!(components.operation, Operation::Update | Operation::Delete) {
            segments.push(Self::first_object(components)?.id.to_string());
        }

        url.path_segments_mut()
            .map_err(|()| TaskError::Other(format!("base url '{}' cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(&segments);
        if !components.predicate.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in components.predicate.clauses() {
                query.append_pair(key, value);
            }
        }

        Ok(RequestDescriptor {
            method: components.operation.method(),
            url,
            body: Self::body(components)?,
            payload: components.payload.clone(),
            entity: Some(entity.clone()),
        })
    }
}
