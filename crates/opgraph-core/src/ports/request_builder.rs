//! RequestBuilder port - リクエストの解決

use crate::domain::{RequestComponents, RequestDescriptor, TaskError};

/// Resolves the logical components of one partition into a concrete request.
///
/// A missing entity, property or piece of metadata is reported as
/// `TaskError::MissingRequestComponent`.
pub trait RequestBuilder: Send + Sync {
    fn build(&self, components: &RequestComponents) -> Result<RequestDescriptor, TaskError>;
}
