//! PayloadDecoder port - レスポンスの解釈と書き込み

use crate::domain::{ObjectId, RequestDescriptor, TaskError};

use super::Workspace;

/// Classifies a payload by `request.payload` and writes what it parsed into
/// the workspace.
///
/// Returns the ids written. Errors are `UnsupportedPayloadType` or
/// `DecodeFailure`.
pub trait PayloadDecoder: Send + Sync {
    fn decode(
        &self,
        bytes: &[u8],
        request: &RequestDescriptor,
        workspace: &dyn Workspace,
    ) -> Result<Vec<ObjectId>, TaskError>;
}
