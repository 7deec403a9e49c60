//! Domain model (ids, states, errors, requests).

pub mod errors;
pub mod ids;
pub mod request;
pub mod state;

pub use self::errors::{ErrorKind, RequestComponent, TaskError};
pub use self::ids::{ObjectId, PartitionId, TaskId, TransactionId};
pub use self::request::{
    EntityDescription, FetchRequest, ManagedObject, Method, Operation, PayloadKind, Predicate,
    RequestComponents, RequestDescriptor, RequestOverrides, SaveRequest, StoreRequest,
};
pub use self::state::TaskState;
