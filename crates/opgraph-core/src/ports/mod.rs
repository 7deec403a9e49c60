//! Ports - 抽象化レイヤー
//!
//! 外部コラボレーター（永続化、通信、デコード、URL 構築）へのインターフェース。
//! The scheduling core only talks to these traits; concrete versions live
//! in `impls`.

pub mod clock;
pub mod decoder;
pub mod request_builder;
pub mod transport;
pub mod ttl;
pub mod workspace;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::decoder::PayloadDecoder;
pub use self::request_builder::RequestBuilder;
pub use self::transport::{Transport, TransportError};
pub use self::ttl::TtlPolicy;
pub use self::workspace::{CommitError, Workspace};

use std::sync::Arc;

/// Everything a partition chain needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn Transport>,
    pub decoder: Arc<dyn PayloadDecoder>,
    pub request_builder: Arc<dyn RequestBuilder>,
    pub ttl: Arc<dyn TtlPolicy>,
}
