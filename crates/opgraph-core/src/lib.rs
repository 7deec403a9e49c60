//! opgraph-core
//!
//! 非同期タスクグラフでストアリクエストを実行するコア。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, errors, request）
//! - **task**: Task の状態機械、Work / Condition / Observer
//! - **queue**: TaskQueue（並行数制限、依存グラフ、排他制御）
//! - **group**: GroupTask（子タスクを内部キューで実行）
//! - **cache**: FulfillmentCache（取得の重複排除、TTL）
//! - **transaction**: Transaction と 4 段のパーティションチェーン
//! - **manager**: GraphManager（トランザクションの直列実行）
//! - **ports**: 外部コラボレーターの抽象化
//! - **impls**: ports の実装（in-memory, HTTP, JSON）
//! - **config**: TOML 設定
//! - **observability**: 状態のスナップショット
//!
//! A store request becomes a `Transaction`: a `GroupTask` holding one
//! Validate → Construct → FetchBytes → ConditionData chain per partition.
//! The `GraphManager` runs transactions one at a time.

pub mod cache;
pub mod config;
pub mod domain;
pub mod group;
pub mod impls;
pub mod manager;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod task;
pub mod transaction;

pub use self::cache::{FetchSignature, FulfillmentCache, FulfillmentStatus};
pub use self::config::{ManagerConfig, TransportConfig};
pub use self::domain::{FetchRequest, SaveRequest, StoreRequest, TaskError, TaskState};
pub use self::group::GroupTask;
pub use self::manager::{GraphManager, GraphManagerBuilder, ManagerHooks, ResetPolicy};
pub use self::queue::TaskQueue;
pub use self::task::Task;
pub use self::transaction::Transaction;
