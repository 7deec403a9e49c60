//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryWorkspace**: メモリ上のワークスペース（テスト・CLI 用）
//! - **HttpTransport**: reqwest による送信
//! - **StaticTransport**: 固定レスポンス（fixture・テスト用）
//! - **JsonDecoder**: JSON ドキュメント / バイナリの解釈
//! - **TemplateRequestBuilder**: URL テンプレートの解決
//! - **MetadataTtlPolicy**: `timeToLive` メタデータによる TTL

pub mod decoder;
pub mod request_builder;
pub mod transport;
pub mod ttl;
pub mod workspace;

pub use self::decoder::JsonDecoder;
pub use self::request_builder::TemplateRequestBuilder;
pub use self::transport::{HttpTransport, StaticTransport, TransportGate};
pub use self::ttl::MetadataTtlPolicy;
pub use self::workspace::InMemoryWorkspace;
