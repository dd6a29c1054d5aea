//! The coordination-store side: contract, wire types, and the
//! deterministic in-memory backend.

mod error;
pub mod inmemory;
mod store;
mod types;

pub use error::KvError;
pub use inmemory::DeterministicKvStore;
pub use store::KvStore;
pub use types::Compare;
pub use types::CompareOp;
pub use types::CompareTarget;
pub use types::EventType;
pub use types::KeepAliveResponse;
pub use types::KeyValue;
pub use types::RangeResponse;
pub use types::RangeSelect;
pub use types::ResponseHeader;
pub use types::TxnOp;
pub use types::TxnOpResult;
pub use types::TxnRequest;
pub use types::TxnResponse;
pub use types::WatchEvent;
