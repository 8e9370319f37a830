pub mod compression;
pub mod config;
pub mod disk;
pub mod document;
pub mod engine;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod memindex;
pub mod quota;
pub mod scheduler;
pub mod statement;
pub mod tree;
pub mod tx;
pub mod vfs;

pub use compression::Compression;
pub use config::{CompactMode, EngineConfig, IndexConfig, SchedulerConfig, ZoneConfig};
pub use document::{DocFlags, Document, Scheme, Sequence, UpsertFn, WalSink};
pub use engine::{Cursor, Engine, Index, Transaction};
pub use error::{Error, Result};
pub use memindex::Order;
pub use tx::TxStatus;
