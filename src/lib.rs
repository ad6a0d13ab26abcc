pub mod collection;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod find;
pub mod pipeline;
pub mod query;
pub mod shape;
pub mod storage;
pub mod update;
pub mod value;

pub use collection::{Collection, PendingWrite, UpdateOptions, UpdateResult};
pub use config::{StoreConfig, Strictness, WriteMode};
pub use document::{Document, DocumentId};
pub use engine::Store;
pub use error::{Error, Result};
pub use find::{Find, FindState, Many, One};
pub use pipeline::Pipeline;
pub use query::Query;
pub use shape::{Projection, SortOrder, SortSpec};
pub use update::UpdateSpec;
