//! Neutral change-event model shared by the streaming source and the
//! dispatcher: typed column values, ordered row data, event metadata, and
//! the stream router that picks destinations and partition keys.

pub mod error;
pub mod router;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use router::{Router, StreamRoute};
pub use types::{ChangeEvent, EventData, Meta, Operation, RowData, Value};
