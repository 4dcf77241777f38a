pub mod entry;
pub mod ids;
pub mod track;

pub use entry::{Entry, RawRecord};
pub use ids::{CollectionId, RecordId};
pub use track::ProjectedRecord;
