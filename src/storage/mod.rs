pub mod sink;
pub mod source;

// Re-export common types
pub use sink::{JsonFileSink, MemorySink, ResultSink};
pub use source::{Bookmark, BookmarkSource, JsonFileSource, StaticSource};
