pub mod chunk;
pub mod chunker;
pub mod document;
pub mod reader;

pub use chunk::{Chunk, ExtractionScope};
pub use chunker::{ChunkerConfig, DocumentChunker};
pub use document::{DocumentBlob, DocumentLoader, SourceDocument, PDF_MEDIA_TYPE, TEXT_MEDIA_TYPE};
pub use reader::{DocumentEntry, FileLoader, FileReader};
