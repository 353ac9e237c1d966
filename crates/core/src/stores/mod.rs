pub mod local;

pub use local::{IndexManifest, IndexedDocument, LocalVectorStore, ENTRIES_FILE, MANIFEST_FILE};
