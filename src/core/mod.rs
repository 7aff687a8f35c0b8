pub mod cache;
pub mod catalog;
pub mod classifier;
pub mod comparator;
pub mod engine;
pub mod fetcher;
pub mod manifest;
pub mod mra;
pub mod oplog;
pub mod plan;
pub mod scanner;
pub mod store;

pub use cache::BoolCache;
pub use catalog::CatalogBuilder;
pub use classifier::{classify, classify_dest, classify_source, FileOperationKey, SourceKey};
pub use comparator::{build_file_operations, ActionSummary, DiffPolicy, FileOperation};
pub use engine::{ExportEngine, ExportOptions, ExportReport};
pub use fetcher::{Download, Downloader, HttpDownloader};
pub use manifest::{DatabaseManifest, ManifestFetcher};
pub use plan::{Plan, PlanNode};
pub use scanner::{DestinationListing, DestinationScanner};
pub use store::{AuditReport, CacheStore};
