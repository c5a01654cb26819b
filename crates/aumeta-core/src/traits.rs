//! Interfaces to the collaborators that supply content and reference data.
//!
//! The content repository, its plugins and the reference catalog live outside
//! aumeta; these traits are the only surface the task engine depends on.

use std::sync::Arc;

use crate::error::ExtractError;
use crate::models::*;

/// Iterator over the articles of an AU.
pub type ArticleIter = Box<dyn Iterator<Item = ArticleFiles> + Send>;

/// A unit of archived content whose metadata is indexed.
pub trait ArchivalUnit: Send + Sync {
    /// Stable identifier, `<plugin id>&<au key>`.
    fn au_id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Plugin identifier portion of the AU id.
    fn plugin_id(&self) -> &str {
        plugin_id_of(self.au_id())
    }

    /// Articles of this AU, restricted to those `target` includes.
    fn articles(&self, target: &MetadataTarget) -> ArticleIter;

    /// Whether the AU holds bulk content without per-title reference data.
    fn is_bulk_content(&self) -> bool {
        false
    }
}

/// Receives raw metadata pushed by an extractor.
pub trait Emitter {
    fn emit(&mut self, article: &ArticleFiles, metadata: RawMetadata) -> Result<(), ExtractError>;
}

/// Plugin-provided metadata extractor for one kind of AU.
pub trait ArticleMetadataExtractor: Send + Sync {
    /// Extract zero or more records from `article`, pushing each to `emitter`.
    fn extract(
        &self,
        target: &MetadataTarget,
        article: &ArticleFiles,
        emitter: &mut dyn Emitter,
    ) -> Result<(), ExtractError>;
}

/// Trusted bibliographic registry ("title database").
pub trait ReferenceCatalog: Send + Sync {
    /// Reference data for an AU, or `None` when the AU is unknown.
    fn lookup(&self, au_id: &str) -> Option<ReferenceRecord>;
}

/// Maps AU ids from the pending queue to live AUs and their extractors.
pub trait AuResolver: Send + Sync {
    /// The AU with this id, or `None` when it is no longer configured.
    fn resolve(&self, au_id: &str) -> Option<Arc<dyn ArchivalUnit>>;

    /// Extractor for this AU, or `None` when its plugin provides none.
    fn extractor_for(&self, au: &dyn ArchivalUnit) -> Option<Arc<dyn ArticleMetadataExtractor>>;
}
