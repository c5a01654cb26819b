//! In-memory stand-ins for the content repository and reference catalog.
//!
//! Shared by the unit tests here and the integration tests in tests/.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aumeta_jobs::test_support::{FakeAu, FakeExtractor, StaticResolver};
//!
//! let au = FakeAu::with_articles("p&k", "AU k", 10);
//! let resolver = StaticResolver::new().with_au(au, Some(FakeExtractor::new()));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aumeta_core::{
    ArchivalUnit, ArticleFiles, ArticleIter, ArticleMetadataExtractor, AuResolver, Emitter,
    ExtractError, MetadataTarget, RawMetadata, ReferenceCatalog, ReferenceRecord,
};

/// An AU whose articles are a fixed list.
#[derive(Debug, Clone)]
pub struct FakeAu {
    au_id: String,
    name: String,
    articles: Vec<ArticleFiles>,
    bulk_content: bool,
}

impl FakeAu {
    pub fn new(au_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            au_id: au_id.into(),
            name: name.into(),
            articles: Vec::new(),
            bulk_content: false,
        }
    }

    /// An AU with `count` articles at `http://fake/<n>`, fetched at time `n`.
    pub fn with_articles(au_id: impl Into<String>, name: impl Into<String>, count: usize) -> Self {
        let mut au = Self::new(au_id, name);
        for n in 1..=count {
            au = au.article(n as i64);
        }
        au
    }

    /// Add an article at `http://fake/<n>` fetched at epoch millis `fetched`.
    pub fn article(mut self, fetched: i64) -> Self {
        let url = format!("http://fake/{}", self.articles.len() + 1);
        self.articles
            .push(ArticleFiles::new(url.clone()).with_fetch_time(url, fetched));
        self
    }

    /// Add an article as given, e.g. one without a full-text URL.
    pub fn with_article(mut self, article: ArticleFiles) -> Self {
        self.articles.push(article);
        self
    }

    pub fn bulk_content(mut self, bulk: bool) -> Self {
        self.bulk_content = bulk;
        self
    }
}

impl ArchivalUnit for FakeAu {
    fn au_id(&self) -> &str {
        &self.au_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn articles(&self, target: &MetadataTarget) -> ArticleIter {
        let target = *target;
        Box::new(
            self.articles
                .clone()
                .into_iter()
                .filter(move |article| target.includes(article)),
        )
    }

    fn is_bulk_content(&self) -> bool {
        self.bulk_content
    }
}

/// Failure a [`FakeExtractor`] raises for a scripted article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    RepositoryState,
    Io,
    Plugin,
    Unexpected,
}

impl Failure {
    fn to_error(self, url: &str) -> ExtractError {
        match self {
            Failure::RepositoryState => ExtractError::RepositoryState(format!("{url} unavailable")),
            Failure::Io => ExtractError::Io(std::io::Error::other(format!("{url} unreadable"))),
            Failure::Plugin => ExtractError::Plugin(format!("{url} malformed")),
            Failure::Unexpected => ExtractError::Unexpected(format!("{url} exploded")),
        }
    }
}

/// Emits one record per article built from a template, except where a
/// failure is scripted.
#[derive(Debug, Default)]
pub struct FakeExtractor {
    template: RawMetadata,
    failures: HashMap<String, Failure>,
    visited: Mutex<Vec<String>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            template: RawMetadata {
                publisher: Some("Fake Press".to_string()),
                publication_title: Some("Journal of Fakes".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Use `template` for every emitted record; the article title is filled in.
    pub fn with_template(mut self, template: RawMetadata) -> Self {
        self.template = template;
        self
    }

    /// Fail with `failure` on the `n`th article (1-based) of a [`FakeAu`].
    pub fn failing_at(mut self, n: usize, failure: Failure) -> Self {
        self.failures.insert(format!("http://fake/{n}"), failure);
        self
    }

    /// Full-text URLs the extractor was asked about, in order.
    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ArticleMetadataExtractor for FakeExtractor {
    fn extract(
        &self,
        _target: &MetadataTarget,
        article: &ArticleFiles,
        emitter: &mut dyn Emitter,
    ) -> Result<(), ExtractError> {
        let url = article.full_text_url.as_str();
        self.visited
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());

        if let Some(failure) = self.failures.get(url) {
            return Err(failure.to_error(url));
        }
        let mut raw = self.template.clone();
        raw.article_title = Some(format!("Article at {url}"));
        emitter.emit(article, raw)
    }
}

/// Reference catalog backed by a map.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: HashMap<String, ReferenceRecord>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, au_id: impl Into<String>, record: ReferenceRecord) -> Self {
        self.entries.insert(au_id.into(), record);
        self
    }
}

impl ReferenceCatalog for StaticCatalog {
    fn lookup(&self, au_id: &str) -> Option<ReferenceRecord> {
        self.entries.get(au_id).cloned()
    }
}

/// Resolver over a fixed set of AUs and their extractors.
#[derive(Default)]
pub struct StaticResolver {
    aus: HashMap<String, Arc<dyn ArchivalUnit>>,
    extractors: HashMap<String, Arc<dyn ArticleMetadataExtractor>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `au`; without an extractor it resolves but cannot be indexed.
    pub fn with_au(mut self, au: FakeAu, extractor: Option<Arc<FakeExtractor>>) -> Self {
        let au_id = au.au_id.clone();
        if let Some(extractor) = extractor {
            self.extractors.insert(au_id.clone(), extractor);
        }
        self.aus.insert(au_id, Arc::new(au));
        self
    }
}

impl AuResolver for StaticResolver {
    fn resolve(&self, au_id: &str) -> Option<Arc<dyn ArchivalUnit>> {
        self.aus.get(au_id).cloned()
    }

    fn extractor_for(&self, au: &dyn ArchivalUnit) -> Option<Arc<dyn ArticleMetadataExtractor>> {
        self.extractors.get(au.au_id()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_au_honors_watermark() {
        let au = FakeAu::new("p&k", "AU k").article(100).article(200).article(300);
        let all: Vec<_> = au.articles(&MetadataTarget::all()).collect();
        assert_eq!(all.len(), 3);

        let recent: Vec<_> = au
            .articles(&MetadataTarget::changed_after(200))
            .map(|a| a.full_text_url)
            .collect();
        assert_eq!(recent, vec!["http://fake/3"]);
    }

    #[test]
    fn test_resolver_without_extractor() {
        let resolver = StaticResolver::new().with_au(FakeAu::new("p&k", "AU k"), None);
        let au = resolver.resolve("p&k").unwrap();
        assert!(resolver.extractor_for(au.as_ref()).is_none());
        assert!(resolver.resolve("p&other").is_none());
    }
}
