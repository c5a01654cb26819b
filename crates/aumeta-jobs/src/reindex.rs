//! Reindexing task: extracts an AU's metadata and records it.
//!
//! Stepping pulls articles from the AU one at a time, runs the plugin's
//! extractor over each on the blocking pool, validates every emitted record
//! against the reference catalog and appends it to a spill buffer. Nothing
//! touches the metadata store until FINISH, where the buffer is recorded in a
//! single transaction (after wiping the AU's prior items on a full reindex)
//! or, on failure, the AU is put back into the pending queue.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, trace, warn};

use aumeta_core::{
    ArchivalUnit, ArticleFiles, ArticleIter, ArticleMetadataExtractor, Emitter, Error,
    ExtractError, ExtractedRecord, MetadataTarget, RawMetadata, ReferenceRecord, Result,
    TaskKind, TaskStatus,
};
use aumeta_db::{AuRecordingContext, Database, MetadataRecorder, RecordSummary};

use crate::spill::{SpillReader, SpillWriter};
use crate::task::{SchedulableTask, TaskControl, TaskHandle};
use crate::validator::{validate, WarningLog};

/// Builder for a [`ReindexingTask`].
pub struct ReindexingTaskBuilder {
    au: Arc<dyn ArchivalUnit>,
    extractor: Arc<dyn ArticleMetadataExtractor>,
    db: Database,
    reference: Option<ReferenceRecord>,
    is_new: bool,
    full_reindex: bool,
    last_extract_time: Option<i64>,
    spill_dir: PathBuf,
}

impl ReindexingTaskBuilder {
    /// Reference catalog entry to validate against, if the AU has one.
    pub fn reference(mut self, reference: Option<ReferenceRecord>) -> Self {
        self.reference = reference;
        self
    }

    /// The AU has never been indexed.
    pub fn new_au(mut self, is_new: bool) -> Self {
        self.is_new = is_new;
        self
    }

    /// Discard previously recorded items instead of adding to them.
    pub fn full_reindex(mut self, full_reindex: bool) -> Self {
        self.full_reindex = full_reindex;
        self
    }

    /// When the AU's metadata was last extracted successfully.
    pub fn last_extract_time(mut self, millis: Option<i64>) -> Self {
        self.last_extract_time = millis;
        self
    }

    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }

    pub fn build(self) -> ReindexingTask {
        let control = TaskControl::new(TaskKind::Reindexing, self.au.au_id(), self.au.name())
            .with_new_au(self.is_new)
            .with_full_reindex(self.full_reindex);
        ReindexingTask {
            control: Arc::new(control),
            au: self.au,
            extractor: self.extractor,
            db: self.db,
            reference: self.reference,
            last_extract_time: self.last_extract_time,
            spill_dir: self.spill_dir,
            target: MetadataTarget::all(),
            extraction: None,
            warning_count: 0,
        }
    }
}

/// Extracts and records the metadata of one AU.
pub struct ReindexingTask {
    control: TaskHandle,
    au: Arc<dyn ArchivalUnit>,
    extractor: Arc<dyn ArticleMetadataExtractor>,
    db: Database,
    reference: Option<ReferenceRecord>,
    last_extract_time: Option<i64>,
    spill_dir: PathBuf,
    target: MetadataTarget,
    extraction: Option<Extraction>,
    warning_count: usize,
}

impl ReindexingTask {
    pub fn builder(
        au: Arc<dyn ArchivalUnit>,
        extractor: Arc<dyn ArticleMetadataExtractor>,
        db: Database,
    ) -> ReindexingTaskBuilder {
        ReindexingTaskBuilder {
            au,
            extractor,
            db,
            reference: None,
            is_new: false,
            full_reindex: false,
            last_extract_time: None,
            spill_dir: std::env::temp_dir(),
        }
    }

    /// Articles the extractor will see, as decided at START.
    pub fn target(&self) -> &MetadataTarget {
        &self.target
    }

    /// Distinct reference-data warnings reported so far.
    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// Only an AU that was indexed before and is not flagged for a full
    /// reindex skips content fetched before its extraction watermark.
    fn incremental_target(&self) -> MetadataTarget {
        let control = &self.control;
        match self.last_extract_time {
            Some(watermark) if !control.is_new() && !control.is_full_reindex() => {
                MetadataTarget::changed_after(watermark)
            }
            _ => MetadataTarget::all(),
        }
    }
}

/// Record the buffered items and dequeue the AU, all in one transaction.
///
/// Dropping the transaction on any early return rolls it back.
async fn commit(
    db: &Database,
    control: &TaskControl,
    context: &AuRecordingContext,
    spill: &mut SpillReader,
) -> Result<RecordSummary> {
    let au_id = control.au_id();
    let mut tx = db.begin().await?;

    if control.is_full_reindex() {
        let removed = db.metadata.remove_au_metadata_items_tx(&mut tx, au_id).await?;
        info!(
            subsystem = "jobs",
            component = "reindex",
            op = "finish",
            au_id = %au_id,
            record_count = removed,
            "Reindexing task for AU '{}' removed {} database items",
            control.au_name(),
            removed
        );
        if !spill.has_next() {
            warn!(
                subsystem = "jobs",
                component = "reindex",
                op = "finish",
                au_id = %au_id,
                "Non-incremental reindexing task for AU '{}' failed to extract any items.",
                control.au_name()
            );
        }
    }

    let summary = MetadataRecorder::new(&db.metadata, context)
        .record_tx(&mut tx, &mut *spill, |n| control.set_updated(n))
        .await?;

    db.pending.remove_tx(&mut tx, au_id).await?;
    tx.commit().await?;
    Ok(summary)
}

/// Put an unsuccessful AU back into the pending queue.
///
/// Failed AUs go to the penalized priority; rescheduled ones to the tail.
async fn requeue(db: &Database, control: &TaskControl, status: TaskStatus) -> Result<()> {
    let au_id = control.au_id();
    let mut tx = db.begin().await?;
    db.pending.remove_tx(&mut tx, au_id).await?;
    if status == TaskStatus::Failed {
        db.pending.add_failed_tx(&mut tx, au_id).await?;
    } else {
        db.pending
            .add_tx(&mut tx, au_id, control.is_full_reindex())
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Outcome of a failed recording attempt.
fn status_for_commit_error(err: &Error) -> TaskStatus {
    match err {
        Error::Metadata { .. } => TaskStatus::Failed,
        Error::Database(_) | Error::Io(_) => TaskStatus::Rescheduled,
        _ => TaskStatus::Failed,
    }
}

#[async_trait]
impl SchedulableTask for ReindexingTask {
    fn control(&self) -> &TaskHandle {
        &self.control
    }

    async fn on_start(&mut self) -> Result<()> {
        info!(
            subsystem = "jobs",
            component = "reindex",
            op = "start",
            au_id = %self.control.au_id(),
            is_new = self.control.is_new(),
            full_reindex = self.control.is_full_reindex(),
            "Starting reindexing task for AU '{}'",
            self.control.au_name()
        );

        self.target = self.incremental_target();
        debug!(
            au_id = %self.control.au_id(),
            changed_after = ?self.target.include_files_changed_after,
            "Article target chosen"
        );
        let spill = SpillWriter::create_in(&self.spill_dir)?;
        self.extraction = Some(Extraction {
            control: Arc::clone(&self.control),
            extractor: Arc::clone(&self.extractor),
            target: self.target,
            articles: self.au.articles(&self.target),
            spill,
            warnings: WarningLog::new(),
            reference: self.reference.clone(),
            bulk_content: self.au.is_bulk_content(),
        });
        Ok(())
    }

    async fn step(&mut self, n: usize) -> usize {
        let Some(mut extraction) = self.extraction.take() else {
            self.control.set_finished();
            return 0;
        };

        let batch = tokio::task::spawn_blocking(move || {
            let processed = extraction.run(n);
            (extraction, processed)
        })
        .await;

        match batch {
            Ok((extraction, processed)) => {
                self.warning_count = extraction.warnings.len();
                self.extraction = Some(extraction);
                processed
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "reindex",
                    op = "step",
                    au_id = %self.control.au_id(),
                    error = %e,
                    "Metadata extractor did not return"
                );
                if self.control.conclude(TaskStatus::Failed) {
                    self.control.set_error(format!("extractor aborted: {e}"));
                    self.control.reset_indexed();
                }
                self.control.set_finished();
                0
            }
        }
    }

    async fn on_finish(&mut self) {
        let control = Arc::clone(&self.control);
        control.conclude(TaskStatus::Success);
        control.mark_update_started();

        let spill = self.extraction.take().map(|extraction| extraction.spill);
        let db = self.db.clone();
        if control.status() == TaskStatus::Success {
            let context = AuRecordingContext::new(control.au_id())
                .with_reference(self.reference.clone())
                .with_bulk_content(self.au.is_bulk_content());
            let recorded = match spill {
                Some(writer) => match writer.into_reader() {
                    Ok(mut reader) => {
                        let result = commit(&db, &control, &context, &mut reader).await;
                        if let Err(e) = reader.close() {
                            debug!(error = %e, "Failed to remove spill buffer");
                        }
                        result
                    }
                    Err(e) => Err(e),
                },
                None => Err(Error::InvalidState("spill buffer was never opened".to_string())),
            };

            match recorded {
                Ok(summary) => {
                    let verb = if control.is_full_reindex() { "added" } else { "updated" };
                    info!(
                        subsystem = "jobs",
                        component = "reindex",
                        op = "finish",
                        au_id = %control.au_id(),
                        record_count = summary.items,
                        "Reindexing task for AU '{}' {} {} database articles",
                        control.au_name(),
                        verb,
                        summary.items
                    );
                }
                Err(e) => {
                    let status = status_for_commit_error(&e);
                    warn!(
                        subsystem = "jobs",
                        component = "reindex",
                        op = "finish",
                        au_id = %control.au_id(),
                        %status,
                        error = %e,
                        "Error updating metadata at FINISH"
                    );
                    if let Error::Metadata {
                        record: Some(record),
                        ..
                    } = &e
                    {
                        warn!(au_id = %control.au_id(), ?record, "Offending record");
                    }
                    control.transition(TaskStatus::Success, status);
                    control.set_error(e.to_string());
                    control.set_updated(0);
                }
            }
        } else if let Some(writer) = spill {
            if let Err(e) = writer.close() {
                debug!(error = %e, "Failed to remove spill buffer");
            }
        }

        let status = control.status();
        if matches!(status, TaskStatus::Failed | TaskStatus::Rescheduled) {
            if let Err(e) = requeue(&db, &control, status).await {
                warn!(
                    subsystem = "jobs",
                    component = "reindex",
                    op = "finish",
                    au_id = %control.au_id(),
                    %status,
                    error = %e,
                    "Error updating pending queue at FINISH"
                );
            }
        }

        let snapshot = control.snapshot();
        info!(
            subsystem = "jobs",
            component = "reindex",
            op = "finish",
            au_id = %control.au_id(),
            %status,
            indexed = snapshot.indexed,
            updated = snapshot.updated,
            errors = snapshot.errors,
            duration_ms = snapshot.start_time.map(|t| chrono::Utc::now().timestamp_millis() - t),
            "Finished reindexing task for AU '{}'",
            control.au_name()
        );
    }
}

/// Extraction state of a started task; moved onto the blocking pool for
/// each step and handed back afterwards.
struct Extraction {
    control: TaskHandle,
    extractor: Arc<dyn ArticleMetadataExtractor>,
    target: MetadataTarget,
    articles: ArticleIter,
    spill: SpillWriter,
    warnings: WarningLog,
    reference: Option<ReferenceRecord>,
    bulk_content: bool,
}

impl Extraction {
    /// Extract up to `n` articles. Returns the number processed.
    fn run(&mut self, n: usize) -> usize {
        let mut processed = 0;

        while processed < n && !self.control.is_finished() {
            let Some(article) = self.articles.next() else {
                self.control.set_finished();
                break;
            };
            trace!(url = %article.full_text_url, "Extracting article");

            let mut emitter = ReindexingEmitter {
                spill: &mut self.spill,
                warnings: &mut self.warnings,
                reference: self.reference.as_ref(),
                bulk_content: self.bulk_content,
                control: &self.control,
            };
            let result = self.extractor.extract(&self.target, &article, &mut emitter);
            processed += 1;

            match result {
                Ok(()) => {}
                Err(ExtractError::RepositoryState(message)) => {
                    error!(
                        subsystem = "jobs",
                        component = "reindex",
                        op = "step",
                        au_id = %self.control.au_id(),
                        url = %article.full_text_url,
                        error = %message,
                        "Error extracting metadata for full text URL, continuing"
                    );
                    self.control.add_error();
                }
                Err(err @ ExtractError::Io(_)) => {
                    self.abort(TaskStatus::Rescheduled, &article, &err);
                }
                Err(err) => {
                    self.abort(TaskStatus::Failed, &article, &err);
                }
            }
        }

        processed
    }

    /// Stop stepping after an extractor failure that ends the task.
    fn abort(&self, status: TaskStatus, article: &ArticleFiles, err: &ExtractError) {
        error!(
            subsystem = "jobs",
            component = "reindex",
            op = "step",
            au_id = %self.control.au_id(),
            url = %article.full_text_url,
            %status,
            error = %err,
            "Failed to index metadata for full text URL"
        );
        if self.control.conclude(status) {
            self.control.set_error(err.to_string());
            self.control.reset_indexed();
        }
        self.control.set_finished();
    }
}

/// Receives an extractor's raw metadata for the task being stepped.
struct ReindexingEmitter<'a> {
    spill: &'a mut SpillWriter,
    warnings: &'a mut WarningLog,
    reference: Option<&'a ReferenceRecord>,
    bulk_content: bool,
    control: &'a TaskControl,
}

impl Emitter for ReindexingEmitter<'_> {
    fn emit(&mut self, article: &ArticleFiles, metadata: RawMetadata) -> std::result::Result<(), ExtractError> {
        let record = ExtractedRecord::from_raw(metadata).with_article_context(article);

        if let Some(reference) = self.reference {
            for message in validate(&record, reference, self.control.au_name(), self.bulk_content) {
                if self.warnings.record(&message) {
                    warn!(
                        subsystem = "jobs",
                        component = "reindex",
                        au_id = %self.control.au_id(),
                        "{}",
                        message
                    );
                }
            }
        }

        self.spill
            .add(&record)
            .map_err(|e| ExtractError::Emit(e.to_string()))?;
        self.control.add_indexed(1);
        Ok(())
    }
}
