//! Per-page pipeline and batch driver.
//!
//! One page moves through fetch, marker validation, property extraction, derived-id
//! resolution, markup mutation, label reconciliation and finally the writes. Every
//! outcome is captured in a [`PageReport`]; only an authorization failure stops a batch.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ScopedJoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, ContentApi, Document, DocumentUpdate, SearchWalk};
use crate::config::AutoTsdConfig;
use crate::derive::{DerivedProperty, IdDefinition, resolve};
use crate::error::{ErrorKind, SyncError};
use crate::extract::{PropertyMap, extract_from_fragment, has_details_macro};
use crate::markup::Fragment;
use crate::mutate::apply_updates;
use crate::reconcile::{LabelDiff, reconcile};
use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Fetching,
    Validating,
    Extracting,
    Resolving,
    Mutating,
    Reconciling,
    Applying,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Done,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelFailure {
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupChange {
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageReport {
    pub page_id: String,
    pub title: Option<String>,
    pub status: PageStatus,
    /// Last stage entered; for a failed page this is where it failed.
    pub stage: SyncStage,
    /// True once writes were attempted.
    pub executed: bool,
    pub properties: PropertyMap,
    pub derived: Vec<DerivedProperty>,
    pub diff: LabelDiff,
    pub markup_changed: bool,
    pub new_version: Option<u64>,
    pub label_failures: Vec<LabelFailure>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(skip)]
    pub markup_change: Option<MarkupChange>,
}

impl PageReport {
    fn new(page_id: &str) -> Self {
        Self {
            page_id: page_id.to_string(),
            title: None,
            status: PageStatus::Failed,
            stage: SyncStage::Fetching,
            executed: false,
            properties: PropertyMap::new(),
            derived: Vec::new(),
            diff: LabelDiff::default(),
            markup_changed: false,
            new_version: None,
            label_failures: Vec::new(),
            error: None,
            error_kind: None,
            markup_change: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub query: String,
    pub processed: usize,
    pub done: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Why the batch stopped early, if it did.
    pub aborted: Option<String>,
    pub pages: Vec<PageReport>,
    pub request_count: usize,
}

impl BatchReport {
    pub fn success(&self) -> bool {
        self.aborted.is_none() && self.failed == 0
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub vocabulary: Vocabulary,
    pub derived_ids: Vec<IdDefinition>,
    /// Without this the pipeline plans and reports but issues no writes.
    pub execute: bool,
    pub concurrency: usize,
}

impl SyncOptions {
    pub fn from_config(config: &AutoTsdConfig) -> Self {
        Self {
            vocabulary: config.vocabulary.clone(),
            derived_ids: config.derived_ids.clone(),
            execute: config.sync.execute(),
            concurrency: config.sync.concurrency(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&AutoTsdConfig::default())
    }
}

pub struct PageSync<'a, A: ContentApi + ?Sized> {
    api: &'a A,
    options: SyncOptions,
}

struct BatchQueue<'a, A: ContentApi + ?Sized> {
    walk: SearchWalk<'a, A>,
    next_index: usize,
}

struct ApplyOutcome {
    write: Option<Result<u64, ApiError>>,
    add: Option<Result<(), ApiError>>,
    removals: Vec<(String, Result<(), ApiError>)>,
}

impl<'a, A: ContentApi + ?Sized> PageSync<'a, A> {
    pub fn new(api: &'a A, options: SyncOptions) -> Self {
        Self { api, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn sync_page(&self, page_id: &str) -> PageReport {
        let mut report = PageReport::new(page_id);
        match self.run(page_id, &mut report) {
            Ok(()) => {
                report.status = PageStatus::Done;
                report.stage = SyncStage::Done;
            }
            Err(failure) => {
                let kind = failure.kind();
                if kind == ErrorKind::ValidationRejected {
                    info!(page = page_id, "skipping page: {failure}");
                    report.status = PageStatus::Rejected;
                } else {
                    error!(page = page_id, stage = ?report.stage, "page sync failed: {failure}");
                    report.status = PageStatus::Failed;
                }
                report.error = Some(failure.to_string());
                report.error_kind = Some(kind);
            }
        }
        report
    }

    fn run(&self, page_id: &str, report: &mut PageReport) -> Result<(), SyncError> {
        report.stage = SyncStage::Fetching;
        let document = self.api.fetch_document(page_id)?;
        report.title = Some(document.title.clone());
        let labels = self.api.fetch_labels(page_id)?;

        report.stage = SyncStage::Validating;
        let vocabulary = &self.options.vocabulary;
        if !vocabulary.has_marker(&labels) {
            return Err(SyncError::ValidationRejected {
                markers: vocabulary.marker_labels.clone(),
            });
        }

        report.stage = SyncStage::Extracting;
        let fragment = Fragment::parse(&document.markup);
        for repair in fragment.repairs() {
            debug!(page = page_id, "repaired page markup: {repair}");
        }
        if !has_details_macro(&fragment) {
            debug!(page = page_id, "no page properties macro");
            return Ok(());
        }
        let properties = extract_from_fragment(&fragment)?;

        report.stage = SyncStage::Resolving;
        let resolution = resolve(&properties, &self.options.derived_ids);
        report.derived = resolution.derived.clone();

        let mutated = if resolution.changed() {
            report.stage = SyncStage::Mutating;
            let after = apply_updates(&document.markup, &resolution.updates)?.into_owned();
            (after != document.markup).then_some(after)
        } else {
            None
        };
        if let Some(after) = &mutated {
            report.markup_changed = true;
            report.markup_change = Some(MarkupChange {
                before: document.markup.clone(),
                after: after.clone(),
            });
        }

        report.stage = SyncStage::Reconciling;
        let diff = reconcile(vocabulary, &properties, &labels);
        report.properties = properties;
        report.diff = diff.clone();
        debug!(
            page = page_id,
            add = ?diff.to_add,
            remove = ?diff.to_remove,
            markup_changed = report.markup_changed,
            "planned changes"
        );

        if !self.options.execute || (mutated.is_none() && diff.is_empty()) {
            return Ok(());
        }

        report.stage = SyncStage::Applying;
        report.executed = true;
        self.apply(&document, mutated.as_deref(), &diff, report)
    }

    /// Issue the page write, the label add and every label removal concurrently.
    fn apply(
        &self,
        document: &Document,
        markup: Option<&str>,
        diff: &LabelDiff,
        report: &mut PageReport,
    ) -> Result<(), SyncError> {
        let api = self.api;
        let id = document.id.as_str();
        let outcome = thread::scope(|scope| {
            let write = markup.map(|markup| {
                scope.spawn(move || {
                    api.update_document(&DocumentUpdate {
                        id,
                        title: &document.title,
                        markup,
                        expected_version: document.version,
                    })
                })
            });
            let add = (!diff.to_add.is_empty())
                .then(|| scope.spawn(move || api.add_labels(id, &diff.to_add)));
            let removals = diff
                .to_remove
                .iter()
                .map(|label| (label, scope.spawn(move || api.remove_label(id, label))))
                .collect::<Vec<_>>();

            ApplyOutcome {
                write: write.map(join_call),
                add: add.map(join_call),
                removals: removals
                    .into_iter()
                    .map(|(label, handle)| (label.clone(), join_call(handle)))
                    .collect(),
            }
        });

        let mut unauthorized = None;
        for (label, result) in outcome.removals {
            match result {
                Ok(()) => info!(page = id, label = %label, "removed label"),
                Err(ApiError::NotFound(_)) => {
                    debug!(page = id, label = %label, "label already gone");
                }
                Err(failure) => {
                    warn!(page = id, label = %label, "label removal failed: {failure}");
                    if matches!(failure, ApiError::Unauthorized(_)) && unauthorized.is_none() {
                        unauthorized = Some(failure.clone());
                    }
                    report.label_failures.push(LabelFailure {
                        label,
                        error: failure.to_string(),
                    });
                }
            }
        }

        let write = match outcome.write {
            Some(Ok(version)) => {
                info!(page = id, version, "updated page properties");
                report.new_version = Some(version);
                Ok(())
            }
            Some(Err(failure)) => Err(failure),
            None => Ok(()),
        };
        let add = match outcome.add {
            Some(Ok(())) => {
                info!(page = id, labels = ?diff.to_add, "added labels");
                Ok(())
            }
            Some(Err(failure)) => Err(failure),
            None => Ok(()),
        };

        for result in [&write, &add] {
            if let Err(failure @ ApiError::Unauthorized(_)) = result {
                return Err(SyncError::from(failure.clone()));
            }
        }
        if let Some(failure) = unauthorized {
            return Err(SyncError::from(failure));
        }
        write?;
        add?;
        if !report.label_failures.is_empty() {
            return Err(SyncError::LabelRemoval {
                failed: report.label_failures.len(),
            });
        }
        Ok(())
    }

    /// Sync every page the query matches, `concurrency` pages at a time.
    ///
    /// Pages fail independently. The batch stops early only when a page hits an
    /// authorization failure or the search itself breaks off; reports come back in
    /// search order either way.
    pub fn sync_all(&self, query: &str) -> BatchReport {
        let queue = Mutex::new(BatchQueue {
            walk: SearchWalk::new(self.api, query),
            next_index: 0,
        });
        let aborted = Mutex::new(None);
        let finished = Mutex::new(Vec::new());
        let workers = self.options.concurrency.max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.batch_worker(&queue, &aborted, &finished));
            }
        });

        let mut indexed = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        indexed.sort_by_key(|(index, _)| *index);
        let pages = indexed
            .into_iter()
            .map(|(_, report)| report)
            .collect::<Vec<PageReport>>();
        let count = |status: PageStatus| {
            pages
                .iter()
                .filter(|page| page.status == status)
                .count()
        };

        let report = BatchReport {
            query: query.to_string(),
            processed: pages.len(),
            done: count(PageStatus::Done),
            rejected: count(PageStatus::Rejected),
            failed: count(PageStatus::Failed),
            aborted: aborted.into_inner().unwrap_or_else(PoisonError::into_inner),
            request_count: self.api.request_count(),
            pages,
        };
        info!(
            processed = report.processed,
            done = report.done,
            rejected = report.rejected,
            failed = report.failed,
            aborted = report.aborted.is_some(),
            "batch finished"
        );
        report
    }

    fn batch_worker(
        &self,
        queue: &Mutex<BatchQueue<'a, A>>,
        aborted: &Mutex<Option<String>>,
        finished: &Mutex<Vec<(usize, PageReport)>>,
    ) {
        loop {
            if lock(aborted).is_some() {
                return;
            }
            let next = {
                let mut queue = lock(queue);
                let index = queue.next_index;
                queue.next_index += 1;
                queue.walk.next().map(|item| (index, item))
            };
            let Some((index, item)) = next else {
                return;
            };
            match item {
                Err(failure) => {
                    error!("search failed: {failure}");
                    record_abort(aborted, format!("search failed: {failure}"));
                    return;
                }
                Ok(page) => {
                    debug!(page = %page.id, title = %page.title, "syncing page");
                    let report = self.sync_page(&page.id);
                    if report.error_kind.is_some_and(ErrorKind::aborts_batch) {
                        record_abort(
                            aborted,
                            format!(
                                "page {}: {}",
                                report.page_id,
                                report.error.as_deref().unwrap_or("unauthorized")
                            ),
                        );
                    }
                    lock(finished).push((index, report));
                }
            }
        }
    }
}

fn join_call<T>(handle: ScopedJoinHandle<'_, Result<T, ApiError>>) -> Result<T, ApiError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(ApiError::Transport("request thread panicked".to_string())))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_abort(aborted: &Mutex<Option<String>>, reason: String) {
    let mut slot = lock(aborted);
    if slot.is_none() {
        *slot = Some(reason);
    }
}
