//! Transfers within one store.

use super::{
    ActionStatus, Destination, PumpError, Run, Target, TargetKind, TransferEngine, TransferKind,
    TransferRequest, TransferResult, classify, pump,
};
use crate::error::{DavError, DavResult};
use crate::locks::Depth;
use crate::path::{DavPath, PathError};
use crate::store::{Collection, Document, Resource};
use crate::transport::Transport;
use crate::traverse::{resolve, resolve_parent};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

impl TransferEngine<'_> {
    /// Execute a MOVE or COPY.
    ///
    /// Errors abort before any mutation (missing source, overlapping paths,
    /// missing destination parent, lock denial). Once entries are being
    /// processed every outcome is reported in the returned result instead.
    #[instrument(
        level = "info",
        skip(self, request, transport, cancel),
        fields(kind = %request.kind, source = %request.source, destination = %request.destination)
    )]
    pub async fn execute(
        &self,
        request: &TransferRequest,
        transport: Option<&dyn Transport>,
        cancel: &CancellationToken,
    ) -> DavResult<TransferResult> {
        if request.kind == TransferKind::Move && request.depth != Depth::Infinity {
            return Err(DavError::BadRequest(
                "MOVE requires Depth: infinity".to_string(),
            ));
        }
        self.stats.record_transfer();

        let result = match &request.destination {
            Destination::Local(destination) => self.execute_local(request, destination, cancel).await?,
            Destination::Remote(url) => {
                let transport = transport.ok_or_else(|| {
                    DavError::BadRequest(format!("no transport configured for {url}"))
                })?;
                self.execute_remote(request, transport, url, cancel).await?
            }
        };

        let failures = result.failures().count();
        if failures == 0 {
            info!(entries = result.entries.len(), "Transfer completed");
        } else {
            warn!(entries = result.entries.len(), failures, "Transfer completed with failures");
        }
        Ok(result)
    }

    async fn execute_local(
        &self,
        request: &TransferRequest,
        destination: &DavPath,
        cancel: &CancellationToken,
    ) -> DavResult<TransferResult> {
        let source = resolve(self.store, &request.source).await?;
        if request.source.contains(destination) || destination.is_ancestor_of(&request.source) {
            return Err(PathError::Overlapping {
                from: request.source.to_string(),
                to: destination.to_string(),
            }
            .into());
        }

        if request.kind == TransferKind::Move {
            self.locks
                .require(&request.source, Depth::Infinity, &request.tokens)?;
            if let Some(parent) = request.source.parent() {
                self.locks.require(&parent, Depth::Zero, &request.tokens)?;
            }
        }
        self.locks
            .require(destination, Depth::Infinity, &request.tokens)?;
        if let Some(parent) = destination.parent() {
            self.locks.require(&parent, Depth::Zero, &request.tokens)?;
        }

        let target = classify(self.store, destination).await?;
        let mut run = Run::new(request, cancel);
        self.local_node(
            &mut run,
            request.source.clone(),
            source.target,
            destination.clone(),
            target,
        )
        .await;
        Ok(TransferResult {
            entries: run.entries,
        })
    }

    /// Transfer one entry and, for collections, its members.
    ///
    /// Returns true when the entry and everything below it succeeded.
    fn local_node<'s>(
        &'s self,
        run: &'s mut Run<'_>,
        src_path: DavPath,
        src: Resource,
        dst_path: DavPath,
        target: Target,
    ) -> BoxFuture<'s, bool> {
        Box::pin(async move {
            let dst = Destination::Local(dst_path.clone());
            if run.check_cancelled() {
                run.push(&src_path, &dst, target.kind(), ActionStatus::Cancelled, None);
                return false;
            }
            let overwrite = run.request.overwrite;
            let target_kind = target.kind();
            debug!(source = %src_path, destination = %dst_path, target = %target_kind, "Transferring entry");

            match (src, target) {
                (Resource::Document(doc), Target::Missing { parent, name }) => {
                    self.document_to_missing(run, &src_path, &doc, &dst, &parent, &name)
                        .await
                }
                (Resource::Document(doc), Target::ExistingDocument(existing)) if overwrite => {
                    self.document_over_document(run, &src_path, &doc, &dst, &existing)
                        .await
                }
                (Resource::Document(_), Target::ExistingCollection(_)) => self.report(
                    run,
                    &src_path,
                    &dst,
                    target_kind,
                    ActionStatus::Conflict,
                    Some("a document cannot replace a collection".to_string()),
                ),
                (Resource::Collection(coll), Target::Missing { parent, name }) => {
                    self.collection_to_missing(
                        run,
                        &src_path,
                        &coll,
                        &dst_path,
                        &parent,
                        &name,
                        TargetKind::Missing,
                    )
                    .await
                }
                (Resource::Collection(coll), Target::ExistingCollection(existing)) if overwrite => {
                    self.collection_replacing(run, &src_path, &coll, &dst_path, existing.into(), target_kind)
                        .await
                }
                (Resource::Collection(coll), Target::ExistingDocument(existing)) if overwrite => {
                    self.collection_replacing(run, &src_path, &coll, &dst_path, existing.into(), target_kind)
                        .await
                }
                (_, _) => self.report(
                    run,
                    &src_path,
                    &dst,
                    target_kind,
                    ActionStatus::Conflict,
                    Some("destination exists and Overwrite is F".to_string()),
                ),
            }
        })
    }

    async fn document_to_missing(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        doc: &Document,
        dst: &Destination,
        parent: &Collection,
        name: &str,
    ) -> bool {
        let created = match self.store.create_document(parent, name).await {
            Ok(d) => d,
            Err(e) => {
                return self.report(
                    run,
                    src_path,
                    dst,
                    TargetKind::Missing,
                    ActionStatus::OverwriteFailed,
                    Some(e.to_string()),
                );
            }
        };

        let copied = match self.copy_content(run.cancel, doc, &created).await {
            Ok(()) => self
                .dead
                .copy_all(doc.id(), created.id())
                .await
                .map_err(PumpError::Write),
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            // Nothing was committed; drop the placeholder again.
            if let Err(cleanup) = self.store.delete(&created.clone().into()).await {
                warn!(destination = %dst, error = %cleanup, "Failed to remove partial destination");
            }
            return self.report_pump_error(run, src_path, dst, TargetKind::Missing, &e);
        }

        self.finish(run, src_path, &doc.clone().into(), dst, TargetKind::Missing, ActionStatus::Created)
            .await
    }

    async fn document_over_document(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        doc: &Document,
        dst: &Destination,
        existing: &Document,
    ) -> bool {
        let target = TargetKind::ExistingDocument;
        if let Err(e) = self.copy_content(run.cancel, doc, existing).await {
            return self.report_pump_error(run, src_path, dst, target, &e);
        }
        if let Err(e) = self.dead.copy_all(doc.id(), existing.id()).await {
            warn!(destination = %dst, error = %e, "Failed to copy dead properties");
        }
        self.finish(run, src_path, &doc.clone().into(), dst, target, ActionStatus::Overwritten)
            .await
    }

    /// Delete the existing destination as a whole, then transfer as if it
    /// had been missing.
    async fn collection_replacing(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        coll: &Collection,
        dst_path: &DavPath,
        existing: Resource,
        target: TargetKind,
    ) -> bool {
        let dst = Destination::Local(dst_path.clone());
        let parent = match self.delete_resource(dst_path, &existing).await {
            Ok(()) => resolve_parent(self.store, dst_path).await,
            Err(e) => Err(e),
        };
        match parent {
            Ok((parent, name)) => {
                self.collection_to_missing(run, src_path, coll, dst_path, &parent, &name, target)
                    .await
            }
            Err(e) => {
                self.report(run, src_path, &dst, target, ActionStatus::OverwriteFailed, Some(e.to_string()));
                if run.request.recurse() {
                    self.skip_members(run, coll, src_path, &dst).await;
                }
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn collection_to_missing(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        coll: &Collection,
        dst_path: &DavPath,
        parent: &Collection,
        name: &str,
        target: TargetKind,
    ) -> bool {
        let dst = Destination::Local(dst_path.clone());
        let created = match self.store.create_collection(parent, name).await {
            Ok(c) => c,
            Err(e) => {
                self.report(run, src_path, &dst, target, ActionStatus::OverwriteFailed, Some(e.to_string()));
                if run.request.recurse() {
                    self.skip_members(run, coll, src_path, &dst).await;
                }
                return false;
            }
        };
        if let Err(e) = self.dead.copy_all(coll.id(), created.id()).await {
            warn!(destination = %dst, error = %e, "Failed to copy dead properties");
        }

        let status = if target == TargetKind::Missing {
            ActionStatus::Created
        } else {
            ActionStatus::Overwritten
        };
        let index = run.push(src_path, &dst, target, status, None);

        let mut all_ok = true;
        if run.request.recurse() {
            match self.store.list_children(coll).await {
                Ok(members) => {
                    for member in members {
                        let member_name = member.name().to_string();
                        let ok = self
                            .local_node(
                                run,
                                src_path.join(&member_name),
                                member,
                                dst_path.join(&member_name),
                                Target::Missing {
                                    parent: created.clone(),
                                    name: member_name,
                                },
                            )
                            .await;
                        all_ok &= ok;
                        if run.cancelled {
                            all_ok = false;
                            break;
                        }
                    }
                }
                Err(e) => {
                    let entry = &mut run.entries[index];
                    entry.status = ActionStatus::OverwriteFailed;
                    entry.detail = Some(format!("listing source members failed: {e}"));
                    all_ok = false;
                }
            }
        }

        if run.request.kind == TransferKind::Move && run.entries[index].status.is_success() {
            let cleanup = if all_ok {
                self.delete_resource(src_path, &coll.clone().into())
                    .await
                    .err()
                    .map(|e| e.to_string())
            } else {
                Some("source retained because not every member was moved".to_string())
            };
            if let Some(detail) = cleanup {
                let entry = &mut run.entries[index];
                entry.status = ActionStatus::CleanupFailed;
                entry.detail = Some(detail);
                all_ok = false;
            }
        }

        let entry = &run.entries[index];
        self.record(entry.status);
        if !entry.status.is_success() {
            warn!(source = %src_path, destination = %dst, status = %entry.status, "Collection entry failed");
        }
        all_ok && entry.status.is_success()
    }

    async fn copy_content(
        &self,
        cancel: &CancellationToken,
        from: &Document,
        to: &Document,
    ) -> Result<(), PumpError> {
        let source = self.store.open_read(from).await.map_err(PumpError::Open)?;
        let sink = self.store.open_write(to).await.map_err(PumpError::Open)?;
        let bytes = pump(source, sink, self.chunk_size, cancel).await?;
        self.stats.record_bytes(bytes);
        Ok(())
    }

    /// Record a successful write; for MOVE, delete the source first.
    async fn finish(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        src: &Resource,
        dst: &Destination,
        target: TargetKind,
        status: ActionStatus,
    ) -> bool {
        if run.request.kind == TransferKind::Move
            && let Err(e) = self.delete_resource(src_path, src).await
        {
            return self.report(run, src_path, dst, target, ActionStatus::CleanupFailed, Some(e.to_string()));
        }
        self.report(run, src_path, dst, target, status, None)
    }

    fn report_pump_error(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        dst: &Destination,
        target: TargetKind,
        error: &PumpError,
    ) -> bool {
        if matches!(error, PumpError::Cancelled) {
            run.cancelled = true;
            return self.report(run, src_path, dst, target, ActionStatus::Cancelled, None);
        }
        self.report(run, src_path, dst, target, ActionStatus::OverwriteFailed, Some(error.to_string()))
    }

    /// Push an entry, update counters and log failures. Returns whether the
    /// entry succeeded.
    pub(super) fn report(
        &self,
        run: &mut Run<'_>,
        src_path: &DavPath,
        dst: &Destination,
        target: TargetKind,
        status: ActionStatus,
        detail: Option<String>,
    ) -> bool {
        match status {
            ActionStatus::Created | ActionStatus::Overwritten => {
                debug!(source = %src_path, destination = %dst, %status, "Entry transferred");
            }
            ActionStatus::Conflict | ActionStatus::Cancelled | ActionStatus::Skipped => {
                debug!(source = %src_path, destination = %dst, %status, detail = ?detail, "Entry not transferred");
            }
            ActionStatus::OverwriteFailed | ActionStatus::CleanupFailed => {
                warn!(source = %src_path, destination = %dst, %status, detail = ?detail, "Entry failed");
            }
        }
        self.record(status);
        run.push(src_path, dst, target, status, detail);
        status.is_success()
    }
}
