//! Transfers to another server.
//!
//! Content is streamed straight from the store into the upload body. The
//! remote side decides what exists there, so target kinds are inferred from
//! its replies: `201` means the destination was missing, `200`/`204` that a
//! document was replaced, `412` on a non-overwriting upload that a document
//! already exists, and `405` on a `PUT` that a collection is in the way. A
//! `405` on `MKCOL` only says something is mapped there, so that target
//! stays `Unknown`. Dead properties stay behind.

use super::{
    ActionStatus, Destination, Run, TargetKind, TransferEngine, TransferKind, TransferRequest,
    TransferResult,
};
use crate::error::{DavResult, TransportError};
use crate::locks::Depth;
use crate::path::DavPath;
use crate::store::{Collection, Document, Resource};
use crate::traverse::resolve;
use crate::transport::{Transport, UploadOutcome, child_url};
use futures::StreamExt;
use futures::future::BoxFuture;
use http::StatusCode;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

impl TransferEngine<'_> {
    pub(super) async fn execute_remote(
        &self,
        request: &TransferRequest,
        transport: &dyn Transport,
        destination: &Url,
        cancel: &CancellationToken,
    ) -> DavResult<TransferResult> {
        let source = resolve(self.store, &request.source).await?;
        if request.kind == TransferKind::Move {
            self.locks
                .require(&request.source, Depth::Infinity, &request.tokens)?;
            if let Some(parent) = request.source.parent() {
                self.locks.require(&parent, Depth::Zero, &request.tokens)?;
            }
        }

        let mut run = Run::new(request, cancel);
        self.remote_node(
            &mut run,
            transport,
            request.source.clone(),
            source.target,
            destination.clone(),
        )
        .await;
        Ok(TransferResult {
            entries: run.entries,
        })
    }

    fn remote_node<'s>(
        &'s self,
        run: &'s mut Run<'_>,
        transport: &'s dyn Transport,
        src_path: DavPath,
        src: Resource,
        url: Url,
    ) -> BoxFuture<'s, bool> {
        Box::pin(async move {
            let dst = Destination::Remote(url.clone());
            if run.check_cancelled() {
                run.push(&src_path, &dst, TargetKind::Unknown, ActionStatus::Cancelled, None);
                return false;
            }
            match src {
                Resource::Document(doc) => {
                    self.remote_document(run, transport, &src_path, &doc, &url)
                        .await
                }
                Resource::Collection(coll) => {
                    self.remote_collection(run, transport, &src_path, &coll, &url)
                        .await
                }
            }
        })
    }

    async fn remote_document(
        &self,
        run: &mut Run<'_>,
        transport: &dyn Transport,
        src_path: &DavPath,
        doc: &Document,
        url: &Url,
    ) -> bool {
        let dst = Destination::Remote(url.clone());
        let overwrite = run.request.overwrite;
        let source = match self.store.open_read(doc).await {
            Ok(s) => s,
            Err(e) => {
                return self.report(
                    run,
                    src_path,
                    &dst,
                    TargetKind::Unknown,
                    ActionStatus::OverwriteFailed,
                    Some(e.to_string()),
                );
            }
        };

        // The body fails once the request is cancelled so the remote never
        // sees a truncated upload as complete.
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let token = run.cancel.clone();
        let body = source
            .map(move |chunk| {
                if token.is_cancelled() {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
                }
                if let Ok(bytes) = &chunk {
                    counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                chunk
            })
            .boxed();

        let cancel = run.cancel;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            result = transport.upload(url, body, overwrite) => result,
        };
        self.stats.record_bytes(sent.load(Ordering::Relaxed));

        let (target, status) = match outcome {
            Ok(UploadOutcome::Created) => (TargetKind::Missing, ActionStatus::Created),
            Ok(UploadOutcome::Replaced) => (TargetKind::ExistingDocument, ActionStatus::Overwritten),
            Err(TransportError::Cancelled) => {
                run.cancelled = true;
                return self.report(run, src_path, &dst, TargetKind::Unknown, ActionStatus::Cancelled, None);
            }
            Err(e) if e.remote_status() == Some(StatusCode::PRECONDITION_FAILED) => {
                return self.report(
                    run,
                    src_path,
                    &dst,
                    TargetKind::ExistingDocument,
                    ActionStatus::Conflict,
                    Some(e.to_string()),
                );
            }
            Err(e) if e.remote_status() == Some(StatusCode::METHOD_NOT_ALLOWED) => {
                return self.report(
                    run,
                    src_path,
                    &dst,
                    TargetKind::ExistingCollection,
                    ActionStatus::Conflict,
                    Some(e.to_string()),
                );
            }
            Err(e) => {
                return self.report(
                    run,
                    src_path,
                    &dst,
                    TargetKind::Unknown,
                    ActionStatus::OverwriteFailed,
                    Some(e.to_string()),
                );
            }
        };

        if run.request.kind == TransferKind::Move
            && let Err(e) = self.delete_resource(src_path, &doc.clone().into()).await
        {
            return self.report(run, src_path, &dst, target, ActionStatus::CleanupFailed, Some(e.to_string()));
        }
        self.report(run, src_path, &dst, target, status, None)
    }

    async fn remote_collection(
        &self,
        run: &mut Run<'_>,
        transport: &dyn Transport,
        src_path: &DavPath,
        coll: &Collection,
        url: &Url,
    ) -> bool {
        let dst = Destination::Remote(url.clone());
        let (target, created) = match self.make_remote_collection(run, transport, url).await {
            Ok(target) => (target, true),
            Err((target, status, detail)) => {
                self.report(run, src_path, &dst, target, status, detail);
                (target, false)
            }
        };
        if !created {
            if run.request.recurse() && !run.cancelled {
                self.skip_members(run, coll, src_path, &dst).await;
            }
            return false;
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
                        let member_url = match child_url(url, member.name()) {
                            Ok(u) => u,
                            Err(e) => {
                                let member_dst = Destination::Remote(url.clone());
                                self.report(
                                    run,
                                    &src_path.join(member.name()),
                                    &member_dst,
                                    TargetKind::Unknown,
                                    ActionStatus::OverwriteFailed,
                                    Some(e.to_string()),
                                );
                                all_ok = false;
                                continue;
                            }
                        };
                        let member_src = src_path.join(member.name());
                        all_ok &= self
                            .remote_node(run, transport, member_src, member, member_url)
                            .await;
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

        let final_status = run.entries[index].status;
        self.record(final_status);
        all_ok && final_status.is_success()
    }

    /// `MKCOL`, replacing an existing remote collection when overwriting.
    async fn make_remote_collection(
        &self,
        run: &mut Run<'_>,
        transport: &dyn Transport,
        url: &Url,
    ) -> Result<TargetKind, (TargetKind, ActionStatus, Option<String>)> {
        let cancelled = |run: &mut Run<'_>| {
            run.cancelled = true;
            (TargetKind::Unknown, ActionStatus::Cancelled, None)
        };

        let cancel = run.cancel;
        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled(run)),
            result = transport.make_collection(url) => result,
        };
        let exists = match first {
            Ok(()) => return Ok(TargetKind::Missing),
            Err(e) if e.remote_status() == Some(StatusCode::METHOD_NOT_ALLOWED) => e,
            Err(e) => {
                return Err((TargetKind::Unknown, ActionStatus::OverwriteFailed, Some(e.to_string())));
            }
        };
        if !run.request.overwrite {
            return Err((
                TargetKind::Unknown,
                ActionStatus::Conflict,
                Some(exists.to_string()),
            ));
        }

        debug!(%url, "Replacing existing remote collection");
        let replaced = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled(run)),
            result = async {
                transport.delete(url).await?;
                transport.make_collection(url).await?;
                Ok::<(), TransportError>(())
            } => result,
        };
        replaced
            .map(|()| TargetKind::Unknown)
            .map_err(|e| {
                (
                    TargetKind::Unknown,
                    ActionStatus::OverwriteFailed,
                    Some(e.to_string()),
                )
            })
    }
}
