//! End-to-end pipeline behaviour over in-memory fakes.

mod common;

use common::*;
use docflow::model::{Access, Annotation, AnnotationKind, Bounds};
use docflow::status::StatusTracker;
use docflow::store::{DocumentStore, ObjectStore, Remaining};
use docflow::{
    Document, DocumentStatus, ModificationSpec, PipelineError, RedactionSpec, Stage,
    CANCELLED_MESSAGE,
};

fn spec(json: &str) -> ModificationSpec {
    ModificationSpec::from_json(json).unwrap()
}

// ── Processing ───────────────────────────────────────────────────────────

#[tokio::test]
async fn embedded_text_document_succeeds_without_ocr() {
    let h = Harness::new();
    let doc = h.process(1, &text_pages(5)).await;

    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(doc.page_count, 5);
    assert_eq!(doc.page_spec, "612.0x792.0:0-4");
    assert!(doc.file_hash.is_some());
    assert_eq!(h.ocr.calls(), 0);

    let text = h.text_file(1).await;
    let pages: Vec<u32> = text.pages.iter().map(|p| p.page).collect();
    assert_eq!(pages, vec![0, 1, 2, 3, 4]);
    assert!(text.pages.iter().all(|p| p.ocr.is_none()));
    assert_eq!(
        h.full_text(1).await,
        "text of page 0\n\ntext of page 1\n\ntext of page 2\n\ntext of page 3\n\ntext of page 4"
    );
    assert_eq!(h.positions(1, 3).await.unwrap(), words_of("text of page 3"));
    assert_eq!(h.orch.progress(1).await.unwrap(), None);
}

#[tokio::test]
async fn scanned_pages_are_ocrd_alongside_embedded_ones() {
    let h = Harness::new();
    let pages = vec![
        FakePage::text(0, "cover"),
        FakePage::scanned(1),
        FakePage::text(2, "appendix"),
        FakePage::scanned(3),
    ];
    let doc = h.process(1, &pages).await;

    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(h.ocr.calls(), 2);
    let text = h.text_file(1).await;
    assert_eq!(text.page(0).unwrap().contents, "cover");
    assert_eq!(text.page(0).unwrap().ocr, None);
    assert_eq!(text.page(1).unwrap().contents, ocr_text(1));
    assert_eq!(text.page(1).unwrap().ocr.as_deref(), Some("tess4"));
    assert_eq!(h.page_text(1, 3).await.unwrap(), ocr_text(3));
    assert_eq!(h.positions(1, 1).await.unwrap().len(), 2);
}

#[tokio::test]
async fn forced_ocr_ignores_embedded_text() {
    let h = Harness::new();
    h.upload_pages(1, &text_pages(3)).await;
    h.orch.trigger_processing(1, true).await.unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
    assert_eq!(h.ocr.calls(), 3);
    let text = h.text_file(1).await;
    assert!(text
        .pages
        .iter()
        .all(|p| p.ocr.as_deref() == Some("tess4_force")));
    assert_eq!(text.page(2).unwrap().contents, ocr_text(2));
    assert!(h
        .pdf_pages(1)
        .await
        .iter()
        .all(|p| p.text.starts_with("text of page")));
}

#[tokio::test]
async fn ocr_text_is_grafted_so_reprocessing_skips_ocr() {
    let h = Harness::new();
    let pages = vec![FakePage::text(0, "cover"), FakePage::scanned(1)];
    h.process(1, &pages).await;
    assert_eq!(h.ocr.calls(), 1);
    let grafted = h.pdf_pages(1).await;
    assert_eq!(grafted[0].text, "cover");
    assert_eq!(grafted[1].text, "scanned page");

    h.orch.trigger_processing(1, false).await.unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
    assert_eq!(h.ocr.calls(), 1);
    let text = h.text_file(1).await;
    assert!(text.pages.iter().all(|p| p.ocr.is_none()));
    assert_eq!(text.page(1).unwrap().contents, "scanned page");
}

#[tokio::test]
async fn office_documents_are_converted_first() {
    let h = Harness::new();
    h.add_document(1);
    h.orch
        .upload(1, b"alpha\nbeta\ngamma".to_vec(), "docx")
        .await
        .unwrap();
    h.orch.trigger_processing(1, false).await.unwrap();
    assert_eq!(h.step().await.map(|t| t.stage()), Some(Stage::Convert));
    assert!(h.objects.exists(&h.paths(1).await.pdf()).await.unwrap());
    h.drain().await;

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(doc.page_count, 3);
    assert_eq!(h.full_text(1).await, "alpha\n\nbeta\n\ngamma");
}

#[tokio::test]
async fn failed_conversion_fails_the_document() {
    let h = Harness::new();
    h.add_document(1);
    h.orch
        .upload(1, b"corrupt spreadsheet".to_vec(), "xlsx")
        .await
        .unwrap();
    h.orch.trigger_processing(1, false).await.unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Error);
    let errors = h.errors(1).await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("convert failed"), "{}", errors[0]);
    assert!(!h.objects.exists(&h.paths(1).await.pdf()).await.unwrap());
}

#[tokio::test]
async fn unreadable_pdf_fails_the_document() {
    let h = Harness::new();
    h.add_document(1);
    h.orch
        .upload(1, b"%PDF-1.7 truncated".to_vec(), "pdf")
        .await
        .unwrap();
    h.orch.trigger_processing(1, false).await.unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Error);
    let tracker = StatusTracker::new(h.documents.as_ref());
    let message = tracker.current_error(1).await.unwrap().unwrap();
    assert!(message.starts_with("page_cache failed"), "{message}");
}

#[tokio::test]
async fn progress_reports_remaining_pages() {
    let h = Harness::new();
    h.upload_pages(1, &scanned_pages(4)).await;
    assert_eq!(h.orch.progress(1).await.unwrap(), None);

    h.orch.trigger_processing(1, false).await.unwrap();
    h.step().await;
    assert_eq!(
        h.orch.progress(1).await.unwrap(),
        Some(Remaining {
            images: 4,
            texts: 4,
            text_positions: 4,
            pages: 4,
        })
    );
    h.drain().await;
    assert_eq!(h.orch.progress(1).await.unwrap(), None);
}

// ── Ordering and delivery ────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_ocr_batches_assemble_in_page_order() {
    let h = Harness::with_config(test_config().image_batch(6).build().unwrap());
    h.upload_pages(1, &scanned_pages(6)).await;
    h.orch.trigger_processing(1, false).await.unwrap();
    h.step().await; // page cache
    h.step().await; // images for all six pages

    let ocr = h.bus.drain();
    assert_eq!(ocr.len(), 3);
    assert!(ocr.iter().all(|t| t.stage() == Stage::Ocr));
    for task in ocr.into_iter().rev() {
        h.orch.handle(task).await.unwrap();
    }

    h.step().await; // positions of the last batch
    assert_eq!(h.doc(1).await.status, DocumentStatus::Readable);

    h.drain().await;
    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
    let expected: Vec<String> = (0..6).map(ocr_text).collect();
    assert_eq!(h.full_text(1).await, expected.join("\n\n"));
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let h = Harness::new();
    let mut pages = text_pages(3);
    pages.extend([FakePage::scanned(3), FakePage::scanned(4)]);
    h.upload_pages(1, &pages).await;
    h.orch.trigger_processing(1, false).await.unwrap();

    while let Some(task) = h.bus.pop() {
        h.orch.handle(task.clone()).await.unwrap();
        h.orch.handle(task).await.unwrap();
    }

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(h.ocr.calls(), 2);
    assert!(h.errors(1).await.is_empty());
    let text = h.text_file(1).await;
    assert_eq!(text.pages.len(), 5);
    assert_eq!(text.page(4).unwrap().contents, ocr_text(4));
}

// ── Failures and retries ─────────────────────────────────────────────────

#[tokio::test]
async fn permanent_ocr_failure_keeps_page_count_and_ends_in_error() {
    let h = Harness::new();
    h.ocr.fail_page(2);
    let doc = h.process(1, &scanned_pages(4)).await;

    assert_eq!(doc.status, DocumentStatus::Error);
    assert_eq!(doc.page_count, 4);
    // Three attempts on the bad page, one on each of the others.
    assert_eq!(h.ocr.calls(), 6);

    let errors = h.errors(1).await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Page 3:"), "{}", errors[0]);
    assert!(errors[0].contains("unreadable scan 2"));

    let text = h.text_file(1).await;
    let pages: Vec<u32> = text.pages.iter().map(|p| p.page).collect();
    assert_eq!(pages, vec![0, 1, 3]);
}

#[tokio::test]
async fn throttled_page_is_retried_without_error() {
    let h = Harness::new();
    h.ocr.throttle_page(1, 1);
    let doc = h.process(1, &scanned_pages(3)).await;

    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(h.ocr.calls(), 4);
    assert!(h.errors(1).await.is_empty());
}

#[tokio::test]
async fn storage_hiccup_is_retried_in_stage() {
    let h = Harness::new();
    h.upload_pages(1, &text_pages(2)).await;
    h.orch.trigger_processing(1, false).await.unwrap();
    h.objects.fail_next_reads(1);
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
    assert!(h.errors(1).await.is_empty());
}

#[tokio::test]
async fn oversized_page_is_rejected_alone() {
    let h = Harness::new();
    let pages = vec![
        FakePage::text(0, "fine"),
        FakePage::text(1, "poster").sized(20_000.0, 792.0),
        FakePage::text(2, "also fine"),
    ];
    let doc = h.process(1, &pages).await;

    assert_eq!(doc.status, DocumentStatus::Error);
    assert_eq!(doc.page_count, 3);
    let errors = h.errors(1).await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Page 2:"), "{}", errors[0]);
    assert_eq!(h.page_text(1, 2).await.unwrap(), "also fine");
    assert_eq!(h.page_text(1, 1).await, None);
}

// ── Status and cancellation ──────────────────────────────────────────────

#[tokio::test]
async fn cancelled_run_ignores_late_tasks() {
    let h = Harness::new();
    h.upload_pages(1, &scanned_pages(4)).await;
    let first = h.orch.trigger_processing(1, false).await.unwrap();
    h.step().await; // page cache
    h.step().await; // images of the first batch

    h.orch.cancel_processing(1).await.unwrap();
    let late = h.bus.pop().unwrap();
    assert_eq!(late.generation, first);
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Error);
    assert_eq!(h.errors(1).await.last().unwrap(), CANCELLED_MESSAGE);
    assert_eq!(h.ocr.calls(), 0);
    assert!(!h
        .objects
        .exists(&h.paths(1).await.text_json())
        .await
        .unwrap());
    assert!(matches!(
        h.orch.cancel_processing(1).await,
        Err(PipelineError::InvalidState { .. })
    ));

    let second = h.orch.trigger_processing(1, false).await.unwrap();
    assert!(second > first);
    h.drain().await;
    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);

    h.orch.handle(late).await.unwrap();
    assert!(h.bus.is_empty());
    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
}

#[tokio::test]
async fn trigger_while_processing_is_rejected() {
    let h = Harness::new();
    h.upload_pages(1, &text_pages(2)).await;
    h.orch.trigger_processing(1, false).await.unwrap();

    let err = h.orch.trigger_processing(1, false).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidState {
            status: DocumentStatus::Pending,
            ..
        }
    ));
    h.drain().await;

    // Reprocessing a finished document is allowed.
    h.orch.trigger_processing(1, false).await.unwrap();
    assert_eq!(h.doc(1).await.status, DocumentStatus::Pending);
    h.drain().await;
    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
}

// ── Modification ─────────────────────────────────────────────────────────

#[tokio::test]
async fn long_document_trimmed_to_head_and_tail() {
    let h = Harness::with_config(
        test_config()
            .image_batch(64)
            .text_position_batch(64)
            .build()
            .unwrap(),
    );
    h.process(1, &text_pages(448)).await;
    let source = h.page_artifacts(1, 423).await;

    h.orch
        .apply_modification(1, OWNER, &spec(r#"[{"page":"0-23,423-447"}]"#))
        .await
        .unwrap();
    h.drain().await;

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(doc.page_count, 49);
    assert_eq!(doc.page_spec, "612.0x792.0:0-48");
    assert_eq!(h.ocr.calls(), 0);

    assert_eq!(h.page_artifacts(1, 24).await, source);
    assert_eq!(h.image_id(1, 24).await, 423);
    assert_eq!(h.image_id(1, 48).await, 447);
    assert_eq!(h.page_text(1, 49).await, None);
    assert_eq!(h.positions(1, 447).await, None);

    let text = h.text_file(1).await;
    assert_eq!(text.pages.len(), 49);
    assert_eq!(text.page(24).unwrap().contents, "text of page 423");
}

#[tokio::test]
async fn repeated_page_copies_text_and_annotations() {
    let h = Harness::new();
    h.process(1, &text_pages(3)).await;
    let bounds = Bounds {
        x1: 0.25,
        y1: 0.25,
        x2: 0.5,
        y2: 0.5,
    };
    let pinned = h
        .documents
        .add_annotation(1, Annotation::note(1, "pinned", Some(bounds)))
        .unwrap();
    h.documents
        .add_annotation(1, Annotation::note(2, "later", Some(bounds)))
        .unwrap();
    h.documents
        .add_annotation(1, Annotation::section(0, "Intro"))
        .unwrap();
    let source = h.page_artifacts(1, 1).await;

    h.orch
        .apply_modification(1, OWNER, &spec(r#"[{"page":"1,1,1"}]"#))
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.page_count, 3);
    for page in 0..3 {
        assert_eq!(h.page_artifacts(1, page).await, source);
        assert_eq!(h.image_id(1, page).await, 1);
    }

    let annotations = h.documents.annotations(1).await.unwrap();
    let mut copies: Vec<&Annotation> =
        annotations.iter().filter(|a| a.title == "pinned").collect();
    copies.sort_by_key(|a| a.page_number);
    assert_eq!(
        copies.iter().map(|a| a.page_number).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(copies[0].id, Some(pinned));
    assert!(copies.iter().all(|a| a.bounds == Some(bounds)));

    let later = annotations.iter().find(|a| a.title == "later").unwrap();
    assert_eq!(later.page_number, 0);
    assert_eq!(later.bounds, None);
    assert!(!annotations
        .iter()
        .any(|a| a.kind == AnnotationKind::Section));
}

#[tokio::test]
async fn rotations_in_inverse_pairs_restore_positions() {
    let h = Harness::new();
    h.process(1, &text_pages(2)).await;
    let original = h.page_artifacts(1, 0).await;
    let words = h.positions(1, 0).await.unwrap();

    let rotate = |angle: &str| {
        spec(&format!(
            r#"[{{"page":"0-1","modifications":[{{"type":"rotate","angle":"{angle}"}}]}}]"#
        ))
    };

    h.orch.apply_modification(1, OWNER, &rotate("cw")).await.unwrap();
    h.drain().await;
    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(doc.page_spec, "792.0x612.0:0-1");
    let turned: Vec<_> = words.iter().map(|w| w.rotated(1)).collect();
    assert_eq!(h.positions(1, 0).await.unwrap(), turned);
    assert_eq!(h.page_text(1, 0).await.unwrap(), "text of page 0");

    h.orch.apply_modification(1, OWNER, &rotate("ccw")).await.unwrap();
    h.drain().await;
    assert_eq!(h.page_artifacts(1, 0).await, original);
    assert_eq!(h.doc(1).await.page_spec, "612.0x792.0:0-1");

    for _ in 0..2 {
        h.orch.apply_modification(1, OWNER, &rotate("hw")).await.unwrap();
        h.drain().await;
    }
    assert_eq!(h.page_artifacts(1, 0).await, original);
}

#[tokio::test]
async fn identity_spec_preserves_text_and_positions() {
    let h = Harness::new();
    let mut pages = text_pages(2);
    pages.push(FakePage::scanned(2));
    h.process(1, &pages).await;
    let before: Vec<_> = {
        let mut v = Vec::new();
        for p in 0..3 {
            v.push(h.page_artifacts(1, p).await);
        }
        v
    };
    let calls = h.ocr.calls();

    h.orch
        .apply_modification(1, OWNER, &spec(r#"[{"page":"0-2"}]"#))
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);
    assert_eq!(h.ocr.calls(), calls);
    for p in 0..3 {
        assert_eq!(h.page_artifacts(1, p).await, before[p as usize]);
        assert_eq!(h.image_id(1, p).await, p);
    }
    assert_eq!(
        h.text_file(1).await.page(2).unwrap().ocr.as_deref(),
        Some("tess4")
    );
}

#[tokio::test]
async fn modification_resumes_after_a_partial_write() {
    let h = Harness::new();
    h.process(1, &text_pages(3)).await;
    let composes = h.engine.composes();

    // More failures than in-stage retries, so the task is re-dispatched too.
    h.objects.fail_puts_matching(".position.json", 3);
    h.orch
        .apply_modification(1, OWNER, &spec(r#"[{"page":"2,1,0"}]"#))
        .await
        .unwrap();
    h.drain().await;

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert!(h.errors(1).await.is_empty());
    assert_eq!(h.engine.composes(), composes + 1);
    let ids: Vec<u32> = h.pdf_pages(1).await.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![2, 1, 0]);
    for (page, id) in ids.iter().enumerate() {
        let page = page as u32;
        assert_eq!(h.image_id(1, page).await, *id);
        assert_eq!(
            h.page_text(1, page).await.unwrap(),
            format!("text of page {id}")
        );
    }
    assert_eq!(
        h.full_text(1).await,
        "text of page 2\n\ntext of page 1\n\ntext of page 0"
    );
    assert!(h.staged_keys().is_empty());
}

#[tokio::test]
async fn pages_can_be_imported_from_an_editable_document() {
    let h = Harness::new();
    h.process(1, &text_pages(2)).await;
    h.process(
        2,
        &[
            FakePage::text(100, "imported zero"),
            FakePage::text(101, "imported one"),
        ],
    )
    .await;

    h.orch
        .apply_modification(1, OWNER, &spec(r#"[{"page":"0-1"},{"id":2,"page":"1"}]"#))
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.doc(1).await.page_count, 3);
    assert_eq!(h.page_text(1, 2).await.unwrap(), "imported one");
    assert_eq!(h.image_id(1, 2).await, 101);
    // The source is untouched.
    assert_eq!(h.doc(2).await.page_count, 2);
}

#[tokio::test]
async fn invalid_modifications_change_nothing() {
    let h = Harness::new();
    h.process(1, &text_pages(3)).await;
    h.documents
        .insert(Document::new(3, "shared", 99).with_access(Access::Public))
        .unwrap();

    let cases = [
        r#"[{"page":"0-9"}]"#,
        r#"[{"page":"2-0"}]"#,
        r#"[{"page":"a-b"}]"#,
        r#"[{"page":"0"},{"id":3,"page":"0"}]"#,
        r#"[]"#,
    ];
    for json in cases {
        let err = h
            .orch
            .apply_modification(1, OWNER, &spec(json))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                PipelineError::PageOutOfRange { .. }
                    | PipelineError::MalformedRange { .. }
                    | PipelineError::PermissionDenied { .. }
                    | PipelineError::InvalidModification(_)
            ),
            "{json}: {err}"
        );
    }
    assert!(matches!(
        h.orch
            .apply_modification(1, 99, &spec(r#"[{"page":"0"}]"#))
            .await,
        Err(PipelineError::PermissionDenied { .. })
    ));

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(doc.page_count, 3);
    assert!(h.bus.is_empty());
}

#[tokio::test]
async fn modification_of_a_processing_document_is_rejected() {
    let h = Harness::new();
    h.upload_pages(1, &text_pages(2)).await;
    h.orch.trigger_processing(1, false).await.unwrap();

    assert!(matches!(
        h.orch
            .apply_modification(1, OWNER, &spec(r#"[{"page":"0"}]"#))
            .await,
        Err(PipelineError::InvalidState { .. })
    ));
}

// ── Redaction ────────────────────────────────────────────────────────────

#[tokio::test]
async fn redaction_reprocesses_only_the_named_page() {
    let h = Harness::new();
    h.process(1, &text_pages(3)).await;
    let untouched = [h.page_artifacts(1, 0).await, h.page_artifacts(1, 2).await];
    let before = h.text_file(1).await;

    h.orch
        .apply_redaction(1, OWNER, vec![RedactionSpec::new(1, 0.1, 0.1, 0.6, 0.4)])
        .await
        .unwrap();
    h.step().await; // redact
    assert_eq!(h.page_text(1, 1).await, None);
    assert_eq!(h.positions(1, 1).await, None);
    h.drain().await;

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert_eq!(doc.page_count, 3);
    assert_eq!(h.ocr.calls(), 1);
    assert_eq!(
        [h.page_artifacts(1, 0).await, h.page_artifacts(1, 2).await],
        untouched
    );

    let after = h.text_file(1).await;
    assert_eq!(after.page(0), before.page(0));
    assert_eq!(after.page(2), before.page(2));
    let redacted = after.page(1).unwrap();
    assert_eq!(redacted.contents, ocr_text(1));
    assert_eq!(redacted.ocr.as_deref(), Some("tess4"));
    assert_ne!(h.positions(1, 1).await.unwrap(), words_of("text of page 1"));
}

#[tokio::test]
async fn redaction_resumes_after_a_partial_write() {
    let h = Harness::new();
    h.process(1, &text_pages(3)).await;
    let before = h.text_file(1).await;

    h.objects.fail_puts_matching(".txt.json", 3);
    h.orch
        .apply_redaction(1, OWNER, vec![RedactionSpec::new(1, 0.1, 0.1, 0.6, 0.4)])
        .await
        .unwrap();
    h.drain().await;

    let doc = h.doc(1).await;
    assert_eq!(doc.status, DocumentStatus::Success);
    assert!(h.errors(1).await.is_empty());
    assert_eq!(h.engine.flattens(), 1);
    assert_eq!(h.ocr.calls(), 1);
    let flattened: Vec<bool> = h.pdf_pages(1).await.iter().map(|p| p.flattened).collect();
    assert_eq!(flattened, vec![false, true, false]);

    let after = h.text_file(1).await;
    assert_eq!(after.page(0), before.page(0));
    assert_eq!(after.page(2), before.page(2));
    assert_eq!(after.page(1).unwrap().contents, ocr_text(1));
    assert!(h.staged_keys().is_empty());
}

#[tokio::test]
async fn invalid_redactions_are_rejected() {
    let h = Harness::new();
    h.process(1, &text_pages(3)).await;

    assert!(matches!(
        h.orch.apply_redaction(1, OWNER, vec![]).await,
        Err(PipelineError::EmptyRedaction)
    ));
    assert!(matches!(
        h.orch
            .apply_redaction(1, OWNER, vec![RedactionSpec::new(3, 0.1, 0.1, 0.2, 0.2)])
            .await,
        Err(PipelineError::InvalidRedaction { page: 3, .. })
    ));
    assert!(matches!(
        h.orch
            .apply_redaction(1, OWNER, vec![RedactionSpec::new(0, 0.5, 0.1, 0.2, 0.2)])
            .await,
        Err(PipelineError::InvalidRedaction { .. })
    ));
    assert!(matches!(
        h.orch
            .apply_redaction(1, 99, vec![RedactionSpec::new(0, 0.1, 0.1, 0.2, 0.2)])
            .await,
        Err(PipelineError::PermissionDenied { .. })
    ));
    assert!(h.bus.is_empty());
    assert_eq!(h.doc(1).await.status, DocumentStatus::Success);

    h.orch.trigger_processing(1, false).await.unwrap();
    assert!(matches!(
        h.orch
            .apply_redaction(1, OWNER, vec![RedactionSpec::new(0, 0.1, 0.1, 0.2, 0.2)])
            .await,
        Err(PipelineError::InvalidState { .. })
    ));
}
