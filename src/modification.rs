//! Modification specs: parsing, validation into a [`ModificationPlan`], and
//! annotation remapping.
//!
//! A spec is a JSON array such as
//! `[{"page": "0-23,423-447"}, {"id": 7, "page": "2", "modifications": [{"type": "rotate", "angle": "cw"}]}]`.
//! Validation runs entirely before anything is written: an invalid element
//! rejects the whole spec.

use crate::error::PipelineError;
use crate::model::{Annotation, AnnotationKind, DocumentId, DocumentStatus, Permission, UserId};
use crate::page_range;
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// User-supplied page composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModificationSpec(pub Vec<ModificationElement>);

impl ModificationSpec {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidModification(format!("unparseable spec: {e}")))
    }
}

/// One element of a [`ModificationSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationElement {
    /// Source document; the target itself when absent.
    #[serde(
        default,
        rename = "id",
        alias = "source_document_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<DocumentId>,

    /// Page range string, see [`crate::page_range`].
    #[serde(rename = "page", alias = "page_range")]
    pub page_range: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifications: Vec<PageModification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PageModification {
    Rotate { angle: Angle },
}

/// Rotation angle of a `rotate` modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Angle {
    #[serde(rename = "cw", alias = "cc")]
    Clockwise,
    #[serde(rename = "hw")]
    Half,
    #[serde(rename = "ccw")]
    CounterClockwise,
}

impl Angle {
    /// Clockwise quarter turns.
    pub fn quarter_turns(self) -> u8 {
        match self {
            Angle::Clockwise => 1,
            Angle::Half => 2,
            Angle::CounterClockwise => 3,
        }
    }
}

impl ModificationElement {
    /// Net clockwise quarter turns of this element's modifiers.
    pub fn quarter_turns(&self) -> u8 {
        self.modifications
            .iter()
            .map(|m| match m {
                PageModification::Rotate { angle } => angle.quarter_turns(),
            })
            .fold(0, |acc, t| (acc + t) % 4)
    }
}

/// One page of the new sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPage {
    pub source: DocumentId,
    pub source_page: u32,
    /// Clockwise quarter turns applied to the source page.
    pub quarter_turns: u8,
}

/// A validated modification: the complete new page sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationPlan {
    pub target: DocumentId,
    pub pages: Vec<PlannedPage>,
}

impl ModificationPlan {
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Every document pages are taken from, the target included if used.
    pub fn sources(&self) -> BTreeSet<DocumentId> {
        self.pages.iter().map(|p| p.source).collect()
    }

    /// Where each source page lands: `(source, page) → [(new_page, turns)]`,
    /// in output order.
    pub fn occurrences(&self) -> HashMap<(DocumentId, u32), Vec<(u32, u8)>> {
        let mut map: HashMap<(DocumentId, u32), Vec<(u32, u8)>> = HashMap::new();
        for (new_page, p) in self.pages.iter().enumerate() {
            map.entry((p.source, p.source_page))
                .or_default()
                .push((new_page as u32, p.quarter_turns));
        }
        map
    }
}

/// Most pages a modification may produce; composed PDFs address pages with
/// 16-bit indices.
pub const MAX_PAGES: u64 = 1 << 16;

/// Validate `spec` for `caller` against the current metadata.
///
/// Rules: the caller must be able to edit the target and every imported
/// document; imported documents must have finished processing; the target
/// must not be processing; every page must exist; the result has at most
/// [`MAX_PAGES`] pages.
pub async fn plan(
    spec: &ModificationSpec,
    target: DocumentId,
    caller: UserId,
    documents: &dyn DocumentStore,
) -> Result<ModificationPlan, PipelineError> {
    if spec.0.is_empty() {
        return Err(PipelineError::InvalidModification(
            "specification has no elements".into(),
        ));
    }

    let target_doc = documents.get(target).await?;
    if documents.permission(caller, target).await? < Permission::Edit {
        return Err(PipelineError::PermissionDenied {
            user: caller,
            id: target,
            action: "modify",
        });
    }
    if target_doc.status.is_processing() || target_doc.status == DocumentStatus::Nofile {
        return Err(PipelineError::InvalidState {
            id: target,
            status: target_doc.status,
            action: "modify",
        });
    }

    let mut page_counts: BTreeMap<DocumentId, u32> = BTreeMap::new();
    page_counts.insert(target, target_doc.page_count);

    let mut pages = Vec::new();
    let mut planned: u64 = 0;
    for element in &spec.0 {
        let spans = page_range::parse(&element.page_range)?;
        let source = element.source.unwrap_or(target);

        planned += page_range::total_len(&spans);
        if planned > MAX_PAGES {
            return Err(PipelineError::InvalidModification(format!(
                "result would exceed {MAX_PAGES} pages"
            )));
        }

        let total = match page_counts.get(&source) {
            Some(&n) => n,
            None => {
                let doc = documents.get(source).await?;
                if documents.permission(caller, source).await? < Permission::Edit {
                    return Err(PipelineError::PermissionDenied {
                        user: caller,
                        id: source,
                        action: "import pages from",
                    });
                }
                if doc.status != DocumentStatus::Success {
                    return Err(PipelineError::InvalidState {
                        id: source,
                        status: doc.status,
                        action: "import pages from",
                    });
                }
                page_counts.insert(source, doc.page_count);
                doc.page_count
            }
        };

        if let Some(max) = page_range::max_page(&spans) {
            if max >= total {
                return Err(PipelineError::PageOutOfRange {
                    id: source,
                    page: max,
                    total,
                });
            }
        }

        let quarter_turns = element.quarter_turns();
        pages.extend(page_range::expand(&spans).into_iter().map(|source_page| PlannedPage {
            source,
            source_page,
            quarter_turns,
        }));
    }

    Ok(ModificationPlan { target, pages })
}

/// Compute the target's annotation list after applying `plan`.
///
/// `annotations` holds the current annotations of every document in the
/// plan, keyed by document. On the target's own pages the first occurrence
/// keeps the annotation and further occurrences get copies. Notes on pages
/// that disappear are detached to page 0 as page notes; sections there are
/// dropped. Imported annotations are always copies.
pub fn remap_annotations(
    plan: &ModificationPlan,
    annotations: &BTreeMap<DocumentId, Vec<Annotation>>,
) -> Vec<Annotation> {
    let occurrences = plan.occurrences();
    let mut out = Vec::new();

    for (&doc_id, anns) in annotations {
        let own = doc_id == plan.target;
        for ann in anns {
            match occurrences.get(&(doc_id, ann.page_number)) {
                Some(places) => {
                    for (i, &(new_page, turns)) in places.iter().enumerate() {
                        let mut placed = ann.clone();
                        if !(own && i == 0) {
                            placed.id = None;
                        }
                        placed.page_number = new_page;
                        placed.bounds = ann.bounds.map(|b| b.rotated(turns));
                        out.push(placed);
                    }
                }
                None if own && ann.kind == AnnotationKind::Note => {
                    let mut detached = ann.clone();
                    detached.page_number = 0;
                    detached.bounds = None;
                    out.push(detached);
                }
                None => {}
            }
        }
    }

    out.sort_by_key(|a| a.page_number);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bounds, Document, DocumentUpdate};
    use crate::store::MemoryDocumentStore;

    fn finished(id: DocumentId, owner: UserId, pages: u32) -> Document {
        let mut doc = Document::new(id, format!("doc-{id}"), owner);
        DocumentUpdate::status(DocumentStatus::Success)
            .page_count(pages)
            .apply(&mut doc);
        doc
    }

    fn store(docs: Vec<Document>) -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        for d in docs {
            store.insert(d).unwrap();
        }
        store
    }

    #[test]
    fn parses_json_spec() {
        let spec = ModificationSpec::from_json(
            r#"[{"page":"0-2"},{"id":5,"page":"1","modifications":[{"type":"rotate","angle":"cc"},{"type":"rotate","angle":"hw"}]}]"#,
        )
        .unwrap();
        assert_eq!(spec.0.len(), 2);
        assert_eq!(spec.0[0].source, None);
        assert_eq!(spec.0[1].source, Some(5));
        assert_eq!(spec.0[1].quarter_turns(), 3);
    }

    #[test]
    fn rejects_unknown_angle() {
        let err = ModificationSpec::from_json(
            r#"[{"page":"0","modifications":[{"type":"rotate","angle":"sideways"}]}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidModification(_)));
    }

    #[tokio::test]
    async fn page_count_is_sum_of_ranges() {
        let docs = store(vec![finished(1, 1, 448)]);
        let spec = ModificationSpec::from_json(r#"[{"page":"0-23,423-447"}]"#).unwrap();
        let plan = plan(&spec, 1, 1, &docs).await.unwrap();
        assert_eq!(plan.page_count(), 49);
        assert_eq!(plan.pages[24].source_page, 423);
    }

    #[tokio::test]
    async fn out_of_range_page_rejected() {
        let docs = store(vec![finished(1, 1, 3)]);
        let spec = ModificationSpec::from_json(r#"[{"page":"0-3"}]"#).unwrap();
        let err = plan(&spec, 1, 1, &docs).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PageOutOfRange { page: 3, total: 3, .. }
        ));
    }

    #[tokio::test]
    async fn oversized_result_rejected_before_expansion() {
        let docs = store(vec![finished(1, 1, 40_000)]);
        let spec =
            ModificationSpec::from_json(r#"[{"page":"0-39999"},{"page":"0-39999"}]"#).unwrap();
        let err = plan(&spec, 1, 1, &docs).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidModification(_)));

        let spec = ModificationSpec::from_json(r#"[{"page":"0-39999"}]"#).unwrap();
        assert_eq!(plan(&spec, 1, 1, &docs).await.unwrap().page_count(), 40_000);
    }

    #[tokio::test]
    async fn view_only_import_rejected() {
        let docs = store(vec![finished(1, 1, 3), finished(2, 99, 3)]);
        docs.grant(1, 2, Permission::View).unwrap();
        let spec = ModificationSpec::from_json(r#"[{"page":"0"},{"id":2,"page":"0"}]"#).unwrap();
        let err = plan(&spec, 1, 1, &docs).await.unwrap_err();
        assert!(matches!(err, PipelineError::PermissionDenied { id: 2, .. }));

        docs.grant(1, 2, Permission::Edit).unwrap();
        let plan = plan(&spec, 1, 1, &docs).await.unwrap();
        assert_eq!(plan.sources(), [1, 2].into());
    }

    #[tokio::test]
    async fn processing_target_rejected() {
        let mut doc = finished(1, 1, 3);
        doc.status = DocumentStatus::Readable;
        let docs = store(vec![doc]);
        let spec = ModificationSpec::from_json(r#"[{"page":"0"}]"#).unwrap();
        let err = plan(&spec, 1, 1, &docs).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn empty_and_malformed_specs_rejected() {
        let docs = store(vec![finished(1, 1, 3)]);
        let err = plan(&ModificationSpec(vec![]), 1, 1, &docs).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidModification(_)));

        let spec = ModificationSpec::from_json(r#"[{"page":"0-"}]"#).unwrap();
        let err = plan(&spec, 1, 1, &docs).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRange { .. }));
    }

    fn plan_of(target: DocumentId, pages: &[(DocumentId, u32, u8)]) -> ModificationPlan {
        ModificationPlan {
            target,
            pages: pages
                .iter()
                .map(|&(source, source_page, quarter_turns)| PlannedPage {
                    source,
                    source_page,
                    quarter_turns,
                })
                .collect(),
        }
    }

    fn with_id(mut a: Annotation, id: u64) -> Annotation {
        a.id = Some(id);
        a
    }

    #[test]
    fn duplicated_page_copies_annotations() {
        let plan = plan_of(1, &[(1, 2, 0), (1, 2, 0), (1, 2, 0)]);
        let anns: BTreeMap<_, _> = [(1, vec![with_id(Annotation::section(2, "Exhibit A"), 10)])].into();
        let out = remap_annotations(&plan, &anns);
        assert_eq!(out.len(), 3);
        assert_eq!(
            out.iter().map(|a| a.page_number).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(out[0].id, Some(10));
        assert!(out[1].id.is_none() && out[2].id.is_none());
    }

    #[test]
    fn removed_pages_detach_notes_and_drop_sections() {
        let plan = plan_of(1, &[(1, 0, 0)]);
        let bounds = Bounds {
            x1: 0.1,
            y1: 0.1,
            x2: 0.2,
            y2: 0.2,
        };
        let anns: BTreeMap<_, _> = [(
            1,
            vec![
                with_id(Annotation::note(3, "gone", Some(bounds)), 1),
                with_id(Annotation::section(3, "Chapter 2"), 2),
            ],
        )]
        .into();
        let out = remap_annotations(&plan, &anns);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, Some(1));
        assert_eq!(out[0].page_number, 0);
        assert_eq!(out[0].bounds, None);
    }

    #[test]
    fn imported_annotations_are_copied_and_rotated() {
        let plan = plan_of(1, &[(1, 0, 0), (2, 0, 1)]);
        let bounds = Bounds {
            x1: 0.0,
            y1: 0.0,
            x2: 0.5,
            y2: 0.25,
        };
        let anns: BTreeMap<_, _> = [
            (1, vec![]),
            (2, vec![with_id(Annotation::note(0, "imported", Some(bounds)), 7)]),
        ]
        .into();
        let out = remap_annotations(&plan, &anns);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, None);
        assert_eq!(out[0].page_number, 1);
        assert_eq!(out[0].bounds, Some(bounds.rotated(1)));
    }
}
