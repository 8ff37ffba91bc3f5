//! Phase bodies: what each of ACK, PLAN, BORROW, DIFF and CR writes.
//!
//! Every phase has one primary document. When the caller supplies validated
//! `paths_to_write`, the primary document goes to each of those paths;
//! otherwise it lands at its default location under the repo root.
//! Secondary artifacts (manifests, evidence, provenance) always use their
//! default locations.

use std::path::{Path, PathBuf};

use kb_policy::NormalizedPath;
use kb_protocol::{Mode, Phase, PhaseArtifacts, ProvenanceRecord};
use serde_json::json;
use sha2::{Digest, Sha256};

pub(crate) struct PhaseInput<'a> {
    pub phase: Phase,
    pub workflow_id: &'a str,
    pub run_id: &'a str,
    pub task: &'a str,
    pub notes: Option<&'a str>,
    pub mode: Mode,
    pub targets: &'a [NormalizedPath],
    pub repo_root: &'a Path,
    pub generated_at: &'a str,
}

impl PhaseInput<'_> {
    /// Unique per `(workflow_id, run_id)`: a readable workflow prefix plus a
    /// digest of the whole key.
    fn suffix(&self) -> String {
        format!("{}-{}", short(self.workflow_id), key_digest(self.workflow_id, self.run_id))
    }

    fn notes_or_none(&self) -> &str {
        self.notes.filter(|n| !n.trim().is_empty()).unwrap_or("_none_")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WrittenArtifact {
    pub role: &'static str,
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub(crate) struct PhaseOutput {
    pub written: Vec<WrittenArtifact>,
    pub artifacts: PhaseArtifacts,
}

fn short(id: &str) -> &str {
    id.char_indices().nth(8).map(|(i, _)| &id[..i]).unwrap_or(id)
}

/// First 16 hex chars of the sha256 over `workflow_id NUL run_id`.
fn key_digest(workflow_id: &str, run_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(run_id.as_bytes());
    let mut out = hex::encode(hasher.finalize());
    out.truncate(16);
    out
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct ArtifactWriter<'a> {
    root: &'a Path,
    written: Vec<WrittenArtifact>,
}

impl<'a> ArtifactWriter<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            written: Vec::new(),
        }
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    /// Write via a temp file and rename so readers never see partial content.
    async fn write(&mut self, role: &'static str, relative: &str, bytes: &[u8]) -> std::io::Result<String> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".into());
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        let display = path.to_string_lossy().into_owned();
        self.written.push(WrittenArtifact {
            role,
            path: display.clone(),
            sha256: sha256_hex(bytes),
        });
        Ok(display)
    }

    /// Write the primary document to every target, or to `default` when
    /// there are none.
    async fn write_primary(
        &mut self,
        role: &'static str,
        targets: &[NormalizedPath],
        default: &str,
        bytes: &[u8],
    ) -> std::io::Result<Vec<String>> {
        let mut out = Vec::new();
        if targets.is_empty() {
            out.push(self.write(role, default, bytes).await?);
        } else {
            for target in targets {
                out.push(self.write(role, &target.relative, bytes).await?);
            }
        }
        Ok(out)
    }

    fn into_written(self) -> Vec<WrittenArtifact> {
        self.written
    }
}

fn pretty(value: &serde_json::Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec_pretty(value).unwrap_or_else(|_| value.to_string().into_bytes());
    bytes.push(b'\n');
    bytes
}

pub(crate) async fn execute(input: &PhaseInput<'_>) -> std::io::Result<PhaseOutput> {
    let mut writer = ArtifactWriter::new(input.repo_root);
    let artifacts = match input.phase {
        Phase::Ack => ack(input, &mut writer).await?,
        Phase::Plan => plan(input, &mut writer).await?,
        Phase::Borrow => borrow(input, &mut writer).await?,
        Phase::Diff => diff(input, &mut writer).await?,
        Phase::Cr => change_record(input, &mut writer).await?,
    };
    Ok(PhaseOutput {
        written: writer.into_written(),
        artifacts,
    })
}

async fn ack(input: &PhaseInput<'_>, writer: &mut ArtifactWriter<'_>) -> std::io::Result<PhaseArtifacts> {
    let manifest = json!({
        "phase": input.phase,
        "workflow_id": input.workflow_id,
        "run_id": input.run_id,
        "task": input.task,
        "notes": input.notes,
        "mode": input.mode,
        "requested_paths": input.targets.iter().map(|t| &t.requested).collect::<Vec<_>>(),
        "acknowledged_at": input.generated_at,
    });
    let default = format!("/.collab/ack/manifest-{}.json", input.suffix());
    let paths = writer
        .write_primary("manifest", input.targets, &default, &pretty(&manifest))
        .await?;
    Ok(PhaseArtifacts::Ack {
        manifest: paths.into_iter().next().unwrap_or_default(),
    })
}

async fn plan(input: &PhaseInput<'_>, writer: &mut ArtifactWriter<'_>) -> std::io::Result<PhaseArtifacts> {
    let doc = format!(
        "# Plan: {task}\n\n\
         - workflow: `{wf}`\n\
         - run: `{run}`\n\
         - mode: {mode}\n\
         - generated: {at}\n\n\
         ## Notes\n\n{notes}\n\n\
         ## Steps\n\n\
         1. Confirm scope and constraints for the task.\n\
         2. Borrow reference material and record its provenance.\n\
         3. Prepare the change as a reviewable diff with evidence.\n\
         4. File a change record for approval.\n",
        task = input.task.trim(),
        wf = input.workflow_id,
        run = input.run_id,
        mode = input.mode,
        at = input.generated_at,
        notes = input.notes_or_none(),
    );
    let suffix = input.suffix();
    let documents = writer
        .write_primary(
            "document",
            input.targets,
            &format!("/docs/kingbrain/plan/result-{suffix}.md"),
            doc.as_bytes(),
        )
        .await?;
    let manifest_doc = json!({
        "phase": input.phase,
        "workflow_id": input.workflow_id,
        "run_id": input.run_id,
        "documents": documents,
        "sha256": sha256_hex(doc.as_bytes()),
        "generated_at": input.generated_at,
    });
    let manifest = writer
        .write(
            "manifest",
            &format!("/.collab/plan/manifest-{suffix}.json"),
            &pretty(&manifest_doc),
        )
        .await?;
    Ok(PhaseArtifacts::Plan { documents, manifest })
}

async fn borrow(input: &PhaseInput<'_>, writer: &mut ArtifactWriter<'_>) -> std::io::Result<PhaseArtifacts> {
    let suffix = input.suffix();
    let provenance_rel = format!("/.collab/borrow/provenance-{suffix}.json");
    let sources = if input.targets.is_empty() {
        vec![ProvenanceRecord {
            source: format!("task:{}", input.workflow_id),
            stored_at: writer.resolve(&provenance_rel).to_string_lossy().into_owned(),
            sha256: sha256_hex(input.task.as_bytes()),
            retrieved_at: input.generated_at.to_string(),
        }]
    } else {
        let note = format!(
            "# Borrowed material\n\n\
             - task: {task}\n\
             - workflow: `{wf}`\n\
             - run: `{run}`\n\
             - retrieved: {at}\n\n{notes}\n",
            task = input.task.trim(),
            wf = input.workflow_id,
            run = input.run_id,
            at = input.generated_at,
            notes = input.notes_or_none(),
        );
        let mut records = Vec::new();
        for target in input.targets {
            let stored_at = writer.write("borrowed", &target.relative, note.as_bytes()).await?;
            records.push(ProvenanceRecord {
                source: target.requested.clone(),
                stored_at,
                sha256: sha256_hex(note.as_bytes()),
                retrieved_at: input.generated_at.to_string(),
            });
        }
        records
    };
    let provenance_doc = json!({
        "phase": input.phase,
        "workflow_id": input.workflow_id,
        "run_id": input.run_id,
        "task": input.task,
        "mode": input.mode,
        "sources": sources,
        "recorded_at": input.generated_at,
    });
    let provenance = writer
        .write("provenance", &provenance_rel, &pretty(&provenance_doc))
        .await?;
    Ok(PhaseArtifacts::Borrow { provenance, sources })
}

fn render_patch(target: &str, task: &str, notes: Option<&str>) -> String {
    let mut added = vec![format!("# {}", task.trim())];
    if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
        added.push(String::new());
        added.extend(notes.lines().map(str::to_string));
    }
    let mut patch = format!(
        "diff --git a/{target} b/{target}\nnew file mode 100644\n--- /dev/null\n+++ b/{target}\n@@ -0,0 +1,{} @@\n",
        added.len()
    );
    for line in added {
        patch.push('+');
        patch.push_str(&line);
        patch.push('\n');
    }
    patch
}

async fn diff(input: &PhaseInput<'_>, writer: &mut ArtifactWriter<'_>) -> std::io::Result<PhaseArtifacts> {
    let suffix = input.suffix();
    let target = input
        .targets
        .first()
        .map(|t| t.relative.trim_start_matches('/').to_string())
        .unwrap_or_else(|| format!("docs/kingbrain/diff/change-{suffix}.md"));
    let patch = render_patch(&target, input.task, input.notes);
    let patches = writer
        .write_primary(
            "patch",
            input.targets,
            &format!("/.collab/diff/patch-{suffix}.diff"),
            patch.as_bytes(),
        )
        .await?;
    let evidence_doc = json!({
        "phase": input.phase,
        "workflow_id": input.workflow_id,
        "run_id": input.run_id,
        "mode": input.mode,
        "patches": patches
            .iter()
            .map(|p| json!({"path": p, "sha256": sha256_hex(patch.as_bytes())}))
            .collect::<Vec<_>>(),
        "target": target,
        "generated_at": input.generated_at,
    });
    let evidence_bundle = writer
        .write(
            "evidence",
            &format!("/.collab/diff/evidence-{suffix}.json"),
            &pretty(&evidence_doc),
        )
        .await?;
    Ok(PhaseArtifacts::Diff {
        patches,
        evidence_bundle,
    })
}

async fn change_record(
    input: &PhaseInput<'_>,
    writer: &mut ArtifactWriter<'_>,
) -> std::io::Result<PhaseArtifacts> {
    let suffix = input.suffix();
    let change_id = format!("CR-{suffix}");
    let record = json!({
        "change_id": change_id,
        "title": input.task.trim(),
        "description": input.notes,
        "workflow_id": input.workflow_id,
        "run_id": input.run_id,
        "mode": input.mode,
        "status": "proposed",
        "created_at": input.generated_at,
    });
    let change_records = writer
        .write_primary(
            "change_record",
            input.targets,
            &format!("/.collab/cr/change-record-{suffix}.json"),
            &pretty(&record),
        )
        .await?;
    Ok(PhaseArtifacts::Cr {
        change_records,
        change_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(phase: Phase, root: &'a Path, targets: &'a [NormalizedPath]) -> PhaseInput<'a> {
        PhaseInput {
            phase,
            workflow_id: "0123456789abcdef",
            run_id: "fedcba9876543210",
            task: "Ship the thing",
            notes: Some("carefully"),
            mode: Mode::Simulated,
            targets,
            repo_root: root,
            generated_at: "2024-05-01T12:00:00.000Z",
        }
    }

    #[tokio::test]
    async fn plan_writes_document_and_manifest_at_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let out = execute(&input(Phase::Plan, dir.path(), &[])).await.unwrap();
        assert_eq!(out.written.len(), 2);
        let suffix = format!("01234567-{}", key_digest("0123456789abcdef", "fedcba9876543210"));
        let doc = dir.path().join(format!("docs/kingbrain/plan/result-{suffix}.md"));
        let manifest = dir.path().join(format!(".collab/plan/manifest-{suffix}.json"));
        assert!(doc.exists());
        assert!(manifest.exists());
        let text = std::fs::read_to_string(&doc).unwrap();
        assert!(text.starts_with("# Plan: Ship the thing"));
        assert_eq!(out.written[0].sha256, sha256_hex(text.as_bytes()));
        match out.artifacts {
            PhaseArtifacts::Plan { documents, manifest: m } => {
                assert_eq!(documents, vec![doc.to_string_lossy().into_owned()]);
                assert_eq!(m, manifest.to_string_lossy());
            }
            other => panic!("unexpected artifacts {other:?}"),
        }
    }

    #[tokio::test]
    async fn requested_paths_replace_primary_location() {
        let dir = tempfile::tempdir().unwrap();
        let targets = vec![
            NormalizedPath {
                requested: "/workspace/docs/a.md".into(),
                relative: "/docs/a.md".into(),
            },
            NormalizedPath {
                requested: "/workspace/docs/b.md".into(),
                relative: "/docs/b.md".into(),
            },
        ];
        let out = execute(&input(Phase::Plan, dir.path(), &targets)).await.unwrap();
        assert!(dir.path().join("docs/a.md").exists());
        assert!(dir.path().join("docs/b.md").exists());
        assert!(!dir.path().join("docs/kingbrain").exists());
        assert_eq!(out.written.len(), 3);
        assert_eq!(out.written[2].role, "manifest");
    }

    #[tokio::test]
    async fn borrow_records_provenance_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let targets = vec![NormalizedPath {
            requested: "docs/ref.md".into(),
            relative: "/docs/ref.md".into(),
        }];
        let out = execute(&input(Phase::Borrow, dir.path(), &targets)).await.unwrap();
        let PhaseArtifacts::Borrow { provenance, sources } = out.artifacts else {
            panic!("borrow artifacts expected");
        };
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source, "docs/ref.md");
        let stored = std::fs::read(&sources[0].stored_at).unwrap();
        assert_eq!(sources[0].sha256, sha256_hex(&stored));
        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(provenance).unwrap()).unwrap();
        assert_eq!(doc["sources"][0]["source"], "docs/ref.md");
    }

    #[tokio::test]
    async fn diff_and_cr_write_their_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out = execute(&input(Phase::Diff, dir.path(), &[])).await.unwrap();
        let suffix = format!("01234567-{}", key_digest("0123456789abcdef", "fedcba9876543210"));
        let patch = std::fs::read_to_string(dir.path().join(format!(".collab/diff/patch-{suffix}.diff")))
            .unwrap();
        assert!(patch.contains("@@ -0,0 +1,3 @@"));
        assert!(patch.contains("+# Ship the thing"));
        assert_eq!(out.written.len(), 2);

        let out = execute(&input(Phase::Cr, dir.path(), &[])).await.unwrap();
        let PhaseArtifacts::Cr { change_id, change_records } = out.artifacts else {
            panic!("cr artifacts expected");
        };
        assert_eq!(change_id, format!("CR-{suffix}"));
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&change_records[0]).unwrap()).unwrap();
        assert_eq!(record["status"], "proposed");
    }

    #[test]
    fn short_ids_are_kept_whole() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789"), "01234567");
    }

    #[test]
    fn key_digest_separates_workflow_and_run() {
        assert_eq!(key_digest("wf", "r1").len(), 16);
        assert_ne!(key_digest("wf", "r1"), key_digest("wf", "r2"));
        assert_ne!(key_digest("ab", "c"), key_digest("a", "bc"));
    }

    #[tokio::test]
    async fn runs_sharing_an_id_prefix_keep_their_own_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = input(Phase::Plan, dir.path(), &[]);
        first.workflow_id = "wf-project";
        first.run_id = "attempt-1";
        let mut second = input(Phase::Plan, dir.path(), &[]);
        second.workflow_id = "wf-project";
        second.run_id = "attempt-2";
        second.task = "A different task";

        let one = execute(&first).await.unwrap();
        let two = execute(&second).await.unwrap();
        for (a, b) in one.written.iter().zip(two.written.iter()) {
            assert_ne!(a.path, b.path);
        }
        for artifact in &one.written {
            let on_disk = std::fs::read(&artifact.path).unwrap();
            assert_eq!(sha256_hex(&on_disk), artifact.sha256, "{} changed", artifact.path);
        }
    }
}
