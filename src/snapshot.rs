//! Per-round codebase snapshots.
//!
//! [`SnapshotStore`] records the state of one codebase at the end of every round and answers
//! diff queries between rounds. [`GitSnapshotStore`] keeps the snapshots as annotated tags in a
//! git repository living inside the player's sandbox.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{bail, Context};
use tracing::{debug, warn};

use crate::sandbox::{quote, Sandbox};

/// Scratch file for patches, relative to the sandbox root so that `git clean` never sees it.
const PATCH_FILE: &str = "arena_patch.diff";

/// Extensions treated as source code when collecting modified files.
const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "rs", "c", "h", "cc", "cpp", "hpp", "java", "go", "rb", "ml",
    "mli", "hs", "cs", "kt", "swift", "php", "lua", "sh", "red", "json", "yaml", "yml", "toml",
    "txt", "md",
];

/// Append-only store of round snapshots for one codebase.
pub trait SnapshotStore: Send {
    /// Prepare the store on `branch`, optionally starting from the existing `branch_init`.
    /// Returns the initial commit reference.
    fn initialize(&mut self, branch: &str, branch_init: Option<&str>) -> anyhow::Result<String>;

    /// Record every change in the working tree. An unchanged tree still gets a commit.
    fn commit(&mut self, message: &str) -> anyhow::Result<()>;

    /// Mark the current commit as the snapshot of `round`. Tagging the same round twice is a no-op.
    fn tag_round(&mut self, round: usize) -> anyhow::Result<String>;

    /// Whether `round` has been tagged.
    fn has_round(&self, round: usize) -> bool;

    /// Unified diff from snapshot `from` to snapshot `to`. Empty when `from == to`.
    fn diff(&self, from: usize, to: usize) -> anyhow::Result<String>;

    /// Discard uncommitted changes, reset to `base` (or the current head) and apply `patch`.
    /// An empty patch only resets.
    fn reset_and_apply(&mut self, patch: &str, base: Option<&str>) -> anyhow::Result<()>;

    /// Current commit reference.
    fn head(&self) -> anyhow::Result<String>;

    /// Push `branch` and every tag to `remote`.
    fn publish(&self, remote: &str, branch: &str) -> anyhow::Result<()>;
}

/// Git repository in the codebase directory of a sandbox.
#[derive(Debug)]
pub struct GitSnapshotStore {
    sandbox: Arc<dyn Sandbox>,
    tag_prefix: String,
    tags: BTreeMap<usize, String>,
}

impl GitSnapshotStore {
    /// Tags are named `<tag_prefix>-round-<n>`.
    pub fn new(sandbox: Arc<dyn Sandbox>, tag_prefix: &str) -> Self {
        Self {
            sandbox,
            tag_prefix: tag_prefix.to_string(),
            tags: BTreeMap::new(),
        }
    }

    /// Tag name used for `round`.
    pub fn tag_name(&self, round: usize) -> String {
        format!("{}-round-{round}", self.tag_prefix)
    }

    fn git(&self, command: &str) -> anyhow::Result<String> {
        Ok(self.sandbox.execute_checked(command, None, None)?.output)
    }

    fn tag(&self, round: usize) -> anyhow::Result<&str> {
        self.tags
            .get(&round)
            .map(String::as_str)
            .with_context(|| format!("round {round} has no snapshot"))
    }
}

impl SnapshotStore for GitSnapshotStore {
    fn initialize(&mut self, branch: &str, branch_init: Option<&str>) -> anyhow::Result<String> {
        let probe = self
            .sandbox
            .execute("git rev-parse --is-inside-work-tree", None, None)?;
        if !probe.success() {
            debug!("Initializing repository in {}", self.sandbox.name());
            self.git("git init -q")?;
        }
        self.git(
            "git config user.email 'arena@localhost' && git config user.name 'arena' \
             && git config commit.gpgsign false && git config tag.gpgsign false",
        )?;
        let has_head = self
            .sandbox
            .execute("git rev-parse --verify -q HEAD", None, None)?
            .success();
        if !has_head {
            self.git("git add -A && git commit -q --allow-empty -m 'Initial codebase'")?;
        }
        if let Some(init) = branch_init {
            self.git(&format!("git checkout -q {}", quote(init)))
                .with_context(|| format!("could not checkout {init}"))?;
        }
        self.git(&format!("git checkout -q -B {}", quote(branch)))?;
        self.head()
    }

    fn commit(&mut self, message: &str) -> anyhow::Result<()> {
        self.git(&format!(
            "git add -A && git commit -q --allow-empty -m {}",
            quote(message)
        ))?;
        Ok(())
    }

    fn tag_round(&mut self, round: usize) -> anyhow::Result<String> {
        if let Some(tag) = self.tags.get(&round) {
            return Ok(tag.clone());
        }
        let tag = self.tag_name(round);
        self.git(&format!(
            "git tag -a {} -m {}",
            quote(&tag),
            quote(&format!("Round {round} Update"))
        ))?;
        self.tags.insert(round, tag.clone());
        Ok(tag)
    }

    fn has_round(&self, round: usize) -> bool {
        self.tags.contains_key(&round)
    }

    fn diff(&self, from: usize, to: usize) -> anyhow::Result<String> {
        if from == to {
            return Ok(String::new());
        }
        let from = self.tag(from)?;
        let to = self.tag(to)?;
        self.git(&format!("git diff {from}..{to}"))
    }

    fn reset_and_apply(&mut self, patch: &str, base: Option<&str>) -> anyhow::Result<()> {
        let base = base.map(quote).unwrap_or_default();
        self.git(&format!("git reset -q --hard {base} && git clean -fdq"))?;
        let patch = filter_binary_sections(patch);
        if patch.trim().is_empty() {
            debug!("No patch to apply to {}", self.sandbox.name());
            return Ok(());
        }
        self.sandbox
            .write_file(&patch, PATCH_FILE)
            .context("could not write patch")?;
        let file = quote(&self.sandbox.resolve(PATCH_FILE));
        let result = self.git(&format!("git apply --whitespace=nowarn {file}"));
        if let Err(e) = self.sandbox.execute(&format!("rm -f {file}"), None, None) {
            warn!("Could not remove patch file: {e}");
        }
        result.map(|_| ()).context("could not apply patch")
    }

    fn head(&self) -> anyhow::Result<String> {
        Ok(self.git("git rev-parse HEAD")?.trim().to_string())
    }

    fn publish(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        if remote.is_empty() {
            bail!("no remote to publish to");
        }
        let remote = quote(remote);
        let branch = quote(branch);
        self.git(&format!("git push -q {remote} {branch}"))?;
        self.git(&format!("git push -q {remote} --tags"))?;
        Ok(())
    }
}

fn is_binary_section(section: &[&str]) -> bool {
    section
        .iter()
        .any(|line| line.starts_with("Binary files ") || line.trim() == "GIT binary patch")
}

fn section_path<'a>(section: &[&'a str]) -> &'a str {
    section
        .first()
        .and_then(|header| header.split_whitespace().nth(2))
        .map(|path| path.strip_prefix("a/").unwrap_or(path))
        .unwrap_or("unknown file")
}

/// Drop every per-file section of a unified diff that carries binary content.
///
/// Lines before the first `diff --git` header are kept as they are.
pub fn filter_binary_sections(diff: &str) -> String {
    fn flush(section: &mut Vec<&str>, out: &mut String) {
        if section.is_empty() {
            return;
        }
        if is_binary_section(section) {
            warn!("Binary file detected in diff: {}", section_path(section));
        } else {
            out.extend(section.iter().copied());
        }
        section.clear();
    }

    let mut out = String::with_capacity(diff.len());
    let mut section: Vec<&str> = Vec::new();
    for line in diff.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            flush(&mut section, &mut out);
            section.push(line);
        } else if section.is_empty() {
            out.push_str(line);
        } else {
            section.push(line);
        }
    }
    flush(&mut section, &mut out);
    out
}

/// Paths of the source files touched by `diff`, in diff order, without duplicates.
///
/// Deleted files are included; their content is recorded as empty by callers.
pub fn modified_code_paths(diff: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for line in diff.lines() {
        let Some(rest) = line.strip_prefix("diff --git ") else {
            continue;
        };
        let Some(path) = rest
            .split_whitespace()
            .nth(1)
            .map(|p| p.strip_prefix("b/").unwrap_or(p))
        else {
            continue;
        };
        let is_code = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| CODE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_code && !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}
