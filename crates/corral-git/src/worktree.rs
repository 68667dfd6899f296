//! The per-instance worktree record and its lifecycle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use corral_types::CorralError;

use crate::command::GitCli;

/// Diff summary of an instance branch against its base commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    /// The unified patch text.
    pub content: String,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Serializable form of a [`Worktree`], stored in the supervisor snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub repo_path: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    /// Commit the branch was created from; empty until `setup()` ran.
    #[serde(default)]
    pub base_commit: String,
    /// Owning instance title.
    pub session_name: String,
}

/// Version-control isolation for one instance.
///
/// The record persists across pause/resume cycles: `remove()` deletes the
/// working tree but keeps the branch, `setup()` recreates the tree for the
/// preserved branch, `cleanup()` destroys both.
#[derive(Debug, Clone)]
pub struct Worktree {
    git: GitCli,
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch: String,
    base_commit: String,
    session_name: String,
}

impl Worktree {
    /// Build a new record for an instance. The working tree is not created
    /// until [`setup`](Self::setup).
    ///
    /// The branch is `<prefix><title>`; titles are unique per fleet, so the
    /// mapping is injective.
    pub fn new(
        repo_path: &Path,
        title: &str,
        branch_prefix: &str,
        worktrees_root: &Path,
    ) -> Result<Self, CorralError> {
        let git = GitCli::default();
        // Resolve to the repository root so `git worktree` invocations agree
        // on paths no matter which subdirectory the instance was created from.
        let toplevel = git.run(repo_path, ["rev-parse", "--show-toplevel"])?;
        let repo_path = PathBuf::from(toplevel.trim());

        Ok(Self {
            git,
            repo_path,
            worktree_path: worktrees_root.join(title),
            branch: format!("{branch_prefix}{title}"),
            base_commit: String::new(),
            session_name: title.to_string(),
        })
    }

    /// Rehydrate from a stored record.
    pub fn from_record(record: WorktreeRecord) -> Self {
        Self {
            git: GitCli::default(),
            repo_path: record.repo_path,
            worktree_path: record.worktree_path,
            branch: record.branch,
            base_commit: record.base_commit,
            session_name: record.session_name,
        }
    }

    pub fn record(&self) -> WorktreeRecord {
        WorktreeRecord {
            repo_path: self.repo_path.clone(),
            worktree_path: self.worktree_path.clone(),
            branch: self.branch.clone(),
            base_commit: self.base_commit.clone(),
            session_name: self.session_name.clone(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    fn branch_exists(&self) -> bool {
        let refname = format!("refs/heads/{}", self.branch);
        self.git
            .run(&self.repo_path, ["show-ref", "--verify", refname.as_str()])
            .is_ok()
    }

    /// Create the working tree (and the branch, first time around).
    ///
    /// Records the base commit on first setup so later diffs are meaningful;
    /// resume keeps the original base.
    pub fn setup(&mut self) -> Result<(), CorralError> {
        if let Some(parent) = self.worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CorralError::Vcs {
                    command: format!("create_dir_all {}", parent.display()),
                    status: None,
                    stderr: e.to_string(),
                }
            })?;
        }

        let path_arg = self.worktree_path.to_string_lossy().into_owned();
        if self.branch_exists() {
            self.git.run(
                &self.repo_path,
                ["worktree", "add", path_arg.as_str(), self.branch.as_str()],
            )?;
        } else {
            let head = self.git.run(&self.repo_path, ["rev-parse", "HEAD"])?;
            let head = head.trim().to_string();
            self.git.run(
                &self.repo_path,
                [
                    "worktree",
                    "add",
                    "-b",
                    self.branch.as_str(),
                    path_arg.as_str(),
                    head.as_str(),
                ],
            )?;
            self.base_commit = head;
        }

        debug!(
            branch = self.branch,
            path = %self.worktree_path.display(),
            "worktree ready"
        );
        Ok(())
    }

    /// Remove the working tree, preserving the branch.
    pub fn remove(&self) -> Result<(), CorralError> {
        if !self.worktree_path.exists() {
            return Err(CorralError::NotSetup(format!(
                "no working tree at {}",
                self.worktree_path.display()
            )));
        }
        let path_arg = self.worktree_path.to_string_lossy().into_owned();
        self.git.run(
            &self.repo_path,
            ["worktree", "remove", "--force", path_arg.as_str()],
        )?;
        Ok(())
    }

    /// Drop stale worktree administrative records in the shared repository.
    pub fn prune(&self) -> Result<(), CorralError> {
        self.git.run(&self.repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    /// Destroy the working tree and the branch. Best-effort: every step runs
    /// and failures are combined.
    pub fn cleanup(&self) -> Result<(), CorralError> {
        let mut errs = Vec::new();

        if self.worktree_path.exists() {
            if let Err(e) = self.remove() {
                errs.push(e);
            }
        }
        if let Err(e) = self.prune() {
            errs.push(e);
        }
        if self.branch_exists() {
            if let Err(e) = self
                .git
                .run(&self.repo_path, ["branch", "-D", self.branch.as_str()])
            {
                errs.push(e);
            }
        }

        CorralError::combine(errs)
    }

    /// Whether the working tree has uncommitted changes.
    pub fn is_dirty(&self) -> Result<bool, CorralError> {
        if !self.worktree_path.exists() {
            return Err(CorralError::NotSetup(format!(
                "no working tree at {}",
                self.worktree_path.display()
            )));
        }
        let out = self
            .git
            .run(&self.worktree_path, ["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    /// Whether the branch is checked out anywhere other than this record's
    /// own working tree (the operator's main checkout counts).
    pub fn is_branch_checked_out(&self) -> Result<bool, CorralError> {
        let out = self
            .git
            .run(&self.repo_path, ["worktree", "list", "--porcelain"])?;
        let own = canonical_or(&self.worktree_path);
        for entry in parse_worktree_list(&out) {
            if entry.branch.as_deref() == Some(self.branch.as_str())
                && canonical_or(&entry.path) != own
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stage everything and commit; optionally push the branch upstream.
    pub fn push_changes(&self, message: &str, push_remote: bool) -> Result<(), CorralError> {
        if !self.worktree_path.exists() {
            return Err(CorralError::NotSetup(format!(
                "no working tree at {}",
                self.worktree_path.display()
            )));
        }
        self.git.run(&self.worktree_path, ["add", "-A"])?;
        match self
            .git
            .run(&self.worktree_path, ["commit", "-m", message])
        {
            Ok(_) => {}
            // A racing auto-commit can empty the index between add and commit.
            Err(CorralError::Vcs { ref stderr, .. })
                if stderr.contains("nothing to commit")
                    || stderr.contains("nothing added to commit") => {}
            Err(e) => return Err(e),
        }

        if push_remote {
            self.git.run(
                &self.worktree_path,
                ["push", "--set-upstream", "origin", self.branch.as_str()],
            )?;
        }
        Ok(())
    }

    /// Diff the working tree against the recorded base commit.
    pub fn diff(&self) -> Result<DiffStats, CorralError> {
        if self.base_commit.is_empty() {
            return Err(CorralError::NotSetup("base commit SHA not set".into()));
        }
        let content = self
            .git
            .run(&self.worktree_path, ["diff", self.base_commit.as_str()])?;

        let mut added = 0;
        let mut removed = 0;
        for line in content.lines() {
            if line.starts_with('+') && !line.starts_with("+++") {
                added += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                removed += 1;
            }
        }
        Ok(DiffStats {
            added,
            removed,
            content,
        })
    }
}

fn canonical_or(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug)]
struct ListedWorktree {
    path: PathBuf,
    branch: Option<String>,
}

fn parse_worktree_list(raw: &str) -> Vec<ListedWorktree> {
    let mut listed = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;

    for line in raw.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if let Some(path) = current_path.take() {
                listed.push(ListedWorktree {
                    path,
                    branch: current_branch.take(),
                });
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest.trim()));
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.trim().trim_start_matches("refs/heads/").to_string());
        }
    }
    listed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo(root: &Path) {
        fs::create_dir_all(root).unwrap();
        run_git(root, &["init"]);
        run_git(root, &["config", "user.name", "Test User"]);
        run_git(root, &["config", "user.email", "test@example.com"]);
        fs::write(root.join("README.md"), "init\n").unwrap();
        run_git(root, &["add", "README.md"]);
        run_git(root, &["commit", "-m", "init"]);
    }

    fn fixture() -> (tempfile::TempDir, Worktree) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        init_repo(&repo);
        let worktree = Worktree::new(&repo, "feat", "tester/", &tmp.path().join("worktrees"))
            .expect("create worktree record");
        (tmp, worktree)
    }

    #[test]
    fn setup_creates_branch_and_working_tree() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();

        assert!(wt.worktree_path().exists());
        assert_eq!(wt.branch(), "tester/feat");
        assert!(!wt.base_commit().is_empty());
        assert!(wt.branch_exists());
    }

    #[test]
    fn remove_preserves_branch_and_resetup_reuses_it() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();
        let base = wt.base_commit().to_string();

        fs::write(wt.worktree_path().join("work.txt"), "x\n").unwrap();
        wt.push_changes("wip", false).unwrap();

        wt.remove().unwrap();
        wt.prune().unwrap();
        assert!(!wt.worktree_path().exists());
        assert!(wt.branch_exists());

        wt.setup().unwrap();
        assert!(wt.worktree_path().join("work.txt").exists());
        assert_eq!(wt.base_commit(), base, "resume keeps the original base");
    }

    #[test]
    fn cleanup_removes_tree_and_branch() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();
        wt.cleanup().unwrap();

        assert!(!wt.worktree_path().exists());
        assert!(!wt.branch_exists());

        // Idempotent: everything already gone.
        wt.cleanup().unwrap();
    }

    #[test]
    fn dirty_detection() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();
        assert!(!wt.is_dirty().unwrap());

        fs::write(wt.worktree_path().join("new.txt"), "hello\n").unwrap();
        assert!(wt.is_dirty().unwrap());
    }

    #[test]
    fn dirty_check_requires_working_tree() {
        let (_tmp, wt) = fixture();
        let err = wt.is_dirty().unwrap_err();
        assert!(matches!(err, CorralError::NotSetup(_)));
    }

    #[test]
    fn branch_checked_out_elsewhere_is_detected() {
        let (tmp, mut wt) = fixture();
        wt.setup().unwrap();
        assert!(
            !wt.is_branch_checked_out().unwrap(),
            "own worktree does not count"
        );

        // Simulate the operator checking the branch out in the main repo:
        // remove our worktree first so the branch is free.
        wt.remove().unwrap();
        let repo = tmp.path().join("repo");
        run_git(&repo, &["checkout", "tester/feat"]);
        assert!(wt.is_branch_checked_out().unwrap());
    }

    #[test]
    fn push_changes_commits_with_message() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();
        fs::write(wt.worktree_path().join("a.txt"), "a\n").unwrap();
        wt.push_changes("[corral] update from 'feat' (paused)", false)
            .unwrap();

        let git = GitCli::default();
        let log = git
            .run(wt.worktree_path(), ["log", "-1", "--pretty=%s"])
            .unwrap();
        assert!(log.contains("update from 'feat'"));
        assert!(!wt.is_dirty().unwrap());
    }

    #[test]
    fn push_changes_with_clean_tree_is_ok() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();
        wt.push_changes("noop", false).unwrap();
    }

    #[test]
    fn diff_counts_added_and_removed_lines() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();

        fs::write(wt.worktree_path().join("README.md"), "changed\n").unwrap();
        // Committed changes still diff against the base commit.
        wt.push_changes("edit", false).unwrap();

        let stats = wt.diff().unwrap();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.removed, 1);
        assert!(stats.content.contains("-init"));
        assert!(stats.content.contains("+changed"));
    }

    #[test]
    fn diff_without_base_commit_reports_not_setup() {
        let (_tmp, wt) = fixture();
        let err = wt.diff().unwrap_err();
        match err {
            CorralError::NotSetup(msg) => assert!(msg.contains("base commit")),
            other => panic!("expected NotSetup, got {other:?}"),
        }
    }

    #[test]
    fn record_round_trip() {
        let (_tmp, mut wt) = fixture();
        wt.setup().unwrap();
        let record = wt.record();
        let restored = Worktree::from_record(record.clone());
        assert_eq!(restored.record(), record);
    }

    #[test]
    fn parse_worktree_list_entries() {
        let raw = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.corral/wt/feat
HEAD 2222222222222222222222222222222222222222
branch refs/heads/tester/feat

worktree /repo/.corral/wt/detached
HEAD 3333333333333333333333333333333333333333
detached

";
        let parsed = parse_worktree_list(raw);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].branch.as_deref(), Some("main"));
        assert_eq!(parsed[1].branch.as_deref(), Some("tester/feat"));
        assert_eq!(parsed[2].branch, None);
    }
}
