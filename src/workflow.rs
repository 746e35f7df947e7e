//! Git workflow automation for the supervisor lifecycle.
//!
//! The supervisor only sees the [`GitWorkflow`] capability trait; the
//! default implementation shells out to `git` (and `gh` for pull
//! requests). A null implementation is tolerated everywhere PRs or
//! commits are best-effort.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, instrument, warn};

/// Capability interface over the git operations the core invokes.
pub trait GitWorkflow {
    /// Clone the repository if needed, or validate an existing checkout.
    fn clone_or_open(&mut self) -> Result<()>;
    /// Create a worktree on a fresh branch from the detected base.
    fn create_worktree(&mut self, branch: &str) -> Result<()>;
    /// Stage and commit. `files` empty means stage everything. A clean
    /// tree is not an error.
    fn commit(&self, message: &str, files: &[String]) -> Result<()>;
    /// HEAD SHA of the working directory.
    fn current_commit(&self) -> Result<String>;
    /// Hard-reset the working directory to a commit.
    fn rollback(&self, sha: &str) -> Result<()>;
    /// Diff against a base ref.
    fn diff(&self, base: &str) -> Result<String>;
    /// Changed file paths against a base ref.
    fn diff_files(&self, base: &str) -> Result<Vec<String>>;
    /// Push and open a pull request, returning its URL.
    fn open_pr(&self, title: &str, body: &str) -> Result<String>;
    /// Directory the agent works in.
    fn worktree_path(&self) -> PathBuf;
    /// Branch the session commits to.
    fn branch_name(&self) -> String;
}

/// `git`/`gh` subprocess implementation.
pub struct GitCli {
    repo_url: String,
    base_dir: PathBuf,
    worktree_path: Option<PathBuf>,
    branch_name: String,
}

impl GitCli {
    /// `repo_url` empty means `base_dir` is already a checkout to operate
    /// in.
    pub fn new(repo_url: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            base_dir: base_dir.into(),
            worktree_path: None,
            branch_name: String::new(),
        }
    }

    /// Path of the primary clone.
    pub fn repo_dir(&self) -> PathBuf {
        if self.repo_url.is_empty() {
            return self.base_dir.clone();
        }
        self.base_dir.join(repo_name_from_url(&self.repo_url))
    }

    fn workdir(&self) -> PathBuf {
        self.worktree_path.clone().unwrap_or_else(|| self.repo_dir())
    }

    fn detect_base_branch(&self, repo_dir: &Path) -> String {
        let Ok(out) = self.run_capture(repo_dir, &["branch", "-r"]) else {
            return "main".to_string();
        };
        if out.contains("origin/main") {
            return "origin/main".to_string();
        }
        if out.contains("origin/master") {
            return "origin/master".to_string();
        }
        "HEAD".to_string()
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        debug!(?args, dir = %dir.display(), "git");
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.run(dir, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(output)
    }

    fn run_capture(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.run_checked(dir, args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl GitWorkflow for GitCli {
    #[instrument(skip_all)]
    fn clone_or_open(&mut self) -> Result<()> {
        if self.repo_url.is_empty() {
            let git_dir = self.base_dir.join(".git");
            if !git_dir.exists() {
                bail!("not a git repository: {}", self.base_dir.display());
            }
            info!(path = %self.base_dir.display(), "using existing repository");
            return Ok(());
        }

        let repo_dir = self.repo_dir();
        if repo_dir.join(".git").exists() {
            info!(path = %repo_dir.display(), "repository already cloned");
            self.run_checked(&repo_dir, &["fetch", "origin"])?;
            return Ok(());
        }

        info!(url = %self.repo_url, path = %repo_dir.display(), "cloning repository");
        let output = Command::new("git")
            .args(["clone", &self.repo_url])
            .arg(&repo_dir)
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            bail!(
                "git clone failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    fn create_worktree(&mut self, branch: &str) -> Result<()> {
        let branch = if branch.is_empty() {
            format!(
                "feat/agentbox-sprint-{}",
                chrono::Utc::now().format("%Y%m%d-%H%M")
            )
        } else {
            branch.to_string()
        };
        self.branch_name = branch.clone();

        let repo_dir = self.repo_dir();
        let base_branch = self.detect_base_branch(&repo_dir);

        // The worktree lands beside the primary clone.
        let worktree_name = branch.replace('/', "-");
        let parent = repo_dir
            .parent()
            .ok_or_else(|| anyhow!("repo dir {} has no parent", repo_dir.display()))?;
        let worktree_path = parent.join(worktree_name);

        info!(
            branch = %branch,
            base = %base_branch,
            path = %worktree_path.display(),
            "creating worktree"
        );
        let worktree_str = worktree_path.to_string_lossy().to_string();
        self.run_checked(
            &repo_dir,
            &["worktree", "add", "-b", &branch, &worktree_str, &base_branch],
        )
        .context("create worktree")?;

        self.worktree_path = Some(worktree_path);
        Ok(())
    }

    fn commit(&self, message: &str, files: &[String]) -> Result<()> {
        let dir = self.workdir();

        if files.is_empty() {
            self.run_checked(&dir, &["add", "-A"])?;
        } else {
            let mut args = vec!["add"];
            args.extend(files.iter().map(String::as_str));
            self.run_checked(&dir, &args)?;
        }

        let status = self.run_capture(&dir, &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            debug!("nothing to commit");
            return Ok(());
        }

        self.run_checked(&dir, &["commit", "-m", message])?;
        Ok(())
    }

    fn current_commit(&self) -> Result<String> {
        let out = self.run_capture(&self.workdir(), &["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    fn rollback(&self, sha: &str) -> Result<()> {
        warn!(commit = %sha, "rolling back");
        self.run_checked(&self.workdir(), &["reset", "--hard", sha])?;
        Ok(())
    }

    fn diff(&self, base: &str) -> Result<String> {
        self.run_capture(&self.workdir(), &["diff", &format!("{base}...HEAD")])
    }

    fn diff_files(&self, base: &str) -> Result<Vec<String>> {
        let out = self.run_capture(
            &self.workdir(),
            &["diff", "--name-only", &format!("{base}...HEAD")],
        )?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip_all)]
    fn open_pr(&self, title: &str, body: &str) -> Result<String> {
        let dir = self.workdir();
        self.run_checked(&dir, &["push", "-u", "origin", &self.branch_name])
            .context("push branch")?;

        let output = Command::new("gh")
            .args(["pr", "create", "--title", title, "--body", body])
            .current_dir(&dir)
            .output()
            .context("spawn gh pr create")?;
        if !output.status.success() {
            bail!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(url = %url, "pull request created");
        Ok(url)
    }

    fn worktree_path(&self) -> PathBuf {
        self.workdir()
    }

    fn branch_name(&self) -> String {
        self.branch_name.clone()
    }
}

/// Workflow that does nothing. PR and commit operations succeed without
/// side effects; the worktree is a fixed directory.
pub struct NullGitWorkflow {
    workdir: PathBuf,
}

impl NullGitWorkflow {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

impl GitWorkflow for NullGitWorkflow {
    fn clone_or_open(&mut self) -> Result<()> {
        Ok(())
    }

    fn create_worktree(&mut self, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _message: &str, _files: &[String]) -> Result<()> {
        Ok(())
    }

    fn current_commit(&self) -> Result<String> {
        Ok(String::new())
    }

    fn rollback(&self, _sha: &str) -> Result<()> {
        Ok(())
    }

    fn diff(&self, _base: &str) -> Result<String> {
        Ok(String::new())
    }

    fn diff_files(&self, _base: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn open_pr(&self, _title: &str, _body: &str) -> Result<String> {
        bail!("pull requests are disabled for the null workflow")
    }

    fn worktree_path(&self) -> PathBuf {
        self.workdir.clone()
    }

    fn branch_name(&self) -> String {
        String::new()
    }
}

fn repo_name_from_url(url: &str) -> String {
    let url = url.trim_end_matches(".git");
    url.rsplit('/').next().unwrap_or("repo").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn repo_name_extraction() {
        assert_eq!(repo_name_from_url("https://example.com/org/widget.git"), "widget");
        assert_eq!(repo_name_from_url("git@example.com:org/widget"), "widget");
    }

    #[test]
    fn clone_or_open_validates_existing_checkout() {
        let repo = TestRepo::new().expect("repo");
        let mut workflow = GitCli::new("", repo.root());
        workflow.clone_or_open().expect("open");

        let mut bad = GitCli::new("", repo.base().join("not-a-repo"));
        let err = bad.clone_or_open().expect_err("missing repo");
        assert!(err.to_string().contains("not a git repository"));
    }

    #[test]
    fn worktree_commit_and_diff_cycle() {
        let repo = TestRepo::new().expect("repo");
        let mut workflow = GitCli::new("", repo.root());
        workflow.clone_or_open().expect("open");
        workflow.create_worktree("feat/test-run").expect("worktree");

        let worktree = workflow.worktree_path();
        assert!(worktree.join("README.md").exists());
        assert_eq!(workflow.branch_name(), "feat/test-run");

        let before = workflow.current_commit().expect("sha");
        std::fs::write(worktree.join("new.txt"), "content\n").expect("write");
        workflow.commit("feat: add new file", &[]).expect("commit");
        let after = workflow.current_commit().expect("sha");
        assert_ne!(before, after);

        let files = workflow.diff_files(&before).expect("diff files");
        assert_eq!(files, vec!["new.txt"]);
        let diff = workflow.diff(&before).expect("diff");
        assert!(diff.contains("new.txt"));

        // A second commit call with a clean tree is a no-op.
        workflow.commit("noop", &[]).expect("clean commit");
        assert_eq!(workflow.current_commit().expect("sha"), after);

        workflow.rollback(&before).expect("rollback");
        assert_eq!(workflow.current_commit().expect("sha"), before);
    }

    #[test]
    fn null_workflow_tolerates_everything_but_prs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut workflow = NullGitWorkflow::new(temp.path());
        workflow.clone_or_open().expect("open");
        workflow.create_worktree("x").expect("worktree");
        workflow.commit("msg", &[]).expect("commit");
        assert_eq!(workflow.current_commit().expect("sha"), "");
        assert!(workflow.open_pr("t", "b").is_err());
    }
}
