//! Scripted fakes and fixtures for tests.
//!
//! Compiled only with the `test-support` feature (enabled for this crate's
//! own tests via dev-dependencies).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::core::types::AttemptOutcome;
use crate::io::agent::{Agent, AgentRequest, AgentRun};
use crate::io::tracker::{Issue, NewIssue, SearchQuery, Tracker, Transition};

/// A minimal Idea issue.
pub fn idea(key: &str, summary: &str) -> Issue {
    Issue {
        key: key.to_string(),
        summary: summary.to_string(),
        description: String::new(),
        labels: Vec::new(),
        status: "To Do".to_string(),
        status_category: "To Do".to_string(),
        issue_type: "Idea".to_string(),
        parent: None,
    }
}

/// In-memory tracker fake with the same observable semantics as the HTTP
/// client: label search, key lookup, creation with generated keys,
/// comments, and a single transition into the Done category.
#[derive(Default)]
pub struct InMemoryTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    issues: BTreeMap<String, Issue>,
    comments: BTreeMap<String, Vec<String>>,
    next_id: u32,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an issue.
    pub fn insert(&self, issue: Issue) {
        let mut state = self.inner.lock().unwrap();
        state.issues.insert(issue.key.clone(), issue);
    }

    pub fn insert_epic(&self, key: &str, summary: &str, labels: &[&str]) {
        self.insert(Issue {
            key: key.to_string(),
            summary: summary.to_string(),
            description: String::new(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            status: "To Do".to_string(),
            status_category: "To Do".to_string(),
            issue_type: "Epic".to_string(),
            parent: None,
        });
    }

    pub fn insert_story(&self, key: &str, summary: &str, parent: &str, labels: &[&str]) {
        self.insert_story_with_description(key, summary, parent, "", labels);
    }

    pub fn insert_story_with_description(
        &self,
        key: &str,
        summary: &str,
        parent: &str,
        description: &str,
        labels: &[&str],
    ) {
        self.insert(Issue {
            key: key.to_string(),
            summary: summary.to_string(),
            description: description.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            status: "To Do".to_string(),
            status_category: "To Do".to_string(),
            issue_type: "Story".to_string(),
            parent: Some(parent.to_string()),
        });
    }

    /// Comments posted to an issue, oldest first.
    pub fn comments(&self, key: &str) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state.comments.get(key).cloned().unwrap_or_default()
    }

    pub fn issues_of_type(&self, issue_type: &str) -> Vec<Issue> {
        let state = self.inner.lock().unwrap();
        state
            .issues
            .values()
            .filter(|issue| issue.issue_type == issue_type)
            .cloned()
            .collect()
    }
}

impl Tracker for InMemoryTracker {
    fn search(&self, query: &SearchQuery) -> Result<Vec<Issue>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .issues
            .values()
            .filter(|issue| {
                query
                    .status_category
                    .as_ref()
                    .is_none_or(|c| issue.status_category.eq_ignore_ascii_case(c))
                    && query
                        .issue_type
                        .as_ref()
                        .is_none_or(|t| &issue.issue_type == t)
                    && query
                        .labels
                        .iter()
                        .all(|label| issue.labels.contains(label))
                    && query
                        .parent
                        .as_ref()
                        .is_none_or(|p| issue.parent.as_ref() == Some(p))
            })
            .cloned()
            .collect())
    }

    fn get(&self, key: &str) -> Result<Issue> {
        let state = self.inner.lock().unwrap();
        state
            .issues
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("issue {key} not found"))
    }

    fn create(&self, issue: &NewIssue) -> Result<String> {
        let mut state = self.inner.lock().unwrap();
        state.next_id += 1;
        let prefix = match issue.issue_type.as_str() {
            "Epic" => "EP",
            "Story" => "ST",
            other => bail!("unexpected issue type '{other}'"),
        };
        let key = format!("{prefix}-{:03}", 100 + state.next_id);
        state.issues.insert(
            key.clone(),
            Issue {
                key: key.clone(),
                summary: issue.summary.clone(),
                description: issue.description.clone(),
                labels: issue.labels.clone(),
                status: "To Do".to_string(),
                status_category: "To Do".to_string(),
                issue_type: issue.issue_type.clone(),
                parent: issue.parent.clone(),
            },
        );
        Ok(key)
    }

    fn add_labels(&self, key: &str, labels: &[String]) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let issue = state
            .issues
            .get_mut(key)
            .ok_or_else(|| anyhow!("issue {key} not found"))?;
        for label in labels {
            if !issue.labels.contains(label) {
                issue.labels.push(label.clone());
            }
        }
        Ok(())
    }

    fn add_comment(&self, key: &str, body: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state
            .comments
            .entry(key.to_string())
            .or_default()
            .push(body.to_string());
        Ok(())
    }

    fn transitions(&self, _key: &str) -> Result<Vec<Transition>> {
        Ok(vec![Transition {
            id: "31".to_string(),
            name: "Done".to_string(),
            to_status_category: "Done".to_string(),
        }])
    }

    fn transition(&self, key: &str, _transition_id: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let issue = state
            .issues
            .get_mut(key)
            .ok_or_else(|| anyhow!("issue {key} not found"))?;
        issue.status = "Done".to_string();
        issue.status_category = "Done".to_string();
        Ok(())
    }
}

/// Scripted agent that edits files directly instead of spawning a process.
pub struct ScriptedAgent {
    state: Mutex<ScriptedState>,
}

struct ScriptedState {
    root: PathBuf,
    /// Scripted edits per run, each a set of (path, content) writes. A run
    /// past the end of the script repeats the last set.
    edits: Vec<Vec<(String, String)>>,
    /// Output and outcome when no edit is scripted.
    failure_output: Option<String>,
    runs: usize,
    last_timeout: Option<Duration>,
}

impl ScriptedAgent {
    /// Succeeds every run, writing `content` to `path` and checking the
    /// report checklist like a well-behaved agent.
    pub fn success_editing(root: &Path, path: &str, content: &str) -> Self {
        Self::sequence(root, vec![(path, content)])
    }

    /// One scripted edit per run, repeating the last.
    pub fn sequence(root: &Path, edits: Vec<(&str, &str)>) -> Self {
        Self::sequence_many(
            root,
            edits.into_iter().map(|edit| vec![edit]).collect(),
        )
    }

    /// A set of file writes per run, repeating the last set.
    pub fn sequence_many(root: &Path, edits: Vec<Vec<(&str, &str)>>) -> Self {
        Self {
            state: Mutex::new(ScriptedState {
                root: root.to_path_buf(),
                edits: edits
                    .into_iter()
                    .map(|set| {
                        set.into_iter()
                            .map(|(path, content)| (path.to_string(), content.to_string()))
                            .collect()
                    })
                    .collect(),
                failure_output: None,
                runs: 0,
                last_timeout: None,
            }),
        }
    }

    /// Fails every run with the given combined output.
    pub fn failing_with_output(output: &str) -> Self {
        Self {
            state: Mutex::new(ScriptedState {
                root: PathBuf::new(),
                edits: Vec::new(),
                failure_output: Some(output.to_string()),
                runs: 0,
                last_timeout: None,
            }),
        }
    }

    pub fn runs(&self) -> usize {
        self.state.lock().unwrap().runs
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().last_timeout
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        let mut state = self.state.lock().unwrap();
        let run_index = state.runs;
        state.runs += 1;
        state.last_timeout = Some(request.timeout);

        fs::create_dir_all(&request.transcript_dir).context("transcript dir")?;
        let transcript_path = request.transcript_dir.join("agent.log");

        if let Some(output) = &state.failure_output {
            fs::write(&transcript_path, output).context("write transcript")?;
            return Ok(AgentRun {
                outcome: AttemptOutcome::Failure,
                output: output.clone(),
                transcript_path,
            });
        }

        let edits = state
            .edits
            .get(run_index)
            .or_else(|| state.edits.last())
            .cloned()
            .ok_or_else(|| anyhow!("scripted agent has no edits"))?;
        let mut output = String::new();
        for (path, content) in &edits {
            let target = state.root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create parent dirs")?;
            }
            fs::write(&target, content).with_context(|| format!("write {path}"))?;
            output.push_str(&format!("edited {path}\n"));
        }
        check_all_reports(&state.root)?;

        fs::write(&transcript_path, "ok\n").context("write transcript")?;
        Ok(AgentRun {
            outcome: AttemptOutcome::Success,
            output,
            transcript_path,
        })
    }
}

/// Check every checklist box in every report, as the prompt instructs the
/// real agent to do.
fn check_all_reports(root: &Path) -> Result<()> {
    let reports = root.join(".foreman/reports");
    if !reports.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&reports).context("read reports dir")? {
        let path = entry.context("dir entry")?.path();
        if path.extension().is_none_or(|ext| ext != "md") {
            continue;
        }
        let content = fs::read_to_string(&path).context("read report")?;
        fs::write(&path, content.replace("- [ ] ", "- [x] ")).context("write report")?;
    }
    Ok(())
}

/// Temporary git repository with a bare `origin` remote, one pushed
/// initial commit, and a checked-out working clone.
pub struct TestRepo {
    _dir: tempfile::TempDir,
    remote: PathBuf,
    work: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let remote = dir.path().join("origin.git");
        let seed = dir.path().join("seed");
        let work = dir.path().join("work");

        git_in(dir.path(), &["init", "--bare", "-b", "main", "origin.git"])?;
        git_in(dir.path(), &["init", "-b", "main", "seed"])?;
        configure_identity(&seed)?;
        fs::write(seed.join("README.md"), "# fixture\n").context("seed file")?;
        git_in(&seed, &["add", "README.md"])?;
        git_in(&seed, &["commit", "-m", "initial commit"])?;
        git_in(
            &seed,
            &["remote", "add", "origin", &remote.display().to_string()],
        )?;
        git_in(&seed, &["push", "--quiet", "origin", "main"])?;
        git_in(
            dir.path(),
            &[
                "clone",
                "--quiet",
                &remote.display().to_string(),
                "work",
            ],
        )?;
        configure_identity(&work)?;
        // Seed FETCH_HEAD so diff computations work before the first fetch.
        git_in(&work, &["fetch", "--quiet", "origin", "main"])?;

        Ok(Self {
            _dir: dir,
            remote,
            work,
        })
    }

    pub fn root(&self) -> &Path {
        &self.work
    }

    /// Commit a file in the working clone without pushing.
    pub fn commit_local(&self, path: &str, content: &str) -> Result<()> {
        let target = self.work.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create parent dirs")?;
        }
        fs::write(&target, content).context("write file")?;
        git_in(&self.work, &["add", path])?;
        git_in(&self.work, &["commit", "-q", "-m", &format!("edit {path}")])?;
        Ok(())
    }

    /// Advance `origin/main` without touching the working clone.
    pub fn commit_on_origin(&self, path: &str, content: &str) -> Result<()> {
        let scratch = self._dir.path().join("scratch");
        if scratch.exists() {
            fs::remove_dir_all(&scratch).context("remove scratch")?;
        }
        git_in(
            self._dir.path(),
            &[
                "clone",
                "--quiet",
                &self.remote.display().to_string(),
                "scratch",
            ],
        )?;
        configure_identity(&scratch)?;
        let target = scratch.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create parent dirs")?;
        }
        fs::write(&target, content).context("write file")?;
        git_in(&scratch, &["add", path])?;
        git_in(&scratch, &["commit", "-q", "-m", &format!("remote {path}")])?;
        git_in(&scratch, &["push", "--quiet", "origin", "main"])?;
        Ok(())
    }
}

fn configure_identity(repo: &Path) -> Result<()> {
    git_in(repo, &["config", "user.email", "fixture@example.com"])?;
    git_in(repo, &["config", "user.name", "Fixture"])?;
    Ok(())
}

fn git_in(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
