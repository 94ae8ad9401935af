//! Issue tracker client.
//!
//! The [`Tracker`] trait decouples orchestration from the remote tracker so
//! tests can use an in-memory fake. [`HttpTracker`] talks to a Jira-style
//! REST surface. Searches are status-category based to tolerate custom
//! workflow status names. Idempotent reads are retried with bounded
//! backoff; mutating operations are never auto-retried (lineage checks
//! provide idempotency instead).

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

/// A tracker issue, reduced to the fields the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub key: String,
    pub summary: String,
    pub description: String,
    pub labels: Vec<String>,
    pub status: String,
    /// Workflow-agnostic status category ("To Do", "In Progress", "Done").
    pub status_category: String,
    pub issue_type: String,
    pub parent: Option<String>,
}

/// Fields for issue creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    pub summary: String,
    pub description: String,
    pub labels: Vec<String>,
    pub issue_type: String,
    pub parent: Option<String>,
    pub priority: Option<String>,
}

/// Search filter; all set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub status_category: Option<String>,
    pub issue_type: Option<String>,
    pub labels: Vec<String>,
    pub parent: Option<String>,
}

/// An available workflow transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: String,
    pub name: String,
    pub to_status_category: String,
}

/// Abstraction over the remote issue tracker.
pub trait Tracker {
    fn search(&self, query: &SearchQuery) -> Result<Vec<Issue>>;
    fn get(&self, key: &str) -> Result<Issue>;
    fn create(&self, issue: &NewIssue) -> Result<String>;
    fn add_labels(&self, key: &str, labels: &[String]) -> Result<()>;
    fn add_comment(&self, key: &str, body: &str) -> Result<()>;
    fn transitions(&self, key: &str) -> Result<Vec<Transition>>;
    fn transition(&self, key: &str, transition_id: &str) -> Result<()>;
}

/// Transition an issue to the first available transition landing in the
/// given status category.
pub fn transition_to_category<T: Tracker + ?Sized>(
    tracker: &T,
    key: &str,
    category: &str,
) -> Result<()> {
    let current = tracker.get(key)?;
    if current.status_category.eq_ignore_ascii_case(category) {
        debug!(key, category, "already in target category");
        return Ok(());
    }
    let transitions = tracker.transitions(key)?;
    let target = transitions
        .iter()
        .find(|t| t.to_status_category.eq_ignore_ascii_case(category))
        .ok_or_else(|| anyhow!("no transition from {key} to status category '{category}'"))?;
    debug!(key, transition = %target.name, category, "executing transition");
    tracker.transition(key, &target.id)
}

const READ_RETRIES: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(500);

/// Retry an idempotent read with bounded backoff.
fn with_read_retry<T>(label: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last_err = None;
    for attempt in 1..=READ_RETRIES {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(label, attempt, err = %err, "tracker read failed, backing off");
                last_err = Some(err);
                if attempt < READ_RETRIES {
                    thread::sleep(READ_BACKOFF * attempt);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("tracker read '{label}' failed")))
}

/// HTTP client against a Jira-style REST API.
pub struct HttpTracker {
    client: reqwest::blocking::Client,
    base_url: String,
    user: String,
    token: String,
}

impl HttpTracker {
    pub fn new(base_url: &str, user: &str, token: &str) -> Result<Self> {
        if base_url.is_empty() || user.is_empty() || token.is_empty() {
            return Err(anyhow!("tracker endpoint and credentials must be configured"));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            token: token.to_string(),
        })
    }

    fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.token))
            .query(query)
            .send()
            .with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} returned {status}"));
        }
        response.json().with_context(|| format!("parse {url} body"))
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.token))
            .json(body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("POST {url} returned {status}"));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json().unwrap_or(Value::Null))
    }

    fn put_json(&self, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.user, Some(&self.token))
            .json(body)
            .send()
            .with_context(|| format!("PUT {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("PUT {url} returned {status}"));
        }
        Ok(())
    }
}

const ISSUE_FIELDS: &str = "summary,description,labels,status,issuetype,parent";

fn build_jql(query: &SearchQuery) -> String {
    let mut clauses = Vec::new();
    if let Some(category) = &query.status_category {
        clauses.push(format!("statusCategory = \"{category}\""));
    }
    if let Some(issue_type) = &query.issue_type {
        clauses.push(format!("issuetype = \"{issue_type}\""));
    }
    for label in &query.labels {
        clauses.push(format!("labels = \"{label}\""));
    }
    if let Some(parent) = &query.parent {
        clauses.push(format!("parent = \"{parent}\""));
    }
    if clauses.is_empty() {
        "order by created".to_string()
    } else {
        format!("{} order by created", clauses.join(" AND "))
    }
}

fn parse_issue(value: &Value) -> Result<Issue> {
    let key = value["key"]
        .as_str()
        .ok_or_else(|| anyhow!("issue missing key"))?
        .to_string();
    let fields = &value["fields"];
    Ok(Issue {
        key,
        summary: fields["summary"].as_str().unwrap_or_default().to_string(),
        description: fields["description"].as_str().unwrap_or_default().to_string(),
        labels: fields["labels"]
            .as_array()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        status: fields["status"]["name"].as_str().unwrap_or_default().to_string(),
        status_category: fields["status"]["statusCategory"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        issue_type: fields["issuetype"]["name"].as_str().unwrap_or_default().to_string(),
        parent: fields["parent"]["key"].as_str().map(str::to_string),
    })
}

impl Tracker for HttpTracker {
    #[instrument(skip_all)]
    fn search(&self, query: &SearchQuery) -> Result<Vec<Issue>> {
        let jql = build_jql(query);
        debug!(%jql, "searching tracker");
        let body = with_read_retry("search", || {
            self.get_json(
                "/rest/api/2/search",
                &[("jql", jql.as_str()), ("fields", ISSUE_FIELDS)],
            )
        })?;
        let issues = body["issues"]
            .as_array()
            .ok_or_else(|| anyhow!("search response missing issues array"))?;
        issues.iter().map(parse_issue).collect()
    }

    fn get(&self, key: &str) -> Result<Issue> {
        let body = with_read_retry("get", || {
            self.get_json(
                &format!("/rest/api/2/issue/{key}"),
                &[("fields", ISSUE_FIELDS)],
            )
        })?;
        parse_issue(&body)
    }

    #[instrument(skip_all, fields(issue_type = %issue.issue_type))]
    fn create(&self, issue: &NewIssue) -> Result<String> {
        let mut fields = json!({
            "summary": issue.summary,
            "description": issue.description,
            "labels": issue.labels,
            "issuetype": { "name": issue.issue_type },
        });
        if let Some(parent) = &issue.parent {
            fields["parent"] = json!({ "key": parent });
        }
        if let Some(priority) = &issue.priority {
            fields["priority"] = json!({ "name": priority });
        }
        let body = self.post_json("/rest/api/2/issue", &json!({ "fields": fields }))?;
        body["key"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("create response missing key"))
    }

    fn add_labels(&self, key: &str, labels: &[String]) -> Result<()> {
        let adds: Vec<Value> = labels.iter().map(|label| json!({ "add": label })).collect();
        self.put_json(
            &format!("/rest/api/2/issue/{key}"),
            &json!({ "update": { "labels": adds } }),
        )
    }

    fn add_comment(&self, key: &str, body: &str) -> Result<()> {
        self.post_json(
            &format!("/rest/api/2/issue/{key}/comment"),
            &json!({ "body": body }),
        )?;
        Ok(())
    }

    fn transitions(&self, key: &str) -> Result<Vec<Transition>> {
        let body = with_read_retry("transitions", || {
            self.get_json(&format!("/rest/api/2/issue/{key}/transitions"), &[])
        })?;
        let transitions = body["transitions"]
            .as_array()
            .ok_or_else(|| anyhow!("transitions response missing array"))?;
        Ok(transitions
            .iter()
            .filter_map(|t| {
                Some(Transition {
                    id: t["id"].as_str()?.to_string(),
                    name: t["name"].as_str().unwrap_or_default().to_string(),
                    to_status_category: t["to"]["statusCategory"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    fn transition(&self, key: &str, transition_id: &str) -> Result<()> {
        self.post_json(
            &format!("/rest/api/2/issue/{key}/transitions"),
            &json!({ "transition": { "id": transition_id } }),
        )?;
        Ok(())
    }
}
