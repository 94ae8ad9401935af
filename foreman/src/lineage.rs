//! Idempotent Epic/Story lineage resolution.
//!
//! For a given Idea key, at most one canonical Epic exists at any time.
//! Resolution order is a correctness contract: ledger-recorded mapping
//! first, then a tracker query for the canonical lineage label, and only
//! when neither yields a match is a new artifact created. Story resolution
//! additionally allows a summary-text match as an explicit last resort,
//! logged as low-confidence; a conflict between a summary match and
//! recorded evidence aborts fail-closed rather than guessing.

use anyhow::{Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::io::ledger::Ledger;
use crate::io::tracker::{Issue, NewIssue, SearchQuery, Tracker};

/// Canonical lineage label on an Epic, recording its source Idea.
pub const SOURCE_IDEA_LABEL_PREFIX: &str = "source-idea-";
/// Back-link label on an Idea, recording its derived Epic.
pub const DERIVED_EPIC_LABEL_PREFIX: &str = "derived-epic-";
/// Lineage label on a Story, recording the Idea it implements.
pub const STORY_SOURCE_LABEL_PREFIX: &str = "story-source-";

/// How an artifact was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Ledger,
    TrackerLabel,
    SummaryText,
    Created,
}

/// Resolved artifact key plus provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: String,
    pub source: ResolutionSource,
}

/// Resolve (or create) the canonical Epic for an Idea.
///
/// Records new mappings into the ledger; the caller persists it.
pub fn resolve_epic<T: Tracker + ?Sized>(
    tracker: &T,
    ledger: &mut Ledger,
    idea: &Issue,
) -> Result<Resolution> {
    if let Some(epic_key) = ledger.epic_for(&idea.key) {
        debug!(idea = %idea.key, epic = epic_key, "epic resolved via ledger mapping");
        return Ok(Resolution {
            key: epic_key.to_string(),
            source: ResolutionSource::Ledger,
        });
    }

    let lineage_label = format!("{SOURCE_IDEA_LABEL_PREFIX}{}", idea.key);
    let existing = tracker.search(&SearchQuery {
        issue_type: Some("Epic".to_string()),
        labels: vec![lineage_label.clone()],
        ..SearchQuery::default()
    })?;
    match existing.as_slice() {
        [] => {}
        [epic] => {
            info!(idea = %idea.key, epic = %epic.key, "epic resolved via lineage label");
            ledger.epics.insert(idea.key.clone(), epic.key.clone());
            return Ok(Resolution {
                key: epic.key.clone(),
                source: ResolutionSource::TrackerLabel,
            });
        }
        many => {
            // More than one canonical Epic violates the lineage invariant.
            let keys: Vec<&str> = many.iter().map(|epic| epic.key.as_str()).collect();
            bail!(
                "multiple epics carry lineage label '{lineage_label}': {} (refusing to guess)",
                keys.join(", ")
            );
        }
    }

    let epic_key = tracker.create(&NewIssue {
        summary: idea.summary.clone(),
        description: idea.description.clone(),
        labels: vec![lineage_label],
        issue_type: "Epic".to_string(),
        parent: None,
        priority: None,
    })?;
    tracker.add_labels(
        &idea.key,
        &[format!("{DERIVED_EPIC_LABEL_PREFIX}{epic_key}")],
    )?;
    ledger.epics.insert(idea.key.clone(), epic_key.clone());
    info!(idea = %idea.key, epic = %epic_key, "epic created");
    Ok(Resolution {
        key: epic_key,
        source: ResolutionSource::Created,
    })
}

/// Resolve (or create) the canonical Story under an Epic for an Idea.
pub fn resolve_story<T: Tracker + ?Sized>(
    tracker: &T,
    ledger: &mut Ledger,
    epic_key: &str,
    idea: &Issue,
) -> Result<Resolution> {
    let lineage_label = format!("{STORY_SOURCE_LABEL_PREFIX}{}", idea.key);

    // Label-and-parent match is the preferred evidence.
    let labeled = tracker.search(&SearchQuery {
        issue_type: Some("Story".to_string()),
        labels: vec![lineage_label.clone()],
        parent: Some(epic_key.to_string()),
        ..SearchQuery::default()
    })?;
    if let [story] = labeled.as_slice() {
        debug!(epic = epic_key, story = %story.key, "story resolved via label+parent");
        ledger
            .stories
            .insert(epic_key.to_string(), story.key.clone());
        return Ok(Resolution {
            key: story.key.clone(),
            source: ResolutionSource::TrackerLabel,
        });
    }
    if labeled.len() > 1 {
        let keys: Vec<&str> = labeled.iter().map(|story| story.key.as_str()).collect();
        bail!(
            "multiple stories carry lineage label '{lineage_label}' under {epic_key}: {}",
            keys.join(", ")
        );
    }

    // Ledger mapping is the fallback.
    if let Some(story_key) = ledger.story_for(epic_key) {
        debug!(epic = epic_key, story = story_key, "story resolved via ledger mapping");
        return Ok(Resolution {
            key: story_key.to_string(),
            source: ResolutionSource::Ledger,
        });
    }

    // Summary-text match is an explicit last resort. It alone is never
    // sufficient to suppress creation: a conflict with recorded evidence
    // aborts instead of guessing.
    let siblings = tracker.search(&SearchQuery {
        issue_type: Some("Story".to_string()),
        parent: Some(epic_key.to_string()),
        ..SearchQuery::default()
    })?;
    let by_summary: Vec<&Issue> = siblings
        .iter()
        .filter(|story| story.summary == idea.summary)
        .collect();
    match by_summary.as_slice() {
        [] => {}
        [story] => {
            warn!(
                epic = epic_key,
                story = %story.key,
                "story resolved via summary text (low confidence)"
            );
            ledger
                .stories
                .insert(epic_key.to_string(), story.key.clone());
            return Ok(Resolution {
                key: story.key.clone(),
                source: ResolutionSource::SummaryText,
            });
        }
        many => {
            let keys: Vec<&str> = many.iter().map(|story| story.key.as_str()).collect();
            return Err(anyhow!(
                "summary-text match is ambiguous under {epic_key}: {} (refusing to guess)",
                keys.join(", ")
            ));
        }
    }

    let story_key = tracker.create(&NewIssue {
        summary: idea.summary.clone(),
        description: idea.description.clone(),
        labels: vec![lineage_label],
        issue_type: "Story".to_string(),
        parent: Some(epic_key.to_string()),
        priority: None,
    })?;
    ledger
        .stories
        .insert(epic_key.to_string(), story_key.clone());
    info!(epic = epic_key, story = %story_key, "story created");
    Ok(Resolution {
        key: story_key,
        source: ResolutionSource::Created,
    })
}
