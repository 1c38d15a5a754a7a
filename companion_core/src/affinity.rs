use anyhow::{bail, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::AffinityConfig;
use crate::llm_client::{CompletionService, Message};
use crate::memory::LongTermStore;

/// Largest score change a single exchange can produce, in either direction.
pub const MAX_DELTA: i64 = 3;

/// A named band of affinity scores with the attitude it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityTier {
    #[serde(default)]
    pub id: u32,
    pub label: String,
    /// Inclusive `[min, max]`.
    pub range: [i64; 2],
    #[serde(rename = "desc", alias = "description")]
    pub description: String,
}

impl AffinityTier {
    fn new(id: u32, label: &str, min: i64, max: i64, description: &str) -> Self {
        Self {
            id,
            label: label.to_string(),
            range: [min, max],
            description: description.to_string(),
        }
    }

    pub fn min_score(&self) -> i64 {
        self.range[0]
    }

    pub fn max_score(&self) -> i64 {
        self.range[1]
    }

    pub fn contains(&self, score: i64) -> bool {
        self.min_score() <= score && score <= self.max_score()
    }
}

/// Sorted, gap-free, non-empty list of tiers. Scores outside the table clamp to the
/// first or last tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<AffinityTier>,
}

impl TierTable {
    pub fn new(tiers: Vec<AffinityTier>) -> Result<Self> {
        if tiers.is_empty() {
            bail!("tier table is empty");
        }
        for tier in &tiers {
            if tier.min_score() > tier.max_score() {
                bail!(
                    "tier '{}' has inverted range {}..{}",
                    tier.label,
                    tier.min_score(),
                    tier.max_score()
                );
            }
        }
        for pair in tiers.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.max_score().checked_add(1) != Some(next.min_score()) {
                bail!(
                    "tiers '{}' and '{}' are not contiguous ({} then {})",
                    prev.label,
                    next.label,
                    prev.max_score(),
                    next.min_score()
                );
            }
        }
        Ok(Self { tiers })
    }

    pub fn default_tiers() -> Vec<AffinityTier> {
        vec![
            AffinityTier::new(0, "Hostile", -100, -100, "Openly hostile and will attack the speaker, though never with profanity; steers every answer toward ending the conversation."),
            AffinityTier::new(1, "Resentful", -99, -50, "Sharp-tongued and will attack the speaker without profanity; answers are short."),
            AffinityTier::new(2, "Averse", -49, -20, "Harsh but not attacking, no profanity; voices dissatisfaction while still mostly cooperating."),
            AffinityTier::new(3, "Cold", -19, -1, "Consistently flat, basically polite, says no more than needed."),
            AffinityTier::new(4, "Stranger", 0, 29, "Flat tone, says a little more on topics of interest or expertise, always polite."),
            AffinityTier::new(5, "Acquaintance", 30, 49, "Flat but approachable, polite without being stiff."),
            AffinityTier::new(6, "Friend", 50, 79, "Friendly and approachable; answers start to become richer."),
            AffinityTier::new(7, "Close friend", 80, 99, "Treats the user as a treasured companion; acts cute, jokes, and shares inner thoughts."),
            AffinityTier::new(8, "Idol", 100, 100, "Deeply admires and adores the user as a role model, eager to follow and support their decisions."),
        ]
    }

    /// First tier containing `score`, clamped to the table ends.
    pub fn lookup(&self, score: i64) -> &AffinityTier {
        let first = &self.tiers[0];
        let last = &self.tiers[self.tiers.len() - 1];
        self.tiers
            .iter()
            .find(|tier| tier.contains(score))
            .unwrap_or(if score < first.min_score() { first } else { last })
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AffinityTier> {
        self.tiers.iter()
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: Self::default_tiers(),
        }
    }
}

/// Result of applying a judged delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityUpdate {
    pub score: i64,
    pub tier_label: String,
    pub previous_label: String,
    pub tier_changed: bool,
}

/// Owns the affinity score, judges exchanges through the completion service, and
/// persists the score to the long-term state file.
pub struct AffinityTracker {
    tiers: TierTable,
    score: Mutex<i64>,
    store: Arc<LongTermStore>,
    judge: Arc<dyn CompletionService>,
    config: AffinityConfig,
}

impl AffinityTracker {
    pub fn new(
        tiers: TierTable,
        initial_score: i64,
        store: Arc<LongTermStore>,
        judge: Arc<dyn CompletionService>,
        config: AffinityConfig,
    ) -> Self {
        Self {
            tiers,
            score: Mutex::new(initial_score),
            store,
            judge,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, i64> {
        self.score.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn score(&self) -> i64 {
        *self.lock()
    }

    pub fn current_tier(&self) -> AffinityTier {
        self.tiers.lookup(self.score()).clone()
    }

    /// Score, tier label and tier description in one line, used verbatim as model context.
    pub fn describe(&self) -> String {
        let score = self.score();
        let tier = self.tiers.lookup(score);
        format!(
            "Current affinity: {} ({}) - {}",
            score, tier.label, tier.description
        )
    }

    /// Ask the model how this exchange moved the relationship. Any failure means "no change".
    pub async fn judge(&self, user_message: &str, assistant_message: &str) -> Option<i64> {
        let prompt = self.build_judge_prompt(user_message, assistant_message);
        let messages = [Message::user(prompt)];

        match self
            .judge
            .complete(&messages, &self.config.judge_sampling())
            .await
        {
            Ok(response) => {
                let delta = parse_delta(&response, &self.config.marker);
                if delta.is_none() {
                    tracing::warn!(
                        "Affinity judgment unparseable, treating as no change: {:?}",
                        response
                    );
                }
                delta
            }
            Err(e) => {
                tracing::warn!("Affinity judgment request failed: {}", e);
                None
            }
        }
    }

    pub fn build_judge_prompt(&self, user_message: &str, assistant_message: &str) -> String {
        let score = self.score();
        let tier = self.tiers.lookup(score);
        let table = self
            .tiers
            .iter()
            .map(|t| {
                format!(
                    "- {} ({} to {}): {}",
                    t.label,
                    t.min_score(),
                    t.max_score(),
                    t.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let marker = &self.config.marker;

        format!(
            "You are a desktop pet. These are your affinity levels:\n{table}\n\n\
             ## Your current state\n\
             Level: {label}\nScore: {score}\nAttitude: {desc}\n\n\
             From your own point of view, judge how the following exchange changes how you feel about the user.\n\n\
             ## The user said\n{user_message}\n\n\
             ## You replied\n{assistant_message}\n\n\
             Being remembered, cared for, or engaged with sincerely raises affinity; being ignored, \
             ordered around, or hurt lowers it. Stay in character for the current level.\n\
             Answer with exactly \"{marker}+N\" or \"{marker}-N\" where N is 0 to {max}. Output nothing else.",
            label = tier.label,
            desc = tier.description,
            max = MAX_DELTA,
        )
    }

    /// Add `delta` to the score and persist it. `None` leaves everything unchanged.
    pub fn apply(&self, delta: Option<i64>) -> AffinityUpdate {
        let mut score = self.lock();
        let previous_label = self.tiers.lookup(*score).label.clone();

        let Some(delta) = delta else {
            return AffinityUpdate {
                score: *score,
                tier_label: previous_label.clone(),
                previous_label,
                tier_changed: false,
            };
        };

        *score = score.saturating_add(delta);
        let new_score = *score;
        let tier_label = self.tiers.lookup(new_score).label.clone();
        let tier_changed = tier_label != previous_label;

        if let Err(e) = self.store.update(|doc| doc.favorability = new_score) {
            tracing::warn!("Failed to save affinity score: {:#}", e);
        }

        if tier_changed {
            tracing::info!(
                "Affinity tier changed: {} -> {} ({})",
                previous_label,
                tier_label,
                new_score
            );
        } else {
            tracing::debug!(
                "Affinity updated: {} ({}) delta {:+}",
                new_score,
                tier_label,
                delta
            );
        }

        AffinityUpdate {
            score: new_score,
            tier_label,
            previous_label,
            tier_changed,
        }
    }

    pub fn reset(&self) {
        let mut score = self.lock();
        *score = 0;
        if let Err(e) = self.store.update(|doc| doc.favorability = 0) {
            tracing::warn!("Failed to save affinity reset: {:#}", e);
        }
        tracing::info!("Affinity reset to 0");
    }
}

/// Find `<marker><sign?><digits>` and return the value clamped to `[-MAX_DELTA, MAX_DELTA]`.
pub fn parse_delta(response: &str, marker: &str) -> Option<i64> {
    let pattern = format!(r"{}\s*([+-]?\d+)", regex_lite::escape(marker));
    let regex = Regex::new(&pattern).ok()?;
    let captures = regex.captures(response.trim())?;
    let value: i64 = captures.get(1)?.as_str().parse().ok()?;
    Some(value.clamp(-MAX_DELTA, MAX_DELTA))
}
