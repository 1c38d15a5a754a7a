use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::store::{load_document, now_timestamp, timestamp_format, write_document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    /// Something the user did rather than said, e.g. a poke.
    Event,
}

/// One recorded conversational event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: usize,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_score: Option<i64>,
}

/// Append-only, densely numbered store of conversation turns backed by one JSON file.
///
/// Every mutation rewrites the file while holding the lock. Write failures are logged
/// and the in-memory list stays authoritative.
pub struct ConversationLog {
    path: PathBuf,
    turns: Mutex<Vec<Turn>>,
}

impl ConversationLog {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut turns: Vec<Turn> = load_document(&path, "conversation log");

        if renumber(&mut turns) {
            tracing::info!(
                "Conversation log IDs were not contiguous, renumbered {} turns",
                turns.len()
            );
            persist(&path, &turns);
        }

        tracing::debug!("Conversation log loaded: {} turns from {:?}", turns.len(), path);
        Self {
            path,
            turns: Mutex::new(turns),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Turn>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, role: TurnRole, content: impl Into<String>) -> Turn {
        let mut turns = self.lock();
        let turn = Turn {
            id: lowest_free_id(&turns),
            timestamp: now_timestamp(),
            role,
            content: content.into(),
            affinity_delta: None,
            resulting_score: None,
        };
        turns.push(turn.clone());
        persist(&self.path, &turns);
        turn
    }

    pub fn all_turns(&self) -> Vec<Turn> {
        self.lock().clone()
    }

    /// Copy of at most `count` turns starting at position `start`.
    pub fn turns_from(&self, start: usize, count: usize) -> Vec<Turn> {
        let turns = self.lock();
        turns.iter().skip(start).take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove the turn with `id` and renumber the rest to `0..n-1`.
    pub fn delete(&self, id: usize) -> bool {
        let mut turns = self.lock();
        let before = turns.len();
        turns.retain(|turn| turn.id != id);
        if turns.len() == before {
            return false;
        }
        renumber(&mut turns);
        persist(&self.path, &turns);
        true
    }

    pub(crate) fn clear(&self) {
        let mut turns = self.lock();
        turns.clear();
        persist(&self.path, &turns);
    }

    /// Attach an affinity delta and the score it produced to the newest assistant turn.
    pub fn annotate_last_assistant(&self, delta: i64, resulting_score: i64) -> bool {
        let mut turns = self.lock();
        let Some(turn) = turns
            .iter_mut()
            .rev()
            .find(|turn| turn.role == TurnRole::Assistant)
        else {
            return false;
        };
        turn.affinity_delta = Some(delta);
        turn.resulting_score = Some(resulting_score);
        persist(&self.path, &turns);
        true
    }

    /// Rewrite the newest turn if it is an event and `rewrite` accepts its content.
    pub fn amend_last_event<F>(&self, rewrite: F) -> Option<Turn>
    where
        F: FnOnce(&str) -> Option<String>,
    {
        let mut turns = self.lock();
        let last = turns.last_mut().filter(|turn| turn.role == TurnRole::Event)?;
        let content = rewrite(&last.content)?;
        last.content = content;
        last.timestamp = now_timestamp();
        let amended = last.clone();
        persist(&self.path, &turns);
        Some(amended)
    }
}

fn persist(path: &Path, turns: &[Turn]) {
    if let Err(e) = write_document(path, turns) {
        tracing::warn!("Failed to save conversation log: {:#}", e);
    }
}

/// Smallest non-negative ID not used by any turn.
fn lowest_free_id(turns: &[Turn]) -> usize {
    let mut used: Vec<usize> = turns.iter().map(|turn| turn.id).collect();
    used.sort_unstable();
    used.dedup();
    used.iter()
        .enumerate()
        .find(|(index, id)| *index != **id)
        .map(|(index, _)| index)
        .unwrap_or(used.len())
}

/// Assign IDs `0..n-1` in stored order; returns whether anything changed.
fn renumber(turns: &mut [Turn]) -> bool {
    let mut changed = false;
    for (index, turn) in turns.iter_mut().enumerate() {
        if turn.id != index {
            turn.id = index;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn temp_log() -> (TempDir, ConversationLog) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ConversationLog::open(dir.path().join("talk_log.json"));
        (dir, log)
    }

    fn ids(log: &ConversationLog) -> Vec<usize> {
        log.all_turns().iter().map(|turn| turn.id).collect()
    }

    #[test]
    fn ids_stay_dense_across_appends_and_deletes() {
        let (_dir, log) = temp_log();
        for i in 0..6 {
            log.append(TurnRole::User, format!("message {}", i));
        }

        for victim in [0, 3, 2] {
            assert!(log.delete(victim));
            let expected: Vec<usize> = (0..log.len()).collect();
            assert_eq!(ids(&log), expected);
        }

        let contents: Vec<String> = log.all_turns().into_iter().map(|t| t.content).collect();
        assert_eq!(contents, vec!["message 1", "message 2", "message 5"]);
    }

    #[test]
    fn append_after_delete_keeps_ids_contiguous() {
        let (_dir, log) = temp_log();
        log.append(TurnRole::User, "a");
        log.append(TurnRole::Assistant, "b");
        log.append(TurnRole::User, "c");

        assert!(log.delete(1));
        let turn = log.append(TurnRole::Assistant, "d");
        assert_eq!(turn.id, 2);
        assert_eq!(ids(&log), vec![0, 1, 2]);
    }

    #[test]
    fn lowest_free_id_fills_gaps_first() {
        let stamp = now_timestamp();
        let turns: Vec<Turn> = [0, 2, 3]
            .into_iter()
            .map(|id| Turn {
                id,
                timestamp: stamp,
                role: TurnRole::User,
                content: String::new(),
                affinity_delta: None,
                resulting_score: None,
            })
            .collect();
        assert_eq!(lowest_free_id(&turns), 1);
        assert_eq!(lowest_free_id(&[]), 0);
    }

    #[test]
    fn deleting_unknown_id_is_a_no_op() {
        let (_dir, log) = temp_log();
        log.append(TurnRole::User, "hello");
        assert!(!log.delete(7));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn non_contiguous_ids_are_renumbered_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("talk_log.json");
        fs::write(
            &path,
            r#"[
                {"id": 4, "timestamp": "2024-01-01 10:00:00", "role": "user", "content": "hi"},
                {"id": 9, "timestamp": "2024-01-01 10:00:05", "role": "assistant", "content": "hey", "affinityDelta": 1, "resultingScore": 3},
                {"id": 2, "timestamp": "2024-01-01 10:01:00", "role": "event", "content": "poke"}
            ]"#,
        )
        .unwrap();

        let log = ConversationLog::open(&path);
        assert_eq!(ids(&log), vec![0, 1, 2]);
        assert_eq!(log.all_turns()[1].resulting_score, Some(3));

        let on_disk: Vec<Turn> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.iter().map(|t| t.id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn annotation_targets_latest_assistant_turn() {
        let (_dir, log) = temp_log();
        assert!(!log.annotate_last_assistant(2, 10));

        log.append(TurnRole::User, "hi");
        log.append(TurnRole::Assistant, "first");
        log.append(TurnRole::Assistant, "second");
        log.append(TurnRole::Event, "poke");

        assert!(log.annotate_last_assistant(-1, 4));
        let turns = log.all_turns();
        assert_eq!(turns[1].affinity_delta, None);
        assert_eq!(turns[2].affinity_delta, Some(-1));
        assert_eq!(turns[2].resulting_score, Some(4));
    }

    #[test]
    fn annotations_survive_reload_and_absent_fields_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("talk_log.json");
        {
            let log = ConversationLog::open(&path);
            log.append(TurnRole::User, "hi");
            log.append(TurnRole::Assistant, "hello");
            log.annotate_last_assistant(2, 2);
        }

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.matches("affinityDelta").count(), 1);

        let reopened = ConversationLog::open(&path);
        let turns = reopened.all_turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].affinity_delta, Some(2));
    }

    #[test]
    fn amend_only_touches_trailing_event() {
        let (_dir, log) = temp_log();
        log.append(TurnRole::Event, "poke");
        log.append(TurnRole::User, "hi");
        assert!(log
            .amend_last_event(|content| Some(format!("{} x2", content)))
            .is_none());

        log.append(TurnRole::Event, "poke");
        let amended = log
            .amend_last_event(|content| Some(format!("{} x2", content)))
            .expect("trailing event");
        assert_eq!(amended.content, "poke x2");
        assert_eq!(log.len(), 3);
        assert!(log.amend_last_event(|_| None).is_none());
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let (_dir, log) = temp_log();
        log.append(TurnRole::User, "one");
        let snapshot = log.all_turns();
        log.append(TurnRole::User, "two");
        log.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn concurrent_appends_stay_dense_and_persisted() {
        let (dir, log) = temp_log();

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let log = &log;
                scope.spawn(move || {
                    for i in 0..25 {
                        log.append(TurnRole::User, format!("worker {} message {}", worker, i));
                    }
                });
            }
        });

        assert_eq!(ids(&log), (0..200).collect::<Vec<_>>());
        let reopened = ConversationLog::open(dir.path().join("talk_log.json"));
        assert_eq!(reopened.all_turns(), log.all_turns());
    }
}
