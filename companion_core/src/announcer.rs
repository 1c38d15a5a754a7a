//! Hourly time announcements, generated ahead of time and published on the hour.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::llm_client::{CompletionService, Message, SamplingParams};
use crate::orchestrator::Companion;
use crate::prompt::render_recent_context;

/// How far ahead of the full hour the announcement is requested.
const PREFETCH_LEAD: Duration = Duration::from_secs(30);
const CONTEXT_TURNS: usize = 5;
const SAMPLING: SamplingParams = SamplingParams {
    temperature: 0.8,
    max_tokens: 100,
    stream: false,
};

pub struct HourlyAnnouncer {
    companion: Arc<Companion>,
    service: Arc<dyn CompletionService>,
}

impl HourlyAnnouncer {
    pub fn new(companion: Arc<Companion>, service: Arc<dyn CompletionService>) -> Self {
        Self { companion, service }
    }

    /// Run forever: prefetch before each full hour, publish exactly on it.
    pub fn spawn(self, runtime: &Handle) -> JoinHandle<()> {
        runtime.spawn(async move {
            tracing::info!("Hourly announcer started");
            loop {
                let now = Local::now().naive_local();
                let due = next_full_hour(now);
                tokio::time::sleep(until(now, due - chrono_lead())).await;

                let text = self.compose(due.hour()).await;
                tracing::debug!("Announcement for {}:00 ready: {}", due.hour(), text);

                tokio::time::sleep(until(Local::now().naive_local(), due)).await;
                self.companion.announce(&text);
            }
        })
    }

    /// Announcement text for `hour`, falling back to a fixed line on any failure.
    pub async fn compose(&self, hour: u32) -> String {
        let recent = render_recent_context(
            &self.companion.log().all_turns(),
            CONTEXT_TURNS,
            self.companion.user().display_name(),
        );
        let recent = if recent.is_empty() {
            String::new()
        } else {
            format!("[Recent conversation]\n{}\n\n", recent)
        };
        let prompt = format!(
            "{recent}[Time check] It is now {hour}:00, time for the hourly announcement.\n\n\
             Tell the user the time in your own voice, matching your current feelings.\n\
             - Speak in the first person and stay in character\n\
             - Use what you know about the user and the recent conversation\n\
             - Fit the time of day (morning, noon, evening, late night) with a small reminder or care\n\
             - Keep it short and natural, no quotes and no labels\n\n\
             Say it directly:"
        );
        let messages = [
            Message::system(self.companion.context_block()),
            Message::user(prompt),
        ];

        match self.service.complete(&messages, &SAMPLING).await {
            Ok(raw) => clean_announcement(&raw).unwrap_or_else(|| fallback(hour)),
            Err(e) => {
                tracing::warn!("Hourly announcement failed: {}", e);
                fallback(hour)
            }
        }
    }
}

/// The next `HH:00:00` strictly after `now`.
pub fn next_full_hour(now: NaiveDateTime) -> NaiveDateTime {
    let truncated = now
        .date()
        .and_hms_opt(now.hour(), 0, 0)
        .unwrap_or(now);
    truncated + ChronoDuration::hours(1)
}

fn chrono_lead() -> ChronoDuration {
    ChronoDuration::seconds(PREFETCH_LEAD.as_secs() as i64)
}

fn until(now: NaiveDateTime, target: NaiveDateTime) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

fn clean_announcement(raw: &str) -> Option<String> {
    let quotes: &[char] = &['"', '\'', '“', '”', '「', '」'];
    let cleaned = raw.trim().trim_matches(quotes).trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

pub fn fallback(hour: u32) -> String {
    format!("It's {}:00 now~", hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CompanionEvent;
    use crate::history::TurnRole;
    use crate::llm_client::CompletionError;
    use crate::testing::{CompanionFixture, ScriptedCompletion};
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn next_hour_rolls_over_midnight() {
        assert_eq!(next_full_hour(at(9, 15, 2)), at(10, 0, 0));
        assert_eq!(next_full_hour(at(9, 0, 0)), at(10, 0, 0));
        assert_eq!(
            next_full_hour(at(23, 59, 59)),
            NaiveDate::from_ymd_opt(2026, 3, 15)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn prefetch_fires_thirty_seconds_early() {
        let due = next_full_hour(at(9, 40, 0));
        assert_eq!(due - chrono_lead(), at(9, 59, 30));
        assert_eq!(until(at(9, 59, 45), due - chrono_lead()), Duration::ZERO);
        assert_eq!(until(at(9, 59, 0), due), Duration::from_secs(60));
    }

    #[test]
    fn quotes_are_stripped() {
        assert_eq!(
            clean_announcement("  \"It's noon, lunch time!\" ").as_deref(),
            Some("It's noon, lunch time!")
        );
        assert_eq!(clean_announcement("“早上好”").as_deref(), Some("早上好"));
        assert_eq!(clean_announcement(" \"\" "), None);
        assert_eq!(fallback(7), "It's 7:00 now~");
    }

    #[tokio::test]
    async fn compose_uses_recent_turns_and_strips_quotes() {
        let fx = CompanionFixture::new(
            ScriptedCompletion::always("unused"),
            ScriptedCompletion::always("unused"),
            0,
        );
        for i in 0..8 {
            fx.companion.log().append(TurnRole::User, format!("line {}", i));
        }
        let service = Arc::new(ScriptedCompletion::replying(["\"Lunch time!\""]));
        let announcer = HourlyAnnouncer::new(fx.companion.clone(), service.clone());

        assert_eq!(announcer.compose(12).await, "Lunch time!");

        let request = &service.requests()[0];
        assert_eq!(request.params, SAMPLING);
        assert!(request.messages[0].content.contains("Current affinity"));
        let prompt = &request.messages[1].content;
        assert!(prompt.contains("It is now 12:00"));
        assert!(prompt.contains("line 7"));
        assert!(prompt.contains("line 3"));
        assert!(!prompt.contains("line 2"));
    }

    #[tokio::test]
    async fn failed_request_falls_back_and_announce_logs_it() {
        let fx = CompanionFixture::new(
            ScriptedCompletion::always("unused"),
            ScriptedCompletion::always("unused"),
            0,
        );
        let service = Arc::new(ScriptedCompletion::new([Err(CompletionError::Timeout)]));
        let announcer = HourlyAnnouncer::new(fx.companion.clone(), service);

        let text = announcer.compose(23).await;
        assert_eq!(text, "It's 23:00 now~");

        fx.companion.announce(&text);
        let turns = fx.companion.log().all_turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, TurnRole::Assistant);
        assert_eq!(
            fx.events.try_iter().collect::<Vec<_>>(),
            vec![CompanionEvent::Announcement(text)]
        );
    }
}
