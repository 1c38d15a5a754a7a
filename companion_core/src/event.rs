/// Informational signals published by background tasks to the presentation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionEvent {
    /// A previous reply is still on screen and should be dropped before the next one.
    ClearDisplay,
    /// Text to render in the speech bubble.
    ResponseReady(String),
    /// The turn finished; input may be re-enabled.
    TurnCompleted,
    AffinityTierChanged {
        old_label: String,
        new_label: String,
        score: i64,
    },
    /// Hourly announcement, due now.
    Announcement(String),
    MemoryConsolidated {
        memory_count: usize,
        processed_count: usize,
    },
}
