use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::affinity::{AffinityTier, TierTable};
use crate::store::{read_document, write_document};

pub const DEFAULT_PERSONA: &str = "You are a cute desktop pet with a lively, cheerful personality who loves interacting with your owner.";

/// On-disk character file: free-form persona text plus the affinity tier table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterFile {
    #[serde(default)]
    pub content: Option<String>,
    /// Kept loose so a malformed table does not discard the persona text.
    #[serde(default)]
    pub favorability: Option<serde_json::Value>,
}

impl Default for CharacterFile {
    fn default() -> Self {
        Self {
            content: Some(DEFAULT_PERSONA.to_string()),
            favorability: serde_json::to_value(TierTable::default_tiers()).ok(),
        }
    }
}

/// Persona prompt and tier table resolved from the character file.
#[derive(Debug, Clone)]
pub struct CharacterProfile {
    pub persona: String,
    pub tiers: TierTable,
}

impl Default for CharacterProfile {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            tiers: TierTable::default(),
        }
    }
}

impl CharacterProfile {
    pub fn load(path: &Path) -> Self {
        Self::from_file(load_user_file(path, "character file"))
    }

    pub fn from_file(file: CharacterFile) -> Self {
        let persona = match file.content.as_deref().map(str::trim) {
            Some(content) if !content.is_empty() => format!(
                "You are a desktop pet character. This is your character setting: {} \
                 Keep every reply consistent with this character.",
                content
            ),
            _ => DEFAULT_PERSONA.to_string(),
        };

        let tiers = match file.favorability {
            Some(raw) => match serde_json::from_value::<Vec<AffinityTier>>(raw) {
                Ok(tiers) => TierTable::new(tiers).unwrap_or_else(|e| {
                    tracing::warn!("Affinity tier table rejected ({:#}); using defaults", e);
                    TierTable::default()
                }),
                Err(e) => {
                    tracing::warn!("Affinity tier table is malformed ({}); using defaults", e);
                    TierTable::default()
                }
            },
            None => TierTable::default(),
        };

        Self { persona, tiers }
    }
}

/// User profile key-value set fed into the prompt as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub birthday: Option<String>,
    /// What the user calls the companion.
    #[serde(default)]
    pub oc_name: Option<String>,
    #[serde(default)]
    pub relationship: Option<String>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            nickname: Some("User".to_string()),
            birthday: Some("2000-01-01".to_string()),
            oc_name: Some("Pet".to_string()),
            relationship: Some("friend".to_string()),
        }
    }
}

impl UserProfile {
    pub fn load(path: &Path) -> Self {
        load_user_file(path, "user profile")
    }

    /// One-line summary of every non-empty field, empty when nothing is set.
    pub fn info_string(&self) -> String {
        let fields = [
            ("The user's nickname is: ", &self.nickname),
            ("The user's birthday is: ", &self.birthday),
            ("The user calls you: ", &self.oc_name),
            ("Your relationship with the user is: ", &self.relationship),
        ];

        fields
            .iter()
            .filter_map(|(label, value)| {
                value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("{}{}", label, v))
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn display_name(&self) -> &str {
        non_empty(&self.nickname).unwrap_or("User")
    }

    pub fn pet_name(&self) -> &str {
        non_empty(&self.oc_name).unwrap_or("Pet")
    }
}

/// Read a hand-edited file. A missing file is created from the default template; an
/// existing one is never rewritten, even when it cannot be parsed.
fn load_user_file<T>(path: &Path, description: &str) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    match read_document(path) {
        Ok(Some(document)) => document,
        Ok(None) => {
            let document = T::default();
            if !path.exists() {
                tracing::info!("{} not found, creating default at {:?}", description, path);
                if let Err(e) = write_document(path, &document) {
                    tracing::warn!("Failed to write default {}: {:#}", description, e);
                }
            }
            document
        }
        Err(e) => {
            tracing::warn!("Ignoring unreadable {} ({:#}); using defaults", description, e);
            T::default()
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_character_file_uses_defaults_and_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("character.json");

        let profile = CharacterProfile::load(&path);
        assert_eq!(profile.persona, DEFAULT_PERSONA);
        assert_eq!(profile.tiers.len(), 9);
        assert!(path.exists());

        let reloaded = CharacterProfile::load(&path);
        assert_eq!(reloaded.tiers.len(), 9);
    }

    #[test]
    fn unparseable_character_file_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("character.json");
        std::fs::write(&path, "{\"content\": \"A sleepy cat.\",").unwrap();

        let profile = CharacterProfile::load(&path);
        assert_eq!(profile.persona, DEFAULT_PERSONA);
        assert_eq!(profile.tiers.len(), 9);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"content\": \"A sleepy cat.\","
        );
        assert!(!crate::store::backup_path(&path).exists());
    }

    #[test]
    fn user_profile_file_is_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.json");

        let profile = UserProfile::load(&path);
        assert_eq!(profile.display_name(), "User");
        assert!(path.exists());

        std::fs::write(&path, r#"{"nickname": "Mika"}"#).unwrap();
        assert_eq!(UserProfile::load(&path).display_name(), "Mika");
    }

    #[test]
    fn malformed_tiers_keep_custom_persona() {
        let file: CharacterFile = serde_json::from_str(
            r#"{"content": "A sleepy cat.", "favorability": [{"label": "x"}]}"#,
        )
        .unwrap();
        let profile = CharacterProfile::from_file(file);
        assert!(profile.persona.contains("A sleepy cat."));
        assert_eq!(profile.tiers.len(), 9);
    }

    #[test]
    fn custom_tier_table_is_used_when_valid() {
        let file: CharacterFile = serde_json::from_str(
            r#"{"content": "", "favorability": [
                {"id": 0, "label": "Cold", "range": [-10, -1], "desc": "distant"},
                {"id": 1, "label": "Warm", "range": [0, 10], "desc": "friendly"}
            ]}"#,
        )
        .unwrap();
        let profile = CharacterProfile::from_file(file);
        assert_eq!(profile.persona, DEFAULT_PERSONA);
        assert_eq!(profile.tiers.len(), 2);
        assert_eq!(profile.tiers.lookup(5).label, "Warm");
    }

    #[test]
    fn info_string_skips_empty_fields() {
        let profile = UserProfile {
            nickname: Some("Mika".to_string()),
            birthday: None,
            oc_name: Some("  ".to_string()),
            relationship: Some("roommate".to_string()),
        };
        assert_eq!(
            profile.info_string(),
            "The user's nickname is: Mika | Your relationship with the user is: roommate"
        );
        assert_eq!(profile.pet_name(), "Pet");

        let empty = UserProfile {
            nickname: None,
            birthday: None,
            oc_name: None,
            relationship: None,
        };
        assert!(empty.info_string().is_empty());
    }
}
