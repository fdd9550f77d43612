use crate::errors::{ReelPipeError, Result};
use serde::{Deserialize, Serialize};

/// Character theme a submitted prompt is rendered with. Unknown tags are
/// rejected at the boundary rather than coerced to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterTheme {
    FamilyGuy,
    RickAndMorty,
}

impl std::fmt::Display for CharacterTheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CharacterTheme::FamilyGuy => write!(f, "family_guy"),
            CharacterTheme::RickAndMorty => write!(f, "rick_and_morty"),
        }
    }
}

impl TryFrom<&str> for CharacterTheme {
    type Error = ReelPipeError;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "family_guy" => Ok(CharacterTheme::FamilyGuy),
            "rick_and_morty" => Ok(CharacterTheme::RickAndMorty),
            other => Err(ReelPipeError::InvalidTheme(other.to_string())),
        }
    }
}

/// Per-theme speaker table used by the dialog stage.
#[derive(Debug, Clone)]
pub struct ThemeProfile {
    pub theme: CharacterTheme,
    pub display_name: &'static str,
    pub speakers: [&'static str; 2],
}

const THEME_PROFILES: &[ThemeProfile] = &[
    ThemeProfile {
        theme: CharacterTheme::FamilyGuy,
        display_name: "Family Guy",
        speakers: ["peter", "stewie"],
    },
    ThemeProfile {
        theme: CharacterTheme::RickAndMorty,
        display_name: "Rick and Morty",
        speakers: ["rick", "morty"],
    },
];

pub fn available_themes() -> &'static [ThemeProfile] {
    THEME_PROFILES
}

pub fn theme_tags() -> Vec<String> {
    THEME_PROFILES.iter().map(|p| p.theme.to_string()).collect()
}

pub fn profile_for(tag: &str) -> Result<&'static ThemeProfile> {
    let theme = CharacterTheme::try_from(tag)?;
    Ok(THEME_PROFILES
        .iter()
        .find(|p| p.theme == theme)
        .expect("every theme variant has a profile"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_themes_resolve() {
        let profile = profile_for("family_guy").unwrap();
        assert_eq!(profile.speakers, ["peter", "stewie"]);

        let profile = profile_for("rick_and_morty").unwrap();
        assert_eq!(profile.theme, CharacterTheme::RickAndMorty);
    }

    #[test]
    fn test_unknown_theme_rejected() {
        let err = profile_for("southpark").unwrap_err();
        assert!(matches!(err, ReelPipeError::InvalidTheme(_)));
    }

    #[test]
    fn test_tags_round_trip_serde() {
        let json = serde_json::to_string(&CharacterTheme::FamilyGuy).unwrap();
        assert_eq!(json, "\"family_guy\"");
        let back: CharacterTheme = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CharacterTheme::FamilyGuy);
    }
}
