use crate::bus::{DialogJob, DialogTurn, PromptJob};
use crate::errors::{ReelPipeError, Result};
use crate::themes::ThemeProfile;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// External script generator (LLM-backed in production).
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(&self, job: &PromptJob, profile: &ThemeProfile) -> Result<Vec<DialogTurn>>;
}

/// External video renderer (TTS + composition in production).
#[async_trait]
pub trait VideoRenderer: Send + Sync {
    async fn render(&self, job: &DialogJob, out_path: &Path) -> Result<PathBuf>;
}

/// Deterministic fallback generator: alternates the theme's two speakers
/// over the prompt's sentences.
pub struct TwoSpeakerScriptGenerator;

#[async_trait]
impl ScriptGenerator for TwoSpeakerScriptGenerator {
    async fn generate(&self, job: &PromptJob, profile: &ThemeProfile) -> Result<Vec<DialogTurn>> {
        let sentences: Vec<&str> = job
            .prompt
            .split(['.', '?', '!'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if sentences.is_empty() {
            return Err(ReelPipeError::InvalidInput(format!(
                "Prompt for job {} has no usable sentences",
                job.job_id
            )));
        }
        Ok(sentences
            .iter()
            .enumerate()
            .map(|(i, text)| DialogTurn {
                speaker: profile.speakers[i % 2].to_string(),
                text: text.to_string(),
            })
            .collect())
    }
}

/// Writes the rendered artifact to local disk.
pub struct FileSinkRenderer;

#[async_trait]
impl VideoRenderer for FileSinkRenderer {
    async fn render(&self, job: &DialogJob, out_path: &Path) -> Result<PathBuf> {
        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ReelPipeError::Config(format!("Failed to create output directory: {e}"))
            })?;
        }
        // TODO: replace with the real TTS + composition call
        let body = serde_json::to_vec(job)?;
        tokio::fs::write(out_path, &body)
            .await
            .map_err(|e| ReelPipeError::Config(format!("Failed to write artifact: {e}")))?;
        Ok(out_path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::themes;

    #[tokio::test]
    async fn test_generator_alternates_speakers() {
        let job = PromptJob {
            job_id: "j1".to_string(),
            prompt: "First thing. Second thing? Third thing!".to_string(),
            character_theme: "family_guy".to_string(),
            title: None,
        };
        let profile = themes::profile_for("family_guy").unwrap();
        let turns = TwoSpeakerScriptGenerator
            .generate(&job, profile)
            .await
            .unwrap();

        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].speaker, "peter");
        assert_eq!(turns[1].speaker, "stewie");
        assert_eq!(turns[2].speaker, "peter");
    }

    #[tokio::test]
    async fn test_generator_rejects_empty_prompt() {
        let job = PromptJob {
            job_id: "j1".to_string(),
            prompt: "...".to_string(),
            character_theme: "family_guy".to_string(),
            title: None,
        };
        let profile = themes::profile_for("family_guy").unwrap();
        let err = TwoSpeakerScriptGenerator
            .generate(&job, profile)
            .await
            .unwrap_err();
        assert!(matches!(err, ReelPipeError::InvalidInput(_)));
    }
}
