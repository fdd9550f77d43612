use serde::{Deserialize, Serialize};

/// Submission accepted by the gateway, first hop on the `scripts` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptJob {
    pub job_id: String,
    pub prompt: String,
    pub character_theme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogTurn {
    pub speaker: String,
    pub text: String,
}

/// Dialog produced by the script stage, carried on the `video` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogJob {
    pub job_id: String,
    pub title: String,
    pub character_theme: String,
    pub turns: Vec<DialogTurn>,
}

/// Rendered artifact notification, carried on the `publish` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub job_id: String,
    pub title: String,
    pub storage_path: String,
}
