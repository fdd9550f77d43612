pub mod health;
pub mod publish_stage;
pub mod registry;
pub mod renderer;
pub mod runner;
pub mod script_stage;

pub use health::WorkerHealthMonitor;
pub use publish_stage::{ArtifactPublisher, LogPublisher, PublishStage};
pub use registry::{WorkerHealth, WorkerRecord};
pub use renderer::{FileSinkRenderer, ScriptGenerator, TwoSpeakerScriptGenerator, VideoRenderer};
pub use runner::RenderWorker;
pub use script_stage::ScriptStage;
