pub mod campaign;
pub mod config;
pub mod corpus;
pub mod runner;
pub mod scorer;
pub mod seed;
pub mod sequence;
pub mod surface;
pub mod synthesizer;
pub mod tracker;

pub use campaign::{run_campaign, CampaignError, CampaignSettings, CampaignStats};
pub use config::SeqforgeConfig;
pub use corpus::{Corpus, CorpusEntry, CorpusError, InMemoryCorpus, OnDiskCorpus};
pub use runner::{
    CommandRunner, ExecutionOutcome, RunReport, Runner, RunnerError, SimulatedRunner,
};
pub use scorer::{score, CoverageRecord, CoverageSnapshot, QualityScore, ScoreWeights};
pub use seed::{emit_body, BodyEmitError, SeedEntry, SeedParseError};
pub use sequence::{BoundArg, BoundCall, CallSequence, ScalarValue, SequenceError};
pub use surface::{
    ApiCallDescriptor, ApiSurface, CallClass, HandleType, HandleTypeId, SurfaceError,
    SurfaceRegistry,
};
pub use synthesizer::{SynthesisError, SynthesisSettings, Synthesizer};
pub use tracker::{InstanceId, LifecycleState, ResourceTracker, TrackerError};
