//! Kiln multi-stage build orchestration
//!
//! Composes independently built components into one minimal runtime image:
//! - Typed, scoped build parameters with deterministic resolution
//! - Isolated build stages with pinned sources
//! - Artifact contracts declaring what each stage contributes
//! - Parallel stage execution joined before final assembly
//! - Atomic publication of the assembled image

pub mod assembler;
pub mod backend;
pub mod contract;
pub mod error;
pub mod executor;
pub mod graph;
pub mod params;
pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod template;

// Re-export main types
pub use assembler::{
    check_replaceable, Artifact, ArtifactKind, Assembler, FinalImage, ImageManifest,
    ImageMetadata, IMAGE_MANIFEST_FILE, ROOTFS_DIR,
};
pub use backend::{CommandOutput, LocalBackend, StageBackend, StageContext};
pub use contract::{check_disjoint, ArtifactContract, ArtifactRule};
pub use error::{BuildError, BuildResult, StageStep};
pub use executor::{StageExecutor, StageOutput, StageWorkspace};
pub use graph::{ExecutionGraph, NodeId};
pub use params::{
    ParameterDecl, ParameterScope, ParameterSet, ParameterType, ParameterView, ResolvedParameters,
};
pub use pipeline::{ImageDefinition, Pipeline, ResolvedPipeline};
pub use runner::{provenance_label, PipelineReport, PipelineRunner, RunConfig, StageReport};
pub use stage::{ResolvedStage, SetupOperation, SourceRef, StageDefinition, VersionPin};

// Re-export configuration types for convenience
pub use kiln_config::{Config, ConfigLoader, PipelineManifest};
