//! cellci core library
//!
//! Domain events, run recording, observability, secret redaction and the
//! publish gate shared by the pipeline and the CLI.

pub mod domain;
pub mod git;
pub mod obs;
pub mod publish_gate;
pub mod recording;
pub mod redact;
pub mod telemetry;

pub use domain::{CellciError, Event, EventKind, Result};

pub use git::{capture_head_sha, current_branch, is_git_repo};

pub use publish_gate::{
    evaluate_publish_gate, is_release_version, PublishCandidate, PublishRule, PublishRuleSet,
    PublishVerdict, PublishViolation,
};
pub use recording::CellRunRecorder;
pub use redact::{RedactionResult, RedactionRule, Redactor, REDACTED};

pub use obs::{
    emit_cell_finished, emit_cell_started, emit_coverage_upload_failed, emit_event_appended,
    emit_gate_evaluated, emit_publish_outcome, emit_run_finalize_error, emit_stage_finished,
    cell_span,
};
pub use telemetry::init_tracing;

/// cellci version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
