//! Auto Encode Daemon
//!
//! Background service that turns queued source files into finished HEVC
//! encodes: stream probing, instruction synthesis, standard and
//! dual-layer Dolby Vision encoding, and post-processing, driven by a
//! three-lane scheduler.

pub mod build;
pub mod commands;
pub mod crop;
pub mod daemon;
pub mod encode;
pub mod hdr_extract;
pub mod instructions;
pub mod jobs;
pub mod manager;
pub mod marker;
pub mod notify;
pub mod post_process;
pub mod probe;
pub mod scan_type;
pub mod scheduler;
pub mod startup;
pub mod status;
pub mod status_server;

pub use auto_encode_daemon_config as config;
pub use auto_encode_daemon_config::Config;
pub use build::run_build;
pub use commands::{synthesize_commands, CommandError, CommandSet};
pub use daemon::{Daemon, DaemonError};
pub use encode::{run_encode, EncodeError, EncodeOutcome};
pub use instructions::{synthesize_plan, EncodingPlan, VideoEncoder};
pub use jobs::{Job, JobStatus, SourceDescriptor};
pub use manager::{JobManager, ManagerError};
pub use notify::{ChannelPublisher, JobEvent, NullPublisher, StatusPublisher};
pub use post_process::{run_post_process, PostProcessError, PostProcessPlan};
pub use probe::{probe_source, ProbeError, StreamTopology};
pub use scheduler::Scheduler;
pub use startup::{run_startup_checks, StartupError, ToolPaths};
pub use status::{
    collect_system_status, new_shared_status, JobSnapshot, SharedStatus, StatusSnapshot,
    SystemStatus,
};
pub use status_server::{create_status_router, run_status_server, ServerError};
