//! Classification of rows in the remote `events` table, with results
//! written back per row.

mod client;
mod pipeline;
pub mod prefilter;
mod writeback;

pub use client::{backoff_delay, BatchQuery, EventStore, RemoteError, SupabaseStore, BASE_DELAY, MAX_ATTEMPTS};
pub use pipeline::{
    open_run_dir, Checkpoint, PipelineError, PipelineModel, PipelineOptions, PipelineStats,
    PipelineSummary, RemotePipeline, Screen, Screening,
};
pub use writeback::{payload_to_map, prefilter_payload, EventRow, Payload, WriteBack};
