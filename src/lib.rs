//! # Shadowcommit
//!
//! Asynchronous frame-commit pipeline for display controllers whose
//! configuration registers are double-buffered ("shadow" registers) and
//! latched at a refresh boundary.
//!
//! ## Architecture
//!
//! - `pipeline`: submission path and the per-output commit worker
//! - `arbiter`: channel ownership shared by every pipeline
//! - `buffer`: buffer import and release
//! - `fence`: completion signals
//! - `vsync`: vsync and frame-done notification
//! - `power`: power states and hibernation blocking
//! - `bandwidth`: bus bandwidth sequencing around a commit
//! - `recovery`: diagnostic dumps for wedged pipelines
//! - `hw`: register layer trait and a simulated controller
//! - `multi_output`: all pipelines of one controller
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shadowcommit::hw::sim::SimRig;
//! use shadowcommit::{DisplayConfig, MultiOutputManager};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = DisplayConfig::default();
//!     let rig = SimRig::new();
//!     let outputs = MultiOutputManager::new(&config, rig.collaborators(&config))?;
//!     for pipeline in outputs.iter() {
//!         println!("{:?}", pipeline);
//!     }
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod bandwidth;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fence;
pub mod frame;
pub mod hw;
pub mod logging;
pub mod multi_output;
pub mod pipeline;
pub mod power;
pub mod recovery;
pub mod vsync;

// Re-export main types for easy access
pub use config::DisplayConfig;
pub use error::{PipelineError, PipelineId};
pub use fence::{Fence, FenceWait};
pub use frame::{FrameDesc, SubmitFences, WindowConfig};
pub use multi_output::MultiOutputManager;
pub use pipeline::{Collaborators, Pipeline};
pub use power::PowerState;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
