//! Web form that downloads a bilibili video (or just its audio) with `yt-dlp` and hands
//! the finished file back to the browser as an attachment.
//!
//! Each request gets its own temporary workspace which is removed once the response
//! body has been sent, the client has gone away, or the request failed.

pub mod config;
pub mod delivery;
pub mod error;
pub mod extract;
pub mod flash;
pub mod handlers;
pub mod state;
pub mod util;
pub mod workspace;

pub use config::AppConfig;
pub use delivery::{Delivery, DeliveryPipeline, Outcome, RequestParameters};
pub use error::{Error, Result};
pub use extract::{ExtractionEngine, MediaFormat, YtDlp};
pub use state::AppState;
pub use workspace::{Workspace, WorkspaceManager};
