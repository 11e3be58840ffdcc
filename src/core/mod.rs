pub mod cache;
pub mod download;
pub mod events;
pub mod hasher;
pub mod imaging_tool;
pub mod models;
pub mod registry;
pub mod server_session;
pub mod session;

pub use cache::{CacheError, CacheOutcome, CacheReport, ImageCache, VerifiedPath};
pub use download::{DownloadError, download_image};
pub use events::{FailureKind, ImagingEvent, ImagingFailure, SessionEvent};
pub use hasher::{HashAlgorithm, Hasher, checksum, checksum_async, hasher_for};
pub use imaging_tool::{ApplyRequest, ImagingTool, ImagingToolType, create_tool};
pub use models::{Catalog, CatalogError, Disk, Image, ImagingStage};
pub use registry::{SessionRegistry, SessionStatus};
pub use server_session::ImageSessionServer;
pub use session::{ImagingSession, SessionError, SessionSnapshot, TransitionError};
