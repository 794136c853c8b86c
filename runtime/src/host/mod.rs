//! Host-page runtime: embed lifecycle, content fetching and worker offload.

pub mod content;
pub mod dom;
pub mod lifecycle;
pub mod memory;
pub mod workers;

pub use content::{ContentCache, ContentFetcher};
pub use dom::{EmbedHost, HeadlessHost};
pub use lifecycle::{EmbedManager, EmbedManagerBuilder, LoadOutcome};
pub use memory::{HeapProbe, HeapUsage, ManualHeapProbe, NoHeapProbe};
pub use workers::{WorkerOutput, WorkerPool, WorkerTask};
