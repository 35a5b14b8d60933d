//! A deduplicated, lazily-loaded filesystem path model.
//!
//! Every filesystem path is represented by at most one live [`PathNode`],
//! handed out as `Arc<PathNode>` and tracked weakly by the model, so nodes
//! are reclaimed as soon as the last external owner drops them. Directory
//! children are listed lazily on a bounded background pool, kept in display
//! order, and re-synchronized with the filesystem through per-directory
//! change notification.
//!
//! ```no_run
//! use path_model::{PathModel, SearchQuery, TextPattern};
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! # async fn demo() -> path_model::Result<()> {
//! let model = PathModel::with_defaults();
//! let home = model.get_path(&dirs::home_dir().unwrap());
//! home.load().wait().await?;
//! for child in home.children() {
//!     println!("{}", child.name());
//! }
//!
//! let query = SearchQuery::named("*.rs").with_text(TextPattern::literal("fn main"));
//! let cancel = Arc::new(AtomicBool::new(false));
//! model
//!     .search(&home, query, |m| println!("{}", m.node.path().display()), cancel)
//!     .wait()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod watch;

pub mod attrs;
pub mod config;
pub mod error;
pub mod loader;
pub mod model;
pub mod node;
pub mod ops;
pub mod search;

pub use attrs::PathAttributes;
pub use config::ModelConfig;
pub use error::{Error, Result};
pub use loader::{BackgroundLoader, Completion};
pub use model::{PathModel, Subscription};
pub use node::{cmp_by_modified, cmp_by_size, cmp_display, CallbackId, PathNode};
pub use search::{LineMatch, SearchMatch, SearchQuery, TextPattern};
