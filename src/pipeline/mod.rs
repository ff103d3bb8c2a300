//! Pipeline stages for document-to-Docmost conversion.
//!
//! Each submodule implements one transformation step and is testable on its
//! own. Only [`client`] does network I/O.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ client ──▶ images ──▶ normalize ──▶ archive
//! (path/URL) (backend)  (extract)  (markdown)    (ZIP)
//! ```
//!
//! 1. [`input`]     read a local file or download a URL into a request
//! 2. [`client`]    submit the document to the backend with deadline and retry
//! 3. [`images`]    pull images out of the markup and renumber them
//! 4. [`normalize`] reduce the markup to Docmost-ready Markdown
//!    (HTML handling lives in `markup`)
//! 5. [`archive`]   write the deterministic ZIP; runs in `spawn_blocking`

pub mod archive;
pub mod client;
pub mod images;
pub mod input;
mod markup;
pub mod normalize;
