//! Script frontend: section extraction and the basic directive compiler.
//!
//! Architecture role: the external scripting language sits behind the
//! [`evq_engine::query::QueryCompiler`] seam; this crate ships the small
//! subset the node runs end-to-end, plus the section splitter the
//! segment and batch handlers require regardless of compiler.

pub mod compiler;
pub mod sections;

pub use compiler::BasicCompiler;
pub use sections::{extract_sections, SectionDefinition};
