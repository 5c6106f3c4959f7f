//! Query-driven resource expansion for JSON API responses.
//!
//! Controllers return bare resources; this crate post-processes them by
//! (a) populating requested sub-resources through registered expander
//! methods and (b) restricting the output to selected fields. Both are
//! driven by comma-separated dotted paths such as
//! `expands=instructor,parent.instructor` and
//! `selects=*,-description,instructor.*,-instructor.bio`.

pub mod engine;
pub mod registry;
pub mod tree;

pub use engine::{mask, ErrorPolicy, Expansion, ExpansionError, EXPANSION_ERRORS_KEY};
pub use registry::{ExpandContext, ExpanderRegistry, FieldLink, MethodDef};
pub use tree::{ExpansionTree, Node};
