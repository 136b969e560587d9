//! Tool catalog: specs, compact descriptors, inventory, and search.

pub mod descriptor;
pub mod index;
pub mod search;

pub use descriptor::{
    flatten_output_schema, fold_marker_path, ParamSpec, ToolDescriptor, ToolSpec,
};
pub use index::{ProviderTools, ToolIndex};
pub use search::{search_tools, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT};
