pub mod deals;
pub mod files;
pub mod records;
mod registry;

pub use deals::SearchDealsTool;
pub use files::{proxy_url, GetFileByIdTool};
pub use records::{ParamKind, ParamSpec, RecordSpec, RecordTool, RECORD_TOOLS};
pub use registry::{
    json_schema_array, json_schema_integer, json_schema_object, json_schema_string, validate_arguments, Tool,
    ToolContext, ToolRegistry,
};
