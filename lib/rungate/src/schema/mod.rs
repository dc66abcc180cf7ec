//! Schema toolkit: introspection decoding, schema merging and the
//! compatibility checker that gates the staged rollout.

pub mod diff;
pub mod introspection;
pub mod merge;

pub use diff::{Change, ChangeKind, CompatibilityReport, Criticality, check_compatibility};
pub use introspection::{INTROSPECTION_QUERY, IntrospectionSchema, sdl_from_introspection};
pub use merge::{MergedSchema, OperationKind, merge_schemas};

use graphql_parser::schema::{Document, parse_schema};

use crate::error::SchemaError;

/// Scalars every GraphQL schema has without declaring them.
pub const BUILTIN_SCALARS: [&str; 5] = ["String", "Int", "Float", "Boolean", "ID"];

/// Directives every GraphQL schema has without declaring them.
pub const BUILTIN_DIRECTIVES: [&str; 4] = ["skip", "include", "deprecated", "specifiedBy"];

/// Parse a service's SDL into an owned document.
pub fn parse_sdl(service: &str, sdl: &str) -> Result<Document<'static, String>, SchemaError> {
    parse_schema::<String>(sdl)
        .map(|document| document.into_static())
        .map_err(|e| SchemaError::Parse {
            service: service.to_string(),
            message: e.to_string(),
        })
}

pub(crate) fn is_builtin_type(name: &str) -> bool {
    name.starts_with("__") || BUILTIN_SCALARS.contains(&name)
}
