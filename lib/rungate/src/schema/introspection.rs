//! Introspection result decoding and SDL printing.
//!
//! The broker introspects every announcing service over HTTP and stores the
//! printed SDL; everything downstream works from SDL.

use serde::Deserialize;
use std::fmt::Write;

use super::{BUILTIN_DIRECTIVES, is_builtin_type, parse_sdl};
use crate::error::SchemaError;

pub const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    subscriptionType { name }
    types { ...FullType }
    directives {
      name
      description
      locations
      args { ...InputValue }
    }
  }
}

fragment FullType on __Type {
  kind
  name
  description
  fields(includeDeprecated: true) {
    name
    description
    args { ...InputValue }
    type { ...TypeRef }
    isDeprecated
    deprecationReason
  }
  inputFields { ...InputValue }
  interfaces { ...TypeRef }
  enumValues(includeDeprecated: true) {
    name
    description
    isDeprecated
    deprecationReason
  }
  possibleTypes { ...TypeRef }
}

fragment InputValue on __InputValue {
  name
  description
  type { ...TypeRef }
  defaultValue
}

fragment TypeRef on __Type {
  kind
  name
  ofType {
    kind
    name
    ofType {
      kind
      name
      ofType {
        kind
        name
        ofType {
          kind
          name
          ofType {
            kind
            name
            ofType {
              kind
              name
              ofType {
                kind
                name
              }
            }
          }
        }
      }
    }
  }
}
"#;

const DEFAULT_DEPRECATION_REASON: &str = "No longer supported";

#[derive(Debug, Deserialize)]
pub struct IntrospectionResponse {
    pub data: Option<IntrospectionData>,
    #[serde(default)]
    pub errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct IntrospectionData {
    #[serde(rename = "__schema")]
    pub schema: IntrospectionSchema,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionSchema {
    pub query_type: Option<NamedRef>,
    pub mutation_type: Option<NamedRef>,
    pub subscription_type: Option<NamedRef>,
    pub types: Vec<FullType>,
    #[serde(default)]
    pub directives: Vec<DirectiveDef>,
}

#[derive(Debug, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypeKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
    List,
    NonNull,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullType {
    pub kind: TypeKind,
    pub name: String,
    pub description: Option<String>,
    pub fields: Option<Vec<FieldDef>>,
    pub input_fields: Option<Vec<InputValueDef>>,
    pub interfaces: Option<Vec<TypeRef>>,
    pub enum_values: Option<Vec<EnumValueDef>>,
    pub possible_types: Option<Vec<TypeRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub args: Vec<InputValueDef>,
    #[serde(rename = "type")]
    pub field_type: TypeRef,
    #[serde(default)]
    pub is_deprecated: bool,
    pub deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValueDef {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub value_type: TypeRef,
    pub default_value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumValueDef {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_deprecated: bool,
    pub deprecation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    pub kind: TypeKind,
    pub name: Option<String>,
    pub of_type: Option<Box<TypeRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveDef {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub args: Vec<InputValueDef>,
}

impl IntrospectionResponse {
    /// Extract the schema, turning GraphQL errors or a missing payload into an error.
    pub fn into_schema(self) -> Result<IntrospectionSchema, SchemaError> {
        if let Some(errors) = self.errors
            && !errors.is_empty()
        {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| e.to_string())
                })
                .collect();
            return Err(SchemaError::Introspection(messages.join("; ")));
        }
        self.data
            .map(|data| data.schema)
            .ok_or_else(|| SchemaError::Introspection("response has no data".to_string()))
    }
}

impl TypeRef {
    fn render(&self) -> Result<String, SchemaError> {
        match self.kind {
            TypeKind::NonNull => Ok(format!("{}!", self.inner()?.render()?)),
            TypeKind::List => Ok(format!("[{}]", self.inner()?.render()?)),
            _ => self
                .name
                .clone()
                .ok_or_else(|| SchemaError::Introspection("named type without a name".to_string())),
        }
    }

    fn inner(&self) -> Result<&TypeRef, SchemaError> {
        self.of_type
            .as_deref()
            .ok_or_else(|| SchemaError::Introspection("wrapping type without ofType".to_string()))
    }
}

fn string_literal(value: &str) -> String {
    // JSON string escapes are a subset of GraphQL's
    serde_json::Value::String(value.to_string()).to_string()
}

fn write_description(out: &mut String, description: &Option<String>, indent: &str) {
    if let Some(description) = description
        && !description.is_empty()
    {
        let _ = writeln!(out, "{indent}{}", string_literal(description));
    }
}

fn deprecation(is_deprecated: bool, reason: &Option<String>) -> String {
    if !is_deprecated {
        return String::new();
    }
    match reason.as_deref() {
        None | Some(DEFAULT_DEPRECATION_REASON) => " @deprecated".to_string(),
        Some(reason) => format!(" @deprecated(reason: {})", string_literal(reason)),
    }
}

fn render_input_value(value: &InputValueDef) -> Result<String, SchemaError> {
    let mut rendered = format!("{}: {}", value.name, value.value_type.render()?);
    if let Some(default) = &value.default_value {
        let _ = write!(rendered, " = {default}");
    }
    Ok(rendered)
}

fn render_arguments(args: &[InputValueDef]) -> Result<String, SchemaError> {
    if args.is_empty() {
        return Ok(String::new());
    }
    let rendered: Result<Vec<String>, SchemaError> = args.iter().map(render_input_value).collect();
    Ok(format!("({})", rendered?.join(", ")))
}

fn render_type_names(refs: &Option<Vec<TypeRef>>) -> Result<Vec<String>, SchemaError> {
    refs.iter().flatten().map(TypeRef::render).collect()
}

fn write_type(out: &mut String, ty: &FullType) -> Result<(), SchemaError> {
    write_description(out, &ty.description, "");
    match ty.kind {
        TypeKind::Scalar => {
            let _ = writeln!(out, "scalar {}", ty.name);
        }
        TypeKind::Object | TypeKind::Interface => {
            let keyword = if ty.kind == TypeKind::Object {
                "type"
            } else {
                "interface"
            };
            let _ = write!(out, "{keyword} {}", ty.name);
            let interfaces = render_type_names(&ty.interfaces)?;
            if !interfaces.is_empty() {
                let _ = write!(out, " implements {}", interfaces.join(" & "));
            }
            out.push_str(" {\n");
            for field in ty.fields.iter().flatten() {
                write_description(out, &field.description, "  ");
                let _ = writeln!(
                    out,
                    "  {}{}: {}{}",
                    field.name,
                    render_arguments(&field.args)?,
                    field.field_type.render()?,
                    deprecation(field.is_deprecated, &field.deprecation_reason)
                );
            }
            out.push_str("}\n");
        }
        TypeKind::Union => {
            let members = render_type_names(&ty.possible_types)?;
            let _ = writeln!(out, "union {} = {}", ty.name, members.join(" | "));
        }
        TypeKind::Enum => {
            let _ = writeln!(out, "enum {} {{", ty.name);
            for value in ty.enum_values.iter().flatten() {
                write_description(out, &value.description, "  ");
                let _ = writeln!(
                    out,
                    "  {}{}",
                    value.name,
                    deprecation(value.is_deprecated, &value.deprecation_reason)
                );
            }
            out.push_str("}\n");
        }
        TypeKind::InputObject => {
            let _ = writeln!(out, "input {} {{", ty.name);
            for field in ty.input_fields.iter().flatten() {
                write_description(out, &field.description, "  ");
                let _ = writeln!(out, "  {}", render_input_value(field)?);
            }
            out.push_str("}\n");
        }
        TypeKind::List | TypeKind::NonNull => {
            return Err(SchemaError::Introspection(format!(
                "wrapping kind listed as named type {}",
                ty.name
            )));
        }
    }
    out.push('\n');
    Ok(())
}

fn write_schema_block(out: &mut String, schema: &IntrospectionSchema) {
    let query = schema.query_type.as_ref().map(|t| t.name.as_str());
    let mutation = schema.mutation_type.as_ref().map(|t| t.name.as_str());
    let subscription = schema.subscription_type.as_ref().map(|t| t.name.as_str());

    let conventional = query.is_none_or(|n| n == "Query")
        && mutation.is_none_or(|n| n == "Mutation")
        && subscription.is_none_or(|n| n == "Subscription");
    if conventional {
        return;
    }

    out.push_str("schema {\n");
    for (operation, name) in [
        ("query", query),
        ("mutation", mutation),
        ("subscription", subscription),
    ] {
        if let Some(name) = name {
            let _ = writeln!(out, "  {operation}: {name}");
        }
    }
    out.push_str("}\n\n");
}

/// Print the SDL of an introspected schema. Built-in scalars, introspection
/// types and built-in directives are left out.
pub fn sdl_from_introspection(schema: &IntrospectionSchema) -> Result<String, SchemaError> {
    if schema.query_type.is_none() {
        return Err(SchemaError::Introspection("schema has no query type".to_string()));
    }

    let mut out = String::new();
    write_schema_block(&mut out, schema);

    for ty in schema.types.iter().filter(|t| !is_builtin_type(&t.name)) {
        write_type(&mut out, ty)?;
    }

    for directive in schema
        .directives
        .iter()
        .filter(|d| !BUILTIN_DIRECTIVES.contains(&d.name.as_str()))
    {
        write_description(&mut out, &directive.description, "");
        let _ = writeln!(
            out,
            "directive @{}{} on {}",
            directive.name,
            render_arguments(&directive.args)?,
            directive.locations.join(" | ")
        );
        out.push('\n');
    }

    // Round trip through the parser so only valid, normalised SDL is stored
    let document = parse_sdl("introspection result", &out)?;
    Ok(document.to_string())
}
