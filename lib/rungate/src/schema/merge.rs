//! Merging service SDLs into one gateway schema.
//!
//! Root operation types are normalised to `Query`, `Mutation` and
//! `Subscription`. Same-named types are unioned member by member; a
//! same-named field with a different type, or a type redefined as a different
//! kind, is a conflict. The service answering each root field is recorded so
//! the gateway can delegate execution.

use graphql_parser::schema::{
    Definition, DirectiveDefinition, Document, EnumType, EnumValue, Field, InputObjectType,
    InputValue, InterfaceType, ObjectType, TypeDefinition, TypeExtension, UnionType,
};
use std::collections::{BTreeMap, HashMap};

use super::{is_builtin_type, parse_sdl};
use crate::error::SchemaError;

type Doc = Document<'static, String>;
type TypeDef = TypeDefinition<'static, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Query,
        OperationKind::Mutation,
        OperationKind::Subscription,
    ];

    pub fn root_type(self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

/// Root type names a single service declared (possibly through a `schema {}` block).
struct RootNames {
    names: [(OperationKind, String); 3],
}

impl RootNames {
    fn from_document(document: &Doc) -> Self {
        let mut names = OperationKind::ALL.map(|kind| (kind, kind.root_type().to_string()));
        for definition in &document.definitions {
            if let Definition::SchemaDefinition(schema) = definition {
                let declared = [&schema.query, &schema.mutation, &schema.subscription];
                for ((_, name), declared) in names.iter_mut().zip(declared) {
                    if let Some(declared) = declared {
                        *name = declared.clone();
                    }
                }
            }
        }
        Self { names }
    }

    fn kind_of(&self, type_name: &str) -> Option<OperationKind> {
        self.names
            .iter()
            .find(|(_, name)| name == type_name)
            .map(|(kind, _)| *kind)
    }
}

/// The merged schema of a gateway, plus which service owns each root field.
#[derive(Debug, Clone)]
pub struct MergedSchema {
    document: Doc,
    owners: HashMap<OperationKind, BTreeMap<String, usize>>,
}

impl MergedSchema {
    pub fn document(&self) -> &Doc {
        &self.document
    }

    /// Index (in merge input order) of the service answering `field` on the root type of `kind`.
    pub fn owner(&self, kind: OperationKind, field: &str) -> Option<usize> {
        self.owners.get(&kind)?.get(field).copied()
    }

    /// Whether any service contributes a root field for `kind`.
    pub fn supports(&self, kind: OperationKind) -> bool {
        self.owners.get(&kind).is_some_and(|fields| !fields.is_empty())
    }

    pub fn sdl(&self) -> String {
        self.document.to_string()
    }
}

fn kind_name(definition: &TypeDef) -> &'static str {
    match definition {
        TypeDefinition::Scalar(_) => "scalar",
        TypeDefinition::Object(_) => "type",
        TypeDefinition::Interface(_) => "interface",
        TypeDefinition::Union(_) => "union",
        TypeDefinition::Enum(_) => "enum",
        TypeDefinition::InputObject(_) => "input",
    }
}

fn type_name(definition: &TypeDef) -> &str {
    match definition {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

fn merge_fields(
    type_name: &str,
    existing: &mut Vec<Field<'static, String>>,
    incoming: Vec<Field<'static, String>>,
) -> Result<(), SchemaError> {
    for field in incoming {
        if let Some(current) = existing.iter().find(|f| f.name == field.name) {
            let (current_type, incoming_type) =
                (current.field_type.to_string(), field.field_type.to_string());
            if current_type != incoming_type {
                return Err(SchemaError::FieldConflict {
                    type_name: type_name.to_string(),
                    field: field.name,
                    existing: current_type,
                    incoming: incoming_type,
                });
            }
            continue;
        }
        existing.push(field);
    }
    Ok(())
}

fn merge_input_fields(
    type_name: &str,
    existing: &mut Vec<InputValue<'static, String>>,
    incoming: Vec<InputValue<'static, String>>,
) -> Result<(), SchemaError> {
    for field in incoming {
        if let Some(current) = existing.iter().find(|f| f.name == field.name) {
            let (current_type, incoming_type) =
                (current.value_type.to_string(), field.value_type.to_string());
            if current_type != incoming_type {
                return Err(SchemaError::FieldConflict {
                    type_name: type_name.to_string(),
                    field: field.name,
                    existing: current_type,
                    incoming: incoming_type,
                });
            }
            continue;
        }
        existing.push(field);
    }
    Ok(())
}

fn union_names(existing: &mut Vec<String>, incoming: Vec<String>) {
    for name in incoming {
        if !existing.contains(&name) {
            existing.push(name);
        }
    }
}

fn merge_enum_values(
    existing: &mut Vec<EnumValue<'static, String>>,
    incoming: Vec<EnumValue<'static, String>>,
) {
    for value in incoming {
        if !existing.iter().any(|v| v.name == value.name) {
            existing.push(value);
        }
    }
}

fn merge_type(existing: &mut TypeDef, incoming: TypeDef) -> Result<(), SchemaError> {
    match (existing, incoming) {
        (TypeDefinition::Object(current), TypeDefinition::Object(incoming)) => {
            merge_fields(&current.name, &mut current.fields, incoming.fields)?;
            union_names(
                &mut current.implements_interfaces,
                incoming.implements_interfaces,
            );
            if current.description.is_none() {
                current.description = incoming.description;
            }
        }
        (TypeDefinition::Interface(current), TypeDefinition::Interface(incoming)) => {
            merge_fields(&current.name, &mut current.fields, incoming.fields)?;
            if current.description.is_none() {
                current.description = incoming.description;
            }
        }
        (TypeDefinition::InputObject(current), TypeDefinition::InputObject(incoming)) => {
            merge_input_fields(&current.name, &mut current.fields, incoming.fields)?;
        }
        (TypeDefinition::Enum(current), TypeDefinition::Enum(incoming)) => {
            merge_enum_values(&mut current.values, incoming.values);
        }
        (TypeDefinition::Union(current), TypeDefinition::Union(incoming)) => {
            union_names(&mut current.types, incoming.types);
        }
        (TypeDefinition::Scalar(_), TypeDefinition::Scalar(_)) => {}
        (current, incoming) => {
            return Err(SchemaError::TypeConflict {
                type_name: type_name(current).to_string(),
                existing: kind_name(current).to_string(),
                incoming: kind_name(&incoming).to_string(),
            });
        }
    }
    Ok(())
}

fn rename_root(definition: &mut TypeDef, roots: &RootNames) -> Option<OperationKind> {
    let TypeDefinition::Object(object) = definition else {
        return None;
    };
    let kind = roots.kind_of(&object.name)?;
    object.name = kind.root_type().to_string();
    Some(kind)
}

fn extension_to_definition(extension: TypeExtension<'static, String>) -> Option<TypeDef> {
    match extension {
        TypeExtension::Object(ext) => {
            let mut object = ObjectType::new(ext.name);
            object.implements_interfaces = ext.implements_interfaces;
            object.directives = ext.directives;
            object.fields = ext.fields;
            Some(TypeDefinition::Object(object))
        }
        TypeExtension::Interface(ext) => {
            let mut interface = InterfaceType::new(ext.name);
            interface.directives = ext.directives;
            interface.fields = ext.fields;
            Some(TypeDefinition::Interface(interface))
        }
        TypeExtension::Union(ext) => {
            let mut union = UnionType::new(ext.name);
            union.directives = ext.directives;
            union.types = ext.types;
            Some(TypeDefinition::Union(union))
        }
        TypeExtension::Enum(ext) => {
            let mut enumeration = EnumType::new(ext.name);
            enumeration.directives = ext.directives;
            enumeration.values = ext.values;
            Some(TypeDefinition::Enum(enumeration))
        }
        TypeExtension::InputObject(ext) => {
            let mut input = InputObjectType::new(ext.name);
            input.directives = ext.directives;
            input.fields = ext.fields;
            Some(TypeDefinition::InputObject(input))
        }
        TypeExtension::Scalar(_) => None,
    }
}

#[derive(Default)]
struct Merger {
    types: BTreeMap<String, TypeDef>,
    directives: BTreeMap<String, DirectiveDefinition<'static, String>>,
    owners: HashMap<OperationKind, BTreeMap<String, usize>>,
}

impl Merger {
    fn add_type(
        &mut self,
        index: usize,
        mut definition: TypeDef,
        roots: &RootNames,
    ) -> Result<(), SchemaError> {
        if let Some(kind) = rename_root(&mut definition, roots)
            && let TypeDefinition::Object(object) = &definition
        {
            let owners = self.owners.entry(kind).or_default();
            for field in &object.fields {
                owners.entry(field.name.clone()).or_insert(index);
            }
        }

        let name = type_name(&definition).to_string();
        if is_builtin_type(&name) {
            return Ok(());
        }
        match self.types.get_mut(&name) {
            Some(existing) => merge_type(existing, definition),
            None => {
                self.types.insert(name, definition);
                Ok(())
            }
        }
    }

    fn add_service(&mut self, index: usize, service: &str, sdl: &str) -> Result<(), SchemaError> {
        let document = parse_sdl(service, sdl)?;
        let roots = RootNames::from_document(&document);
        let mut extensions = Vec::new();

        for definition in document.definitions {
            match definition {
                Definition::SchemaDefinition(_) => {}
                Definition::TypeDefinition(definition) => self.add_type(index, definition, &roots)?,
                Definition::TypeExtension(extension) => extensions.push(extension),
                Definition::DirectiveDefinition(directive) => {
                    self.directives
                        .entry(directive.name.clone())
                        .or_insert(directive);
                }
            }
        }

        // Extensions may precede the type they extend within one document
        for extension in extensions {
            if let Some(definition) = extension_to_definition(extension) {
                self.add_type(index, definition, &roots)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> MergedSchema {
        let definitions = self
            .types
            .into_values()
            .map(Definition::TypeDefinition)
            .chain(
                self.directives
                    .into_values()
                    .map(Definition::DirectiveDefinition),
            )
            .collect();
        MergedSchema {
            document: Document { definitions },
            owners: self.owners,
        }
    }
}

/// Merge `(service name, SDL)` pairs. Earlier services win root-field ownership
/// when two services expose an identical root field.
pub fn merge_schemas<'s, I>(services: I) -> Result<MergedSchema, SchemaError>
where
    I: IntoIterator<Item = (&'s str, &'s str)>,
{
    let mut merger = Merger::default();
    for (index, (service, sdl)) in services.into_iter().enumerate() {
        merger.add_service(index, service, sdl)?;
    }
    Ok(merger.finish())
}
