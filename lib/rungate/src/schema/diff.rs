//! Schema compatibility checker
//!
//! Compares two schema documents type by type, field by field, argument by
//! argument and directive by directive, classifying every difference.
//! Only [`Criticality::Breaking`] differences gate the staged rollout.
//!
//! Input positions (arguments, input fields) follow the usual variance rules:
//! relaxing `T!` to `T` is safe, anything else is breaking. Output fields are
//! stricter: any change of a field's type, nullability included, is breaking.

use graphql_parser::schema::{
    Definition, DirectiveDefinition, Document, EnumType, Field, InputValue, ObjectType, Type,
    TypeDefinition, UnionType,
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Criticality {
    Breaking,
    Dangerous,
    Safe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    TypeRemoved,
    TypeAdded,
    TypeKindChanged,
    TypeDescriptionChanged,
    FieldRemoved,
    FieldAdded,
    FieldTypeChanged,
    FieldDescriptionChanged,
    FieldDeprecationAdded,
    FieldDeprecationRemoved,
    ArgumentRemoved,
    ArgumentAdded,
    ArgumentTypeChanged,
    ArgumentDefaultChanged,
    InputFieldRemoved,
    InputFieldAdded,
    InputFieldTypeChanged,
    InputFieldDefaultChanged,
    EnumValueRemoved,
    EnumValueAdded,
    EnumValueDeprecationAdded,
    UnionMemberRemoved,
    UnionMemberAdded,
    InterfaceRemoved,
    InterfaceAdded,
    DirectiveRemoved,
    DirectiveAdded,
    DirectiveLocationRemoved,
    DirectiveLocationAdded,
    DirectiveArgumentRemoved,
    DirectiveArgumentAdded,
    DirectiveArgumentTypeChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub criticality: Criticality,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompatibilityReport {
    pub changes: Vec<Change>,
}

impl CompatibilityReport {
    pub fn is_breaking(&self) -> bool {
        self.changes
            .iter()
            .any(|c| c.criticality == Criticality::Breaking)
    }

    pub fn breaking(&self) -> impl Iterator<Item = &Change> {
        self.changes
            .iter()
            .filter(|c| c.criticality == Criticality::Breaking)
    }

    pub fn dangerous(&self) -> impl Iterator<Item = &Change> {
        self.changes
            .iter()
            .filter(|c| c.criticality == Criticality::Dangerous)
    }
}

type Doc<'a> = Document<'a, String>;
type Ty<'a> = Type<'a, String>;

struct Index<'d, 'a> {
    types: BTreeMap<&'d str, &'d TypeDefinition<'a, String>>,
    directives: BTreeMap<&'d str, &'d DirectiveDefinition<'a, String>>,
}

impl<'d, 'a> Index<'d, 'a> {
    fn new(document: &'d Doc<'a>) -> Self {
        let mut types = BTreeMap::new();
        let mut directives = BTreeMap::new();
        for definition in &document.definitions {
            match definition {
                Definition::TypeDefinition(t) => {
                    types.insert(type_name(t), t);
                }
                Definition::DirectiveDefinition(d) => {
                    directives.insert(d.name.as_str(), d);
                }
                _ => {}
            }
        }
        Self { types, directives }
    }
}

fn type_name<'d>(definition: &'d TypeDefinition<'_, String>) -> &'d str {
    match definition {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

fn kind_label(definition: &TypeDefinition<'_, String>) -> &'static str {
    match definition {
        TypeDefinition::Scalar(_) => "scalar",
        TypeDefinition::Object(_) => "object",
        TypeDefinition::Interface(_) => "interface",
        TypeDefinition::Union(_) => "union",
        TypeDefinition::Enum(_) => "enum",
        TypeDefinition::InputObject(_) => "input object",
    }
}

fn description<'d>(definition: &'d TypeDefinition<'_, String>) -> Option<&'d str> {
    match definition {
        TypeDefinition::Scalar(t) => t.description.as_deref(),
        TypeDefinition::Object(t) => t.description.as_deref(),
        TypeDefinition::Interface(t) => t.description.as_deref(),
        TypeDefinition::Union(t) => t.description.as_deref(),
        TypeDefinition::Enum(t) => t.description.as_deref(),
        TypeDefinition::InputObject(t) => t.description.as_deref(),
    }
}

fn is_non_null(ty: &Ty<'_>) -> bool {
    matches!(ty, Type::NonNullType(_))
}

/// Whether a value of type `old` can always be passed where `new` is expected.
fn is_safe_input_change<'a>(old: &Ty<'a>, new: &Ty<'a>) -> bool {
    match (old, new) {
        (Type::NonNullType(o), Type::NonNullType(n)) => is_safe_input_change(o, n),
        (Type::NonNullType(o), n) => is_safe_input_change(o, n),
        (Type::ListType(o), Type::ListType(n)) => is_safe_input_change(o, n),
        (Type::NamedType(o), Type::NamedType(n)) => o == n,
        _ => false,
    }
}

fn is_deprecated(directives: &[graphql_parser::schema::Directive<'_, String>]) -> bool {
    directives.iter().any(|d| d.name == "deprecated")
}

fn is_required(value: &InputValue<'_, String>) -> bool {
    is_non_null(&value.value_type) && value.default_value.is_none()
}

struct Differ {
    changes: Vec<Change>,
}

impl Differ {
    fn push(&mut self, kind: ChangeKind, criticality: Criticality, path: String, message: String) {
        self.changes.push(Change {
            kind,
            criticality,
            path,
            message,
        });
    }

    fn types<'a>(&mut self, old: &Index<'_, 'a>, new: &Index<'_, 'a>) {
        for (name, old_type) in &old.types {
            match new.types.get(name) {
                None => self.push(
                    ChangeKind::TypeRemoved,
                    Criticality::Breaking,
                    name.to_string(),
                    format!("Type '{name}' was removed"),
                ),
                Some(new_type) => self.type_pair(name, old_type, new_type),
            }
        }
        for name in new.types.keys().filter(|n| !old.types.contains_key(*n)) {
            self.push(
                ChangeKind::TypeAdded,
                Criticality::Safe,
                name.to_string(),
                format!("Type '{name}' was added"),
            );
        }
    }

    fn type_pair<'a>(
        &mut self,
        name: &str,
        old: &TypeDefinition<'a, String>,
        new: &TypeDefinition<'a, String>,
    ) {
        if description(old) != description(new) {
            self.push(
                ChangeKind::TypeDescriptionChanged,
                Criticality::Safe,
                name.to_string(),
                format!("Description of type '{name}' changed"),
            );
        }

        match (old, new) {
            (TypeDefinition::Object(o), TypeDefinition::Object(n)) => {
                self.interfaces(o, n);
                self.fields(name, &o.fields, &n.fields);
            }
            (TypeDefinition::Interface(o), TypeDefinition::Interface(n)) => {
                self.fields(name, &o.fields, &n.fields);
            }
            (TypeDefinition::InputObject(o), TypeDefinition::InputObject(n)) => {
                self.input_fields(name, &o.fields, &n.fields);
            }
            (TypeDefinition::Enum(o), TypeDefinition::Enum(n)) => self.enum_values(o, n),
            (TypeDefinition::Union(o), TypeDefinition::Union(n)) => self.union_members(o, n),
            (TypeDefinition::Scalar(_), TypeDefinition::Scalar(_)) => {}
            _ => self.push(
                ChangeKind::TypeKindChanged,
                Criticality::Breaking,
                name.to_string(),
                format!(
                    "Type '{name}' changed from {} to {}",
                    kind_label(old),
                    kind_label(new)
                ),
            ),
        }
    }

    fn interfaces(&mut self, old: &ObjectType<'_, String>, new: &ObjectType<'_, String>) {
        for interface in &old.implements_interfaces {
            if !new.implements_interfaces.contains(interface) {
                self.push(
                    ChangeKind::InterfaceRemoved,
                    Criticality::Breaking,
                    old.name.clone(),
                    format!("'{}' no longer implements '{interface}'", old.name),
                );
            }
        }
        for interface in &new.implements_interfaces {
            if !old.implements_interfaces.contains(interface) {
                self.push(
                    ChangeKind::InterfaceAdded,
                    Criticality::Dangerous,
                    new.name.clone(),
                    format!("'{}' now implements '{interface}'", new.name),
                );
            }
        }
    }

    fn fields<'a>(&mut self, owner: &str, old: &[Field<'a, String>], new: &[Field<'a, String>]) {
        for old_field in old {
            let path = format!("{owner}.{}", old_field.name);
            let Some(new_field) = new.iter().find(|f| f.name == old_field.name) else {
                let message = if is_deprecated(&old_field.directives) {
                    format!("Deprecated field '{path}' was removed")
                } else {
                    format!("Field '{path}' was removed")
                };
                self.push(ChangeKind::FieldRemoved, Criticality::Breaking, path, message);
                continue;
            };

            if old_field.field_type != new_field.field_type {
                self.push(
                    ChangeKind::FieldTypeChanged,
                    Criticality::Breaking,
                    path.clone(),
                    format!(
                        "Field '{path}' changed type from '{}' to '{}'",
                        old_field.field_type, new_field.field_type
                    ),
                );
            }
            if old_field.description != new_field.description {
                self.push(
                    ChangeKind::FieldDescriptionChanged,
                    Criticality::Safe,
                    path.clone(),
                    format!("Description of field '{path}' changed"),
                );
            }
            match (
                is_deprecated(&old_field.directives),
                is_deprecated(&new_field.directives),
            ) {
                (false, true) => self.push(
                    ChangeKind::FieldDeprecationAdded,
                    Criticality::Dangerous,
                    path.clone(),
                    format!("Field '{path}' was deprecated"),
                ),
                (true, false) => self.push(
                    ChangeKind::FieldDeprecationRemoved,
                    Criticality::Dangerous,
                    path.clone(),
                    format!("Field '{path}' is no longer deprecated"),
                ),
                _ => {}
            }
            self.arguments(&path, &old_field.arguments, &new_field.arguments);
        }

        for new_field in new.iter().filter(|n| !old.iter().any(|o| o.name == n.name)) {
            let path = format!("{owner}.{}", new_field.name);
            let message = format!("Field '{path}' was added");
            self.push(ChangeKind::FieldAdded, Criticality::Safe, path, message);
        }
    }

    fn arguments<'a>(
        &mut self,
        owner: &str,
        old: &[InputValue<'a, String>],
        new: &[InputValue<'a, String>],
    ) {
        for old_arg in old {
            let path = format!("{owner}({}:)", old_arg.name);
            let Some(new_arg) = new.iter().find(|a| a.name == old_arg.name) else {
                let message = format!("Argument '{}' was removed from '{owner}'", old_arg.name);
                self.push(ChangeKind::ArgumentRemoved, Criticality::Breaking, path, message);
                continue;
            };

            if old_arg.value_type != new_arg.value_type {
                let criticality = if is_safe_input_change(&old_arg.value_type, &new_arg.value_type)
                {
                    Criticality::Safe
                } else {
                    Criticality::Breaking
                };
                self.push(
                    ChangeKind::ArgumentTypeChanged,
                    criticality,
                    path.clone(),
                    format!(
                        "Argument '{}' on '{owner}' changed type from '{}' to '{}'",
                        old_arg.name, old_arg.value_type, new_arg.value_type
                    ),
                );
            }
            if old_arg.default_value != new_arg.default_value {
                self.push(
                    ChangeKind::ArgumentDefaultChanged,
                    Criticality::Dangerous,
                    path,
                    format!("Default value of argument '{}' on '{owner}' changed", old_arg.name),
                );
            }
        }

        for new_arg in new.iter().filter(|n| !old.iter().any(|o| o.name == n.name)) {
            let path = format!("{owner}({}:)", new_arg.name);
            let (criticality, qualifier) = if is_required(new_arg) {
                (Criticality::Breaking, "Required argument")
            } else {
                (Criticality::Dangerous, "Optional argument")
            };
            let message = format!("{qualifier} '{}' was added to '{owner}'", new_arg.name);
            self.push(ChangeKind::ArgumentAdded, criticality, path, message);
        }
    }

    fn input_fields<'a>(
        &mut self,
        owner: &str,
        old: &[InputValue<'a, String>],
        new: &[InputValue<'a, String>],
    ) {
        for old_field in old {
            let path = format!("{owner}.{}", old_field.name);
            let Some(new_field) = new.iter().find(|f| f.name == old_field.name) else {
                let message = format!("Input field '{path}' was removed");
                self.push(ChangeKind::InputFieldRemoved, Criticality::Breaking, path, message);
                continue;
            };

            if old_field.value_type != new_field.value_type {
                let criticality =
                    if is_safe_input_change(&old_field.value_type, &new_field.value_type) {
                        Criticality::Safe
                    } else {
                        Criticality::Breaking
                    };
                self.push(
                    ChangeKind::InputFieldTypeChanged,
                    criticality,
                    path.clone(),
                    format!(
                        "Input field '{path}' changed type from '{}' to '{}'",
                        old_field.value_type, new_field.value_type
                    ),
                );
            }
            if old_field.default_value != new_field.default_value {
                let message = format!("Default value of input field '{path}' changed");
                self.push(
                    ChangeKind::InputFieldDefaultChanged,
                    Criticality::Dangerous,
                    path,
                    message,
                );
            }
        }

        for new_field in new.iter().filter(|n| !old.iter().any(|o| o.name == n.name)) {
            let path = format!("{owner}.{}", new_field.name);
            let (criticality, qualifier) = if is_required(new_field) {
                (Criticality::Breaking, "Required input field")
            } else {
                (Criticality::Safe, "Optional input field")
            };
            let message = format!("{qualifier} '{path}' was added");
            self.push(ChangeKind::InputFieldAdded, criticality, path, message);
        }
    }

    fn enum_values(&mut self, old: &EnumType<'_, String>, new: &EnumType<'_, String>) {
        for value in &old.values {
            let path = format!("{}.{}", old.name, value.name);
            match new.values.iter().find(|v| v.name == value.name) {
                None => {
                    let message = format!("Enum value '{path}' was removed");
                    self.push(ChangeKind::EnumValueRemoved, Criticality::Breaking, path, message);
                }
                Some(new_value)
                    if !is_deprecated(&value.directives)
                        && is_deprecated(&new_value.directives) =>
                {
                    let message = format!("Enum value '{path}' was deprecated");
                    self.push(
                        ChangeKind::EnumValueDeprecationAdded,
                        Criticality::Dangerous,
                        path,
                        message,
                    );
                }
                Some(_) => {}
            }
        }
        for value in new
            .values
            .iter()
            .filter(|n| !old.values.iter().any(|o| o.name == n.name))
        {
            let path = format!("{}.{}", new.name, value.name);
            let message = format!("Enum value '{path}' was added");
            self.push(ChangeKind::EnumValueAdded, Criticality::Safe, path, message);
        }
    }

    fn union_members(&mut self, old: &UnionType<'_, String>, new: &UnionType<'_, String>) {
        for member in old.types.iter().filter(|m| !new.types.contains(m)) {
            self.push(
                ChangeKind::UnionMemberRemoved,
                Criticality::Breaking,
                old.name.clone(),
                format!("Member '{member}' was removed from union '{}'", old.name),
            );
        }
        for member in new.types.iter().filter(|m| !old.types.contains(m)) {
            self.push(
                ChangeKind::UnionMemberAdded,
                Criticality::Dangerous,
                new.name.clone(),
                format!("Member '{member}' was added to union '{}'", new.name),
            );
        }
    }

    fn directives<'a>(&mut self, old: &Index<'_, 'a>, new: &Index<'_, 'a>) {
        for (name, old_directive) in &old.directives {
            let path = format!("@{name}");
            let Some(new_directive) = new.directives.get(name) else {
                let message = format!("Directive '{path}' was removed");
                self.push(ChangeKind::DirectiveRemoved, Criticality::Breaking, path, message);
                continue;
            };

            for location in &old_directive.locations {
                if !new_directive.locations.contains(location) {
                    self.push(
                        ChangeKind::DirectiveLocationRemoved,
                        Criticality::Breaking,
                        path.clone(),
                        format!("Location {} was removed from '{path}'", location.as_str()),
                    );
                }
            }
            for location in &new_directive.locations {
                if !old_directive.locations.contains(location) {
                    self.push(
                        ChangeKind::DirectiveLocationAdded,
                        Criticality::Safe,
                        path.clone(),
                        format!("Location {} was added to '{path}'", location.as_str()),
                    );
                }
            }

            for old_arg in &old_directive.arguments {
                let arg_path = format!("{path}({}:)", old_arg.name);
                match new_directive
                    .arguments
                    .iter()
                    .find(|a| a.name == old_arg.name)
                {
                    None => {
                        let message =
                            format!("Argument '{}' was removed from '{path}'", old_arg.name);
                        self.push(
                            ChangeKind::DirectiveArgumentRemoved,
                            Criticality::Breaking,
                            arg_path,
                            message,
                        );
                    }
                    Some(new_arg) if new_arg.value_type != old_arg.value_type => {
                        let criticality =
                            if is_safe_input_change(&old_arg.value_type, &new_arg.value_type) {
                                Criticality::Safe
                            } else {
                                Criticality::Breaking
                            };
                        let message = format!(
                            "Argument '{}' on '{path}' changed type from '{}' to '{}'",
                            old_arg.name, old_arg.value_type, new_arg.value_type
                        );
                        self.push(
                            ChangeKind::DirectiveArgumentTypeChanged,
                            criticality,
                            arg_path,
                            message,
                        );
                    }
                    Some(_) => {}
                }
            }
            for new_arg in new_directive
                .arguments
                .iter()
                .filter(|n| !old_directive.arguments.iter().any(|o| o.name == n.name))
            {
                let criticality = if is_required(new_arg) {
                    Criticality::Breaking
                } else {
                    Criticality::Dangerous
                };
                self.push(
                    ChangeKind::DirectiveArgumentAdded,
                    criticality,
                    format!("{path}({}:)", new_arg.name),
                    format!("Argument '{}' was added to '{path}'", new_arg.name),
                );
            }
        }

        for name in new
            .directives
            .keys()
            .filter(|n| !old.directives.contains_key(*n))
        {
            self.push(
                ChangeKind::DirectiveAdded,
                Criticality::Safe,
                format!("@{name}"),
                format!("Directive '@{name}' was added"),
            );
        }
    }
}

/// Classify every difference between `previous` and `candidate`. Pure: the same
/// inputs always produce the same report.
pub fn check_compatibility<'a>(previous: &Doc<'a>, candidate: &Doc<'a>) -> CompatibilityReport {
    let old = Index::new(previous);
    let new = Index::new(candidate);
    let mut differ = Differ {
        changes: Vec::new(),
    };
    differ.types(&old, &new);
    differ.directives(&old, &new);
    CompatibilityReport {
        changes: differ.changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_sdl;

    fn report(old: &str, new: &str) -> CompatibilityReport {
        let old = parse_sdl("old", old).unwrap();
        let new = parse_sdl("new", new).unwrap();
        check_compatibility(&old, &new)
    }

    fn kinds(report: &CompatibilityReport) -> Vec<(ChangeKind, Criticality)> {
        report
            .changes
            .iter()
            .map(|c| (c.kind, c.criticality))
            .collect()
    }

    const BASE: &str = r#"
        type Query {
            user(id: ID!, verbose: Boolean): User
            users: [User]
        }
        type User {
            id: ID!
            name: String
            role: Role
        }
        enum Role { ADMIN GUEST }
        input UserFilter { nameContains: String }
    "#;

    #[test]
    fn test_identical_schemas_have_no_changes() {
        assert!(report(BASE, BASE).changes.is_empty());
    }

    #[test]
    fn test_added_optional_field_is_safe() {
        let new = BASE.replace("name: String", "name: String\n email: String");
        let report = report(BASE, &new);
        assert!(!report.is_breaking());
        assert_eq!(kinds(&report), vec![(ChangeKind::FieldAdded, Criticality::Safe)]);
        assert_eq!(report.changes[0].path, "User.email");
    }

    #[test]
    fn test_removed_field_is_breaking() {
        let new = BASE.replace("name: String", "");
        let report = report(BASE, &new);
        assert!(report.is_breaking());
        assert_eq!(report.breaking().next().unwrap().path, "User.name");
    }

    #[test]
    fn test_removed_type_is_breaking() {
        let new = BASE.replace("input UserFilter { nameContains: String }", "");
        let report = report(BASE, &new);
        assert_eq!(kinds(&report), vec![(ChangeKind::TypeRemoved, Criticality::Breaking)]);
    }

    #[test]
    fn test_removed_enum_value_is_breaking_added_is_safe() {
        let removed = report(BASE, &BASE.replace("ADMIN GUEST", "ADMIN"));
        assert_eq!(
            kinds(&removed),
            vec![(ChangeKind::EnumValueRemoved, Criticality::Breaking)]
        );
        let added = report(BASE, &BASE.replace("ADMIN GUEST", "ADMIN GUEST OWNER"));
        assert_eq!(kinds(&added), vec![(ChangeKind::EnumValueAdded, Criticality::Safe)]);
    }

    #[test]
    fn test_field_nullability_tightening_is_breaking() {
        let new = BASE.replace("name: String", "name: String!");
        let report = report(BASE, &new);
        assert_eq!(
            kinds(&report),
            vec![(ChangeKind::FieldTypeChanged, Criticality::Breaking)]
        );
    }

    #[test]
    fn test_argument_relaxation_is_safe_tightening_breaking() {
        let relaxed = report(BASE, &BASE.replace("user(id: ID!", "user(id: ID"));
        assert_eq!(
            kinds(&relaxed),
            vec![(ChangeKind::ArgumentTypeChanged, Criticality::Safe)]
        );
        let tightened = report(BASE, &BASE.replace("verbose: Boolean", "verbose: Boolean!"));
        assert_eq!(
            kinds(&tightened),
            vec![(ChangeKind::ArgumentTypeChanged, Criticality::Breaking)]
        );
    }

    #[test]
    fn test_added_required_argument_is_breaking() {
        let new = BASE.replace("users: [User]", "users(limit: Int!): [User]");
        assert!(report(BASE, &new).is_breaking());
        let optional = BASE.replace("users: [User]", "users(limit: Int): [User]");
        assert!(!report(BASE, &optional).is_breaking());
    }

    #[test]
    fn test_required_input_field_added_is_breaking() {
        let new = BASE.replace(
            "input UserFilter { nameContains: String }",
            "input UserFilter { nameContains: String, age: Int! }",
        );
        let report = report(BASE, &new);
        assert_eq!(
            kinds(&report),
            vec![(ChangeKind::InputFieldAdded, Criticality::Breaking)]
        );
    }

    #[test]
    fn test_kind_change_is_breaking() {
        let new = BASE.replace("enum Role { ADMIN GUEST }", "scalar Role");
        assert_eq!(
            kinds(&report(BASE, &new)),
            vec![(ChangeKind::TypeKindChanged, Criticality::Breaking)]
        );
    }

    #[test]
    fn test_union_member_added_is_dangerous() {
        let old = "type Query { a: U } type A { x: Int } type B { y: Int } union U = A";
        let new = "type Query { a: U } type A { x: Int } type B { y: Int } union U = A | B";
        let report = report(old, new);
        assert!(!report.is_breaking());
        assert_eq!(report.dangerous().count(), 1);
    }

    #[test]
    fn test_directive_removal_is_breaking() {
        let old = "type Query { a: Int } directive @auth(role: String) on FIELD_DEFINITION";
        let new = "type Query { a: Int }";
        assert_eq!(
            kinds(&report(old, new)),
            vec![(ChangeKind::DirectiveRemoved, Criticality::Breaking)]
        );
    }

    #[test]
    fn test_check_is_deterministic() {
        let new = BASE.replace("name: String", "").replace("ADMIN GUEST", "ADMIN");
        assert_eq!(report(BASE, &new).changes, report(BASE, &new).changes);
    }
}
