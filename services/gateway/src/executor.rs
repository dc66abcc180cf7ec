//! Root-field delegating executor
//!
//! Every root field of an operation is owned by exactly one service (see
//! [`rungate::MergedSchema::owner`]). The operation is split into one
//! sub-operation per owning service carrying only the variables and fragments
//! it uses; the sub-responses are merged back into one response.
//!
//! Queries fan out concurrently. Mutations run serially in document order, so
//! consecutive fields of one service share a request but interleaved services
//! keep their ordering.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, OperationDefinition, Selection,
    SelectionSet, TypeCondition, Value, parse_query,
};
use rungate::OperationKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use thiserror::Error;

use crate::runtime::{GatewaySchema, RemoteService};

type Operation<'q> = OperationDefinition<'q, String>;
type Fragments<'d, 'q> = HashMap<&'d str, &'d FragmentDefinition<'q, String>>;

#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The request cannot be executed as sent.
    #[error("{0}")]
    Request(String),
    #[error("Mutations are not allowed over GET")]
    MutationOverGet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Json>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQlResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Json>,
}

impl GraphQlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: vec![serde_json::json!({ "message": message.into() })],
        }
    }
}

/// A slice of the operation sent to one service.
struct SubRequest<'d, 'q> {
    service: usize,
    fields: Vec<&'d Field<'q, String>>,
}

pub struct Executor {
    client: reqwest::Client,
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn execute(
        &self,
        schema: &GatewaySchema,
        request: &GraphQlRequest,
        allow_mutations: bool,
    ) -> Result<GraphQlResponse, ExecutionError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| ExecutionError::Request(format!("Syntax error: {}", e)))?;

        let fragments: Fragments = document
            .definitions
            .iter()
            .filter_map(|d| match d {
                Definition::Fragment(f) => Some((f.name.as_str(), f)),
                Definition::Operation(_) => None,
            })
            .collect();

        let operation = select_operation(&document, request.operation_name.as_deref())?;
        let kind = match operation {
            OperationDefinition::SelectionSet(_) | OperationDefinition::Query(_) => {
                OperationKind::Query
            }
            OperationDefinition::Mutation(_) => OperationKind::Mutation,
            OperationDefinition::Subscription(_) => {
                return Err(ExecutionError::Request(
                    "Subscriptions are not supported".to_string(),
                ));
            }
        };
        if kind == OperationKind::Mutation && !allow_mutations {
            return Err(ExecutionError::MutationOverGet);
        }
        if !schema.merged().supports(kind) {
            return Err(ExecutionError::Request(format!(
                "The gateway schema has no {} type",
                kind.root_type()
            )));
        }

        let empty = Map::new();
        let variables = request.variables.as_ref().unwrap_or(&empty);

        let mut roots = Vec::new();
        let mut visited = HashSet::new();
        flatten(
            selection_set(operation),
            kind,
            &fragments,
            variables,
            &mut visited,
            &mut roots,
        )?;

        let mut data = Map::new();
        let mut delegated = Vec::new();
        for field in roots {
            let key = response_key(field);
            match field.name.as_str() {
                "__typename" => {
                    data.insert(key.to_string(), Json::String(kind.root_type().to_string()));
                }
                "__schema" | "__type" => {
                    return Err(ExecutionError::Request(
                        "Introspection is not available through the gateway; use GET /sdl"
                            .to_string(),
                    ));
                }
                name => {
                    let service = schema.merged().owner(kind, name).ok_or_else(|| {
                        ExecutionError::Request(format!(
                            "Cannot query field \"{}\" on type \"{}\"",
                            name,
                            kind.root_type()
                        ))
                    })?;
                    delegated.push((service, field));
                }
            }
        }

        let requests = plan(delegated, kind);
        let mut errors = Vec::new();

        let results = if kind == OperationKind::Mutation {
            let mut results = Vec::with_capacity(requests.len());
            for sub in &requests {
                results.push(self.dispatch(schema, operation, &fragments, variables, sub).await);
            }
            results
        } else {
            futures::future::join_all(
                requests
                    .iter()
                    .map(|sub| self.dispatch(schema, operation, &fragments, variables, sub)),
            )
            .await
        };

        for (sub, result) in requests.iter().zip(results) {
            match result {
                Ok(response) => {
                    let mut sub_data = match response.data {
                        Some(Json::Object(map)) => map,
                        _ => Map::new(),
                    };
                    for field in &sub.fields {
                        let key = response_key(field);
                        data.insert(key.to_string(), sub_data.remove(key).unwrap_or(Json::Null));
                    }
                    errors.extend(response.errors);
                }
                Err(message) => {
                    for field in &sub.fields {
                        let key = response_key(field);
                        data.insert(key.to_string(), Json::Null);
                        errors.push(serde_json::json!({ "message": message, "path": [key] }));
                    }
                }
            }
        }

        Ok(GraphQlResponse {
            data: Some(Json::Object(data)),
            errors,
        })
    }

    async fn dispatch<'q>(
        &self,
        schema: &GatewaySchema,
        operation: &Operation<'q>,
        fragments: &Fragments<'_, 'q>,
        variables: &Map<String, Json>,
        sub: &SubRequest<'_, 'q>,
    ) -> Result<GraphQlResponse, String> {
        let service = schema
            .services()
            .get(sub.service)
            .ok_or_else(|| format!("No binding for service #{}", sub.service))?;
        let (query, forwarded) = render(operation, fragments, variables, &sub.fields);
        let body = GraphQlRequest {
            query,
            variables: Some(forwarded),
            operation_name: operation_name(operation).map(str::to_string),
        };
        self.send(service, &body).await
    }

    async fn send(
        &self,
        service: &RemoteService,
        body: &GraphQlRequest,
    ) -> Result<GraphQlResponse, String> {
        let response = self
            .client
            .post(&service.url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Request to {} at {} failed: {}", service.name, service.url, e);
                format!("Service {} is unavailable", service.name)
            })?;

        let status = response.status();
        match response.json::<GraphQlResponse>().await {
            Ok(decoded) => Ok(decoded),
            Err(e) => {
                tracing::warn!(
                    "Unreadable response from {} ({}): {}",
                    service.name,
                    status,
                    e
                );
                Err(format!(
                    "Service {} returned an invalid response ({})",
                    service.name, status
                ))
            }
        }
    }
}

fn select_operation<'d, 'q>(
    document: &'d Document<'q, String>,
    name: Option<&str>,
) -> Result<&'d Operation<'q>, ExecutionError> {
    let mut operations = document.definitions.iter().filter_map(|d| match d {
        Definition::Operation(op) => Some(op),
        Definition::Fragment(_) => None,
    });

    match name {
        Some(name) => operations
            .find(|op| operation_name(op) == Some(name))
            .ok_or_else(|| ExecutionError::Request(format!("Unknown operation named \"{}\"", name))),
        None => {
            let first = operations
                .next()
                .ok_or_else(|| ExecutionError::Request("Document has no operations".to_string()))?;
            if operations.next().is_some() {
                return Err(ExecutionError::Request(
                    "operationName is required when the document has several operations"
                        .to_string(),
                ));
            }
            Ok(first)
        }
    }
}

fn operation_name<'d>(operation: &'d Operation<'_>) -> Option<&'d str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

fn selection_set<'d, 'q>(operation: &'d Operation<'q>) -> &'d SelectionSet<'q, String> {
    match operation {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(q) => &q.selection_set,
        OperationDefinition::Mutation(m) => &m.selection_set,
        OperationDefinition::Subscription(s) => &s.selection_set,
    }
}

fn response_key<'d>(field: &'d Field<'_, String>) -> &'d str {
    field.alias.as_deref().unwrap_or(&field.name)
}

/// Collect the root fields, expanding fragments applied to the root type and
/// dropping anything excluded by `@skip` / `@include`.
fn flatten<'d, 'q>(
    set: &'d SelectionSet<'q, String>,
    kind: OperationKind,
    fragments: &Fragments<'d, 'q>,
    variables: &Map<String, Json>,
    visited: &mut HashSet<&'d str>,
    out: &mut Vec<&'d Field<'q, String>>,
) -> Result<(), ExecutionError> {
    for selection in &set.items {
        match selection {
            Selection::Field(field) => {
                if is_included(&field.directives, variables) {
                    out.push(field);
                }
            }
            Selection::InlineFragment(inline) => {
                let applies = match &inline.type_condition {
                    None => true,
                    Some(TypeCondition::On(name)) => name == kind.root_type(),
                };
                if applies && is_included(&inline.directives, variables) {
                    flatten(&inline.selection_set, kind, fragments, variables, visited, out)?;
                }
            }
            Selection::FragmentSpread(spread) => {
                let name = spread.fragment_name.as_str();
                let fragment: &'d FragmentDefinition<'q, String> =
                    fragments.get(name).copied().ok_or_else(|| {
                        ExecutionError::Request(format!("Unknown fragment \"{}\"", name))
                    })?;
                if !visited.insert(fragment.name.as_str()) {
                    return Err(ExecutionError::Request(format!(
                        "Fragment \"{}\" spreads itself",
                        name
                    )));
                }
                let TypeCondition::On(on) = &fragment.type_condition;
                if on == kind.root_type() && is_included(&spread.directives, variables) {
                    flatten(&fragment.selection_set, kind, fragments, variables, visited, out)?;
                }
                visited.remove(fragment.name.as_str());
            }
        }
    }
    Ok(())
}

fn is_included(directives: &[Directive<'_, String>], variables: &Map<String, Json>) -> bool {
    directives.iter().all(|directive| {
        let condition = directive
            .arguments
            .iter()
            .find(|(name, _)| name == "if")
            .map(|(_, value)| match value {
                Value::Boolean(b) => *b,
                Value::Variable(v) => variables.get(v).and_then(Json::as_bool).unwrap_or(false),
                _ => false,
            });
        match (directive.name.as_str(), condition) {
            ("skip", Some(skip)) => !skip,
            ("include", Some(include)) => include,
            _ => true,
        }
    })
}

/// Group root fields into per-service requests. Queries get one request per
/// service; mutations one per run of consecutive fields of the same service.
fn plan<'d, 'q>(
    delegated: Vec<(usize, &'d Field<'q, String>)>,
    kind: OperationKind,
) -> Vec<SubRequest<'d, 'q>> {
    let mut plan: Vec<SubRequest> = Vec::new();
    for (service, field) in delegated {
        let slot = if kind == OperationKind::Mutation {
            plan.last_mut().filter(|sub| sub.service == service)
        } else {
            plan.iter_mut().find(|sub| sub.service == service)
        };
        match slot {
            Some(sub) => sub.fields.push(field),
            None => plan.push(SubRequest {
                service,
                fields: vec![field],
            }),
        }
    }
    plan
}

#[derive(Default)]
struct Usage<'d> {
    variables: BTreeSet<&'d str>,
    fragments: BTreeSet<&'d str>,
}

impl<'d> Usage<'d> {
    fn value(&mut self, value: &'d Value<'_, String>) {
        match value {
            Value::Variable(name) => {
                self.variables.insert(name);
            }
            Value::List(items) => items.iter().for_each(|v| self.value(v)),
            Value::Object(fields) => fields.values().for_each(|v| self.value(v)),
            _ => {}
        }
    }

    fn directives(&mut self, directives: &'d [Directive<'_, String>]) {
        for directive in directives {
            directive.arguments.iter().for_each(|(_, v)| self.value(v));
        }
    }

    fn field(&mut self, field: &'d Field<'_, String>) {
        field.arguments.iter().for_each(|(_, v)| self.value(v));
        self.directives(&field.directives);
        self.selection_set(&field.selection_set);
    }

    fn selection_set(&mut self, set: &'d SelectionSet<'_, String>) {
        for selection in &set.items {
            match selection {
                Selection::Field(field) => self.field(field),
                Selection::FragmentSpread(spread) => {
                    self.fragments.insert(&spread.fragment_name);
                    self.directives(&spread.directives);
                }
                Selection::InlineFragment(inline) => {
                    self.directives(&inline.directives);
                    self.selection_set(&inline.selection_set);
                }
            }
        }
    }
}

/// Print the sub-operation for `fields` and pick the variables it references.
fn render<'q>(
    operation: &Operation<'q>,
    fragments: &Fragments<'_, 'q>,
    variables: &Map<String, Json>,
    fields: &[&Field<'q, String>],
) -> (String, Map<String, Json>) {
    let mut usage = Usage::default();
    fields.iter().for_each(|f| usage.field(f));
    match operation {
        OperationDefinition::Query(q) => usage.directives(&q.directives),
        OperationDefinition::Mutation(m) => usage.directives(&m.directives),
        _ => {}
    }

    // Fragments can spread other fragments
    let mut pending: Vec<&str> = usage.fragments.iter().copied().collect();
    while let Some(name) = pending.pop() {
        if let Some(fragment) = fragments.get(name) {
            let mut nested = Usage::default();
            nested.directives(&fragment.directives);
            nested.selection_set(&fragment.selection_set);
            usage.variables.extend(nested.variables);
            for inner in nested.fragments {
                if usage.fragments.insert(inner) {
                    pending.push(inner);
                }
            }
        }
    }

    let items: Vec<Selection<'q, String>> =
        fields.iter().map(|f| Selection::Field((*f).clone())).collect();

    let mut sub = operation.clone();
    match &mut sub {
        OperationDefinition::SelectionSet(set) => set.items = items,
        OperationDefinition::Query(q) => {
            q.variable_definitions
                .retain(|v| usage.variables.contains(v.name.as_str()));
            q.selection_set.items = items;
        }
        OperationDefinition::Mutation(m) => {
            m.variable_definitions
                .retain(|v| usage.variables.contains(v.name.as_str()));
            m.selection_set.items = items;
        }
        OperationDefinition::Subscription(s) => s.selection_set.items = items,
    }

    let mut definitions = vec![Definition::Operation(sub)];
    definitions.extend(
        usage
            .fragments
            .iter()
            .filter_map(|name| fragments.get(name))
            .map(|f| Definition::Fragment((**f).clone())),
    );
    let query = Document { definitions }.to_string();

    let forwarded = variables
        .iter()
        .filter(|(name, _)| usage.variables.contains(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    (query, forwarded)
}
