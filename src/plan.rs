use graphql_parser::query::{
    self, Definition, OperationDefinition, Selection, Value as GqlValue, parse_query,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ErrorCode, GraphQLError};
use crate::schema::{ArgDef, Binding, FieldDef, MUTATION_TYPE, QUERY_TYPE, Schema, TypeRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

/// One planned field resolution: the backend (or local) call for a bound
/// field, plus the ordered selection applied to its result. Child bound
/// fields in `selections` depend on this node's result for their key.
#[derive(Debug)]
pub struct ResolutionNode {
    /// Alias if the query gave one, otherwise the field name. Also the key
    /// the merged result uses, in document order.
    pub response_key: String,
    pub field_name: String,
    pub binding: Arc<Binding>,
    /// Literal arguments with variables already substituted.
    pub args: Map<String, Value>,
    pub ty: TypeRef,
    pub selections: Vec<SelectionItem>,
}

/// Ordered selection over an object-valued result.
#[derive(Debug)]
pub enum SelectionItem {
    /// Leaf projected straight from the payload.
    Scalar {
        response_key: String,
        field_name: String,
        ty: TypeRef,
    },
    /// Nested object (or list of objects) projected from the payload.
    Object {
        response_key: String,
        field_name: String,
        ty: TypeRef,
        selections: Vec<SelectionItem>,
    },
    /// Field with its own resolver binding: a dependent resolution node.
    Bound(ResolutionNode),
}

impl SelectionItem {
    pub fn response_key(&self) -> &str {
        match self {
            SelectionItem::Scalar { response_key, .. } => response_key,
            SelectionItem::Object { response_key, .. } => response_key,
            SelectionItem::Bound(node) => &node.response_key,
        }
    }
}

/// The execution plan: a dependency tree of resolution nodes derived from
/// one validated query document. Root branches are independent of each
/// other; nesting encodes the data dependencies.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub operation: OperationKind,
    pub roots: Vec<ResolutionNode>,
}

/// Validates the document against the schema and derives the execution
/// plan. All validation errors are collected; any error means no plan and
/// no backend contact.
pub fn build_plan(
    schema: &Schema,
    query_text: &str,
    variables: Option<&Value>,
    operation_name: Option<&str>,
) -> Result<ExecutionPlan, Vec<GraphQLError>> {
    let document = parse_query::<String>(query_text).map_err(|e| {
        vec![validation_error(format!("failed to parse query: {e}"))]
    })?;

    let mut errors = Vec::new();

    for definition in &document.definitions {
        if matches!(definition, Definition::Fragment(_)) {
            errors.push(validation_error("fragments are not supported"));
        }
    }

    let Some(operation) = select_operation(&document, operation_name, &mut errors) else {
        return Err(errors);
    };

    let (kind, variable_definitions, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, &[][..], set),
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.variable_definitions.as_slice(),
            &q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.variable_definitions.as_slice(),
            &m.selection_set,
        ),
        OperationDefinition::Subscription(_) => {
            errors.push(validation_error("subscriptions are not supported"));
            return Err(errors);
        }
    };

    let variables = coerce_variables(variable_definitions, variables, &mut errors);

    let root_type = match kind {
        OperationKind::Query => QUERY_TYPE,
        OperationKind::Mutation => MUTATION_TYPE,
    };
    if schema.object(root_type).is_none() {
        errors.push(validation_error(format!(
            "schema does not define {root_type} operations"
        )));
        return Err(errors);
    }

    let walker = Walker {
        schema,
        variables: &variables,
    };
    let roots = walker.walk_bound_set(root_type, selection_set, &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(ExecutionPlan {
        operation: kind,
        roots,
    })
}

fn select_operation<'a, 'doc>(
    document: &'a query::Document<'doc, String>,
    operation_name: Option<&str>,
    errors: &mut Vec<GraphQLError>,
) -> Option<&'a OperationDefinition<'doc, String>> {
    let operations: Vec<&OperationDefinition<'doc, String>> = document
        .definitions
        .iter()
        .filter_map(|d| match d {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
        .collect();

    match operation_name {
        Some(name) => {
            let found = operations.iter().find(|op| match op {
                OperationDefinition::Query(q) => q.name.as_deref() == Some(name),
                OperationDefinition::Mutation(m) => m.name.as_deref() == Some(name),
                OperationDefinition::Subscription(s) => s.name.as_deref() == Some(name),
                OperationDefinition::SelectionSet(_) => false,
            });
            if found.is_none() {
                errors.push(validation_error(format!("unknown operation '{name}'")));
            }
            found.copied()
        }
        None => match operations.as_slice() {
            [single] => Some(single),
            [] => {
                errors.push(validation_error("document contains no operations"));
                None
            }
            _ => {
                errors.push(validation_error(
                    "operationName is required when the document defines multiple operations",
                ));
                None
            }
        },
    }
}

/// Applies provided variable values and defaults, checking presence and
/// basic type kinds.
fn coerce_variables(
    definitions: &[query::VariableDefinition<'_, String>],
    provided: Option<&Value>,
    errors: &mut Vec<GraphQLError>,
) -> HashMap<String, Value> {
    let provided = match provided {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(_) => {
            errors.push(validation_error("variables must be an object"));
            Map::new()
        }
    };

    let mut variables = HashMap::new();
    for definition in definitions {
        let name = definition.name.clone();
        match provided.get(&name) {
            Some(value) if !value.is_null() => {
                variables.insert(name, value.clone());
            }
            _ => {
                if let Some(default) = &definition.default_value {
                    // Defaults cannot reference variables; an empty scope is fine.
                    match literal_value(default, &HashMap::new()) {
                        Ok(value) => {
                            variables.insert(name, value);
                        }
                        Err(e) => errors.push(e),
                    }
                } else if matches!(definition.var_type, query::Type::NonNullType(_)) {
                    errors.push(validation_error(format!(
                        "required variable '${name}' was not provided"
                    )));
                }
            }
        }
    }
    variables
}

struct Walker<'a> {
    schema: &'a Schema,
    variables: &'a HashMap<String, Value>,
}

impl<'a> Walker<'a> {
    /// Walks a selection set, producing selection items and nested
    /// resolution nodes; every problem found is collected, nothing aborts
    /// the walk early.
    fn walk_selection_set(
        &self,
        type_name: &str,
        selection_set: &query::SelectionSet<'_, String>,
        errors: &mut Vec<GraphQLError>,
    ) -> Vec<SelectionItem> {
        let mut items = Vec::new();
        let Some(object) = self.schema.object(type_name) else {
            errors.push(validation_error(format!("unknown type '{type_name}'")));
            return items;
        };

        for selection in &selection_set.items {
            let field = match selection {
                Selection::Field(field) => field,
                Selection::FragmentSpread(_) | Selection::InlineFragment(_) => {
                    errors.push(validation_error("fragments are not supported"));
                    continue;
                }
            };

            let Some(def) = object.field(&field.name) else {
                errors.push(validation_error(format!(
                    "unknown field '{}' on type '{type_name}'",
                    field.name
                )));
                continue;
            };

            let response_key = field.alias.clone().unwrap_or_else(|| field.name.clone());
            let args = self.check_arguments(type_name, field, def, errors);
            let has_subselection = !field.selection_set.items.is_empty();
            let composite = self.schema.is_composite(&def.ty.name);

            if composite && !has_subselection {
                errors.push(validation_error(format!(
                    "field '{}' of type '{}' requires a selection set",
                    field.name, def.ty.name
                )));
                continue;
            }
            if !composite && has_subselection {
                errors.push(validation_error(format!(
                    "field '{}' of type '{}' cannot have a selection set",
                    field.name, def.ty.name
                )));
                continue;
            }

            let selections = if composite {
                self.walk_selection_set(&def.ty.name, &field.selection_set, errors)
            } else {
                Vec::new()
            };

            match &def.binding {
                Some(binding) => items.push(SelectionItem::Bound(ResolutionNode {
                    response_key,
                    field_name: field.name.clone(),
                    binding: Arc::clone(binding),
                    args,
                    ty: def.ty.clone(),
                    selections,
                })),
                None if composite => items.push(SelectionItem::Object {
                    response_key,
                    field_name: field.name.clone(),
                    ty: def.ty.clone(),
                    selections,
                }),
                None => items.push(SelectionItem::Scalar {
                    response_key,
                    field_name: field.name.clone(),
                    ty: def.ty.clone(),
                }),
            }
        }
        items
    }

    /// Root selections: every item must come out bound, which
    /// `Schema::build` already guarantees for root fields.
    fn walk_bound_set(
        &self,
        type_name: &str,
        selection_set: &query::SelectionSet<'_, String>,
        errors: &mut Vec<GraphQLError>,
    ) -> Vec<ResolutionNode> {
        self.walk_selection_set(type_name, selection_set, errors)
            .into_iter()
            .filter_map(|item| match item {
                SelectionItem::Bound(node) => Some(node),
                _ => None,
            })
            .collect()
    }

    fn check_arguments(
        &self,
        type_name: &str,
        field: &query::Field<'_, String>,
        def: &FieldDef,
        errors: &mut Vec<GraphQLError>,
    ) -> Map<String, Value> {
        let mut args = Map::new();

        for (name, value) in &field.arguments {
            let Some(arg_def) = def.args.iter().find(|a| &a.name == name) else {
                errors.push(validation_error(format!(
                    "unknown argument '{name}' on field '{type_name}.{}'",
                    field.name
                )));
                continue;
            };
            match literal_value(value, self.variables) {
                Ok(value) => {
                    self.check_value_kind(arg_def, &value, &field.name, errors);
                    args.insert(name.clone(), value);
                }
                Err(e) => errors.push(e),
            }
        }

        for arg_def in &def.args {
            if arg_def.required && !args.contains_key(&arg_def.name) {
                errors.push(validation_error(format!(
                    "missing required argument '{}' on field '{type_name}.{}'",
                    arg_def.name, field.name
                )));
            }
        }
        args
    }

    fn check_value_kind(
        &self,
        arg_def: &ArgDef,
        value: &Value,
        field_name: &str,
        errors: &mut Vec<GraphQLError>,
    ) {
        let mismatch = |expected: &str| {
            validation_error(format!(
                "argument '{}' of field '{field_name}' expects {expected}",
                arg_def.name
            ))
        };

        if value.is_null() {
            if arg_def.required {
                errors.push(mismatch("a non-null value"));
            }
            return;
        }

        match arg_def.type_name.as_str() {
            "Int" => {
                if !value.is_i64() && !value.is_u64() {
                    errors.push(mismatch("an Int"));
                }
            }
            "Float" => {
                if !value.is_number() {
                    errors.push(mismatch("a Float"));
                }
            }
            "String" => {
                if !value.is_string() {
                    errors.push(mismatch("a String"));
                }
            }
            "ID" => {
                if !value.is_string() && !value.is_number() {
                    errors.push(mismatch("an ID"));
                }
            }
            "Boolean" => {
                if !value.is_boolean() {
                    errors.push(mismatch("a Boolean"));
                }
            }
            input_type => {
                let Some(input_fields) = self.schema.input(input_type) else {
                    // Custom scalar or list-typed argument; passed through.
                    return;
                };
                let Some(object) = value.as_object() else {
                    errors.push(mismatch(&format!("a {input_type} input object")));
                    return;
                };
                for key in object.keys() {
                    if !input_fields.iter().any(|f| &f.name == key) {
                        errors.push(validation_error(format!(
                            "unknown input field '{key}' for {input_type}"
                        )));
                    }
                }
                for input_field in input_fields {
                    if input_field.required
                        && object.get(&input_field.name).map_or(true, Value::is_null)
                    {
                        errors.push(validation_error(format!(
                            "missing required input field '{}' for {input_type}",
                            input_field.name
                        )));
                    }
                }
            }
        }
    }
}

/// Converts a query literal into JSON, substituting variables.
fn literal_value(
    value: &GqlValue<'_, String>,
    variables: &HashMap<String, Value>,
) -> Result<Value, GraphQLError> {
    Ok(match value {
        GqlValue::Variable(name) => variables
            .get(name)
            .cloned()
            .ok_or_else(|| validation_error(format!("undefined variable '${name}'")))?,
        GqlValue::Int(n) => Value::from(n.as_i64().ok_or_else(|| {
            validation_error("integer literal out of range".to_string())
        })?),
        GqlValue::Float(f) => {
            Value::from(*f)
        }
        GqlValue::String(s) => Value::String(s.clone()),
        GqlValue::Boolean(b) => Value::Bool(*b),
        GqlValue::Null => Value::Null,
        GqlValue::Enum(name) => Value::String(name.clone()),
        GqlValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| literal_value(item, variables))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        GqlValue::Object(fields) => {
            let mut map = Map::new();
            for (key, item) in fields {
                map.insert(key.clone(), literal_value(item, variables)?);
            }
            Value::Object(map)
        }
    })
}

fn validation_error(message: impl Into<String>) -> GraphQLError {
    GraphQLError::request_level(ErrorCode::ValidationError, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindingConfig, ServiceConfig};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    const SDL: &str = r#"
        type Query {
            product(id: ID!): ProductDetails
            products(query: String, page: Int, size: Int): ProductSearchResult
        }
        type Mutation {
            createOrder(productId: ID!, quantity: Int!): Order
        }
        type ProductDetails {
            id: ID!
            name: String!
            price: Float!
            stockLevel: String
        }
        type ProductSearchResult {
            products: [ProductDetails!]!
            totalCount: Int!
        }
        type Order {
            id: ID!
            status: String!
        }
    "#;

    fn schema() -> Schema {
        let mut services = StdHashMap::new();
        for name in ["product-query", "inventory", "order"] {
            services.insert(
                name.to_string(),
                ServiceConfig {
                    url: format!("http://localhost/{name}"),
                    deadline_ms: 800,
                    retry_reads: true,
                    circuit_breaker: Default::default(),
                },
            );
        }
        let mut bindings: StdHashMap<String, BindingConfig> = StdHashMap::new();
        let mut add = |coordinate: &str, yaml: &str| {
            bindings.insert(coordinate.to_string(), serde_yaml::from_str(yaml).unwrap());
        };
        add(
            "Query.product",
            "{service: product-query, method: GetProduct, key_arg: id, batch_method: BatchGetProducts, idempotent: true}",
        );
        add(
            "Query.products",
            "{service: product-query, method: SearchProducts, idempotent: true}",
        );
        add(
            "Mutation.createOrder",
            "{service: order, method: CreateOrder, authenticated: true, subject_field: userId}",
        );
        add(
            "ProductDetails.stockLevel",
            "{service: inventory, method: GetStock, parent_key: id, key_field: productId, batch_method: BatchGetStock, response_field: stockLevel, idempotent: true}",
        );
        Schema::build(SDL, &bindings, &services).unwrap()
    }

    fn messages(errors: &[GraphQLError]) -> Vec<&str> {
        errors.iter().map(|e| e.message.as_str()).collect()
    }

    #[test]
    fn plans_a_nested_query_in_document_order() {
        let schema = schema();
        let plan = build_plan(
            &schema,
            r#"{ product(id: "P1") { name stockLevel price } }"#,
            None,
            None,
        )
        .unwrap();

        assert_eq!(plan.operation, OperationKind::Query);
        assert_eq!(plan.roots.len(), 1);
        let product = &plan.roots[0];
        assert_eq!(product.response_key, "product");
        assert_eq!(product.args, json!({"id": "P1"}).as_object().unwrap().clone());

        let keys: Vec<&str> = product
            .selections
            .iter()
            .map(SelectionItem::response_key)
            .collect();
        assert_eq!(keys, vec!["name", "stockLevel", "price"]);
        assert!(matches!(product.selections[1], SelectionItem::Bound(_)));
    }

    #[test]
    fn substitutes_variables() {
        let schema = schema();
        let plan = build_plan(
            &schema,
            r#"query GetProduct($id: ID!) { product(id: $id) { name } }"#,
            Some(&json!({"id": "P9"})),
            None,
        )
        .unwrap();
        assert_eq!(plan.roots[0].args["id"], json!("P9"));
    }

    #[test]
    fn collects_all_validation_errors_without_planning() {
        let schema = schema();
        let errors = build_plan(
            &schema,
            r#"{ product { nope } gadgets { id } }"#,
            None,
            None,
        )
        .unwrap_err();

        let messages = messages(&errors);
        assert!(messages.iter().any(|m| m.contains("missing required argument 'id'")));
        assert!(messages.iter().any(|m| m.contains("unknown field 'nope'")));
        assert!(messages.iter().any(|m| m.contains("unknown field 'gadgets'")));
    }

    #[test]
    fn rejects_undefined_variable() {
        let schema = schema();
        let errors = build_plan(&schema, r#"{ product(id: $id) { name } }"#, None, None)
            .unwrap_err();
        assert!(messages(&errors).iter().any(|m| m.contains("undefined variable '$id'")));
    }

    #[test]
    fn rejects_missing_required_variable() {
        let schema = schema();
        let errors = build_plan(
            &schema,
            r#"query Q($id: ID!) { product(id: $id) { name } }"#,
            Some(&json!({})),
            None,
        )
        .unwrap_err();
        assert!(
            messages(&errors)
                .iter()
                .any(|m| m.contains("required variable '$id' was not provided"))
        );
    }

    #[test]
    fn rejects_argument_type_mismatch() {
        let schema = schema();
        let errors = build_plan(
            &schema,
            r#"{ products(page: "one") { totalCount } }"#,
            None,
            None,
        )
        .unwrap_err();
        assert!(messages(&errors).iter().any(|m| m.contains("expects an Int")));
    }

    #[test]
    fn rejects_fragments() {
        let schema = schema();
        let errors = build_plan(
            &schema,
            r#"
            fragment P on ProductDetails { name }
            { product(id: "P1") { ...P } }
            "#,
            None,
            None,
        )
        .unwrap_err();
        assert!(messages(&errors).iter().any(|m| m.contains("fragments are not supported")));
    }

    #[test]
    fn selects_operation_by_name() {
        let schema = schema();
        let text = r#"
            query A { product(id: "P1") { name } }
            query B { products { totalCount } }
        "#;

        let plan = build_plan(&schema, text, None, Some("B")).unwrap();
        assert_eq!(plan.roots[0].response_key, "products");

        let errors = build_plan(&schema, text, None, None).unwrap_err();
        assert!(messages(&errors).iter().any(|m| m.contains("operationName is required")));
    }

    #[test]
    fn mutation_operation_kind() {
        let schema = schema();
        let plan = build_plan(
            &schema,
            r#"mutation { createOrder(productId: "P1", quantity: 2) { id status } }"#,
            None,
            None,
        )
        .unwrap();
        assert_eq!(plan.operation, OperationKind::Mutation);
    }

    #[test]
    fn aliases_become_response_keys() {
        let schema = schema();
        let plan = build_plan(
            &schema,
            r#"{ first: product(id: "P1") { name } second: product(id: "P2") { name } }"#,
            None,
            None,
        )
        .unwrap();
        let keys: Vec<&str> = plan.roots.iter().map(|n| n.response_key.as_str()).collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[test]
    fn scalar_with_subselection_is_rejected() {
        let schema = schema();
        let errors = build_plan(
            &schema,
            r#"{ product(id: "P1") { name { x } } }"#,
            None,
            None,
        )
        .unwrap_err();
        assert!(messages(&errors).iter().any(|m| m.contains("cannot have a selection set")));
    }

    #[test]
    fn composite_without_subselection_is_rejected() {
        let schema = schema();
        let errors = build_plan(&schema, r#"{ product(id: "P1") }"#, None, None).unwrap_err();
        assert!(messages(&errors).iter().any(|m| m.contains("requires a selection set")));
    }
}
