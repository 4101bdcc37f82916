use graphql_parser::parse_schema;
use graphql_parser::schema as sdl;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BindingConfig, LocalResolver, ServiceConfig};
use crate::error::ConfigError;

pub const QUERY_TYPE: &str = "Query";
pub const MUTATION_TYPE: &str = "Mutation";

const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "ID", "Boolean"];

/// A field's unwrapped type, with the nullability the merge step needs for
/// null-bubbling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    pub name: String,
    pub non_null: bool,
    pub is_list: bool,
    /// Only meaningful when `is_list`.
    pub item_non_null: bool,
}

#[derive(Debug, Clone)]
pub struct ArgDef {
    pub name: String,
    pub type_name: String,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
    pub args: Vec<ArgDef>,
    pub binding: Option<Arc<Binding>>,
}

#[derive(Debug)]
pub struct ObjectDef {
    pub name: String,
    fields: HashMap<String, FieldDef>,
}

impl ObjectDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }
}

/// How a bound field is resolved. Built once at startup from the config's
/// binding table; execution never dispatches by name at runtime.
#[derive(Debug, Clone)]
pub enum ResolverKind {
    Backend {
        service: String,
        method: String,
        /// Batch variant coalescing sibling calls that differ only in key.
        batch_method: Option<String>,
        /// GraphQL argument carrying the call key.
        key_arg: Option<String>,
        /// Parent payload field carrying the call key.
        parent_key: Option<String>,
        /// Request message field the key is written to.
        key_field: Option<String>,
        /// Request message field filled with the authenticated subject.
        subject_field: Option<String>,
        /// Project one response message field as the field value.
        response_field: Option<String>,
        idempotent: bool,
    },
    /// Resolves from the request's authorization context, no backend call.
    CurrentUser,
}

#[derive(Debug, Clone)]
pub struct Binding {
    /// `Type.field`, kept for diagnostics.
    pub coordinate: String,
    pub kind: ResolverKind,
    pub scope: Option<String>,
    pub authenticated: bool,
    /// Degraded value substituted on timeout / open circuit / transport
    /// failure, when explicitly configured.
    pub fallback: Option<Value>,
}

/// Immutable, process-wide definition of the graph: object and input types
/// from the SDL plus the resolver lookup table, keyed by `Type.field`.
/// Loaded once at startup, read-only afterwards.
#[derive(Debug)]
pub struct Schema {
    objects: HashMap<String, ObjectDef>,
    inputs: HashMap<String, Vec<ArgDef>>,
}

impl Schema {
    pub fn build(
        raw_sdl: &str,
        bindings: &HashMap<String, BindingConfig>,
        services: &HashMap<String, ServiceConfig>,
    ) -> Result<Schema, ConfigError> {
        let document = parse_schema::<String>(raw_sdl)
            .map_err(|e| ConfigError::SchemaParse(e.to_string()))?;

        let mut objects = HashMap::new();
        let mut inputs = HashMap::new();

        for definition in &document.definitions {
            let sdl::Definition::TypeDefinition(typedef) = definition else {
                continue;
            };
            match typedef {
                sdl::TypeDefinition::Object(obj) => {
                    let fields = obj
                        .fields
                        .iter()
                        .map(|field| {
                            let def = FieldDef {
                                name: field.name.clone(),
                                ty: type_ref(&field.field_type),
                                args: field.arguments.iter().map(input_value_def).collect(),
                                binding: None,
                            };
                            (field.name.clone(), def)
                        })
                        .collect();
                    objects.insert(
                        obj.name.clone(),
                        ObjectDef {
                            name: obj.name.clone(),
                            fields,
                        },
                    );
                }
                sdl::TypeDefinition::InputObject(input) => {
                    inputs.insert(
                        input.name.clone(),
                        input.fields.iter().map(input_value_def).collect(),
                    );
                }
                _ => {}
            }
        }

        let mut schema = Schema { objects, inputs };
        schema.attach_bindings(bindings, services)?;
        schema.check_root_coverage()?;
        Ok(schema)
    }

    fn attach_bindings(
        &mut self,
        bindings: &HashMap<String, BindingConfig>,
        services: &HashMap<String, ServiceConfig>,
    ) -> Result<(), ConfigError> {
        for (coordinate, config) in bindings {
            let (type_name, field_name) =
                coordinate.split_once('.').ok_or_else(|| ConfigError::Binding {
                    field: coordinate.clone(),
                    reason: "expected 'Type.field'".to_string(),
                })?;

            let binding = Arc::new(build_binding(coordinate, type_name, config, services)?);

            let object = self
                .objects
                .get_mut(type_name)
                .ok_or_else(|| ConfigError::Binding {
                    field: coordinate.clone(),
                    reason: format!("unknown type '{type_name}'"),
                })?;
            let field = object
                .fields
                .get_mut(field_name)
                .ok_or_else(|| ConfigError::Binding {
                    field: coordinate.clone(),
                    reason: format!("type '{type_name}' has no field '{field_name}'"),
                })?;
            field.binding = Some(binding);
        }
        Ok(())
    }

    /// Every root field must be bound, otherwise a valid query could reach a
    /// field nothing can resolve.
    fn check_root_coverage(&self) -> Result<(), ConfigError> {
        for root in [QUERY_TYPE, MUTATION_TYPE] {
            let Some(object) = self.objects.get(root) else {
                continue;
            };
            for field in object.fields.values() {
                if field.binding.is_none() {
                    return Err(ConfigError::Binding {
                        field: format!("{root}.{}", field.name),
                        reason: "root field has no resolver binding".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn object(&self, name: &str) -> Option<&ObjectDef> {
        self.objects.get(name)
    }

    pub fn input(&self, name: &str) -> Option<&[ArgDef]> {
        self.inputs.get(name).map(Vec::as_slice)
    }

    pub fn is_scalar(name: &str) -> bool {
        BUILTIN_SCALARS.contains(&name)
    }

    pub fn is_composite(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }
}

fn build_binding(
    coordinate: &str,
    type_name: &str,
    config: &BindingConfig,
    services: &HashMap<String, ServiceConfig>,
) -> Result<Binding, ConfigError> {
    let invalid = |reason: String| ConfigError::Binding {
        field: coordinate.to_string(),
        reason,
    };

    let kind = match config.resolver {
        Some(LocalResolver::CurrentUser) => ResolverKind::CurrentUser,
        None => {
            let service = config
                .service
                .clone()
                .ok_or_else(|| invalid("missing 'service'".to_string()))?;
            if !services.contains_key(&service) {
                return Err(invalid(format!("unknown service '{service}'")));
            }
            let method = config
                .method
                .clone()
                .ok_or_else(|| invalid("missing 'method'".to_string()))?;

            if config.parent_key.is_some() && (type_name == QUERY_TYPE || type_name == MUTATION_TYPE)
            {
                return Err(invalid("root fields cannot use 'parent_key'".to_string()));
            }
            if config.key_arg.is_some() && config.parent_key.is_some() {
                return Err(invalid(
                    "'key_arg' and 'parent_key' are mutually exclusive".to_string(),
                ));
            }

            let key_field = config
                .key_field
                .clone()
                .or_else(|| config.key_arg.clone())
                .or_else(|| config.parent_key.clone());
            if config.batch_method.is_some() && key_field.is_none() {
                return Err(invalid(
                    "'batch_method' requires 'key_arg' or 'parent_key'".to_string(),
                ));
            }

            ResolverKind::Backend {
                service,
                method,
                batch_method: config.batch_method.clone(),
                key_arg: config.key_arg.clone(),
                parent_key: config.parent_key.clone(),
                key_field,
                subject_field: config.subject_field.clone(),
                response_field: config.response_field.clone(),
                idempotent: config.idempotent,
            }
        }
    };

    // A local resolver reads request state; a backend binding must not claim
    // config knobs that only make sense for RPC calls.
    if matches!(kind, ResolverKind::CurrentUser) && config.service.is_some() {
        return Err(invalid(
            "'resolver' and 'service' are mutually exclusive".to_string(),
        ));
    }

    Ok(Binding {
        coordinate: coordinate.to_string(),
        kind,
        scope: config.scope.clone(),
        authenticated: config.authenticated,
        fallback: config.fallback.clone(),
    })
}

fn type_ref(ty: &sdl::Type<'_, String>) -> TypeRef {
    fn walk(ty: &sdl::Type<'_, String>, non_null: bool) -> TypeRef {
        match ty {
            sdl::Type::NamedType(name) => TypeRef {
                name: name.clone(),
                non_null,
                is_list: false,
                item_non_null: false,
            },
            sdl::Type::NonNullType(inner) => walk(inner, true),
            sdl::Type::ListType(inner) => {
                let item = walk(inner, false);
                TypeRef {
                    name: item.name,
                    non_null,
                    is_list: true,
                    item_non_null: item.non_null,
                }
            }
        }
    }
    walk(ty, false)
}

fn input_value_def(value: &sdl::InputValue<'_, String>) -> ArgDef {
    let ty = type_ref(&value.value_type);
    ArgDef {
        required: ty.non_null && value.default_value.is_none(),
        type_name: ty.name,
        name: value.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SDL: &str = r#"
        type Query {
            product(id: ID!): ProductDetails
        }
        type ProductDetails {
            id: ID!
            name: String!
            stockLevel: String
            tags: [String!]
        }
    "#;

    fn services() -> HashMap<String, ServiceConfig> {
        let mut services = HashMap::new();
        services.insert(
            "product-query".to_string(),
            ServiceConfig {
                url: "http://localhost:7101".to_string(),
                deadline_ms: 800,
                retry_reads: true,
                circuit_breaker: Default::default(),
            },
        );
        services
    }

    fn binding(yaml: &str) -> BindingConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn builds_the_resolver_table() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "Query.product".to_string(),
            binding("{service: product-query, method: GetProduct, key_arg: id, idempotent: true}"),
        );
        let schema = Schema::build(SDL, &bindings, &services()).unwrap();

        let field = schema.object(QUERY_TYPE).unwrap().field("product").unwrap();
        let bound = field.binding.as_ref().unwrap();
        assert_eq!(bound.coordinate, "Query.product");
        match &bound.kind {
            ResolverKind::Backend {
                service, key_field, ..
            } => {
                assert_eq!(service, "product-query");
                // key_field defaults to the key argument name.
                assert_eq!(key_field.as_deref(), Some("id"));
            }
            other => panic!("unexpected resolver kind: {other:?}"),
        }
    }

    #[test]
    fn type_refs_capture_nullability() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "Query.product".to_string(),
            binding("{service: product-query, method: GetProduct}"),
        );
        let schema = Schema::build(SDL, &bindings, &services()).unwrap();
        let product = schema.object("ProductDetails").unwrap();

        assert_eq!(
            product.field("name").unwrap().ty,
            TypeRef {
                name: "String".to_string(),
                non_null: true,
                is_list: false,
                item_non_null: false,
            }
        );
        assert_eq!(
            product.field("tags").unwrap().ty,
            TypeRef {
                name: "String".to_string(),
                non_null: false,
                is_list: true,
                item_non_null: true,
            }
        );
    }

    #[test]
    fn rejects_binding_on_unknown_field() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "Query.nope".to_string(),
            binding("{service: product-query, method: GetProduct}"),
        );
        bindings.insert(
            "Query.product".to_string(),
            binding("{service: product-query, method: GetProduct}"),
        );
        let err = Schema::build(SDL, &bindings, &services()).unwrap_err();
        assert!(matches!(err, ConfigError::Binding { field, .. } if field == "Query.nope"));
    }

    #[test]
    fn rejects_unbound_root_field() {
        let bindings = HashMap::new();
        let err = Schema::build(SDL, &bindings, &services()).unwrap_err();
        assert!(matches!(err, ConfigError::Binding { field, .. } if field == "Query.product"));
    }

    #[test]
    fn rejects_unknown_service() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "Query.product".to_string(),
            binding("{service: warehouse, method: GetProduct}"),
        );
        let err = Schema::build(SDL, &bindings, &services()).unwrap_err();
        assert!(matches!(err, ConfigError::Binding { .. }));
    }
}
