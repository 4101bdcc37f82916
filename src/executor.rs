use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::AuthContext;
use crate::backend::CallDescriptor;
use crate::config::ServiceConfig;
use crate::error::{ErrorCode, FieldError, GraphQLError, ResponsePath};
use crate::plan::{ExecutionPlan, OperationKind, ResolutionNode, SelectionItem};
use crate::resilience::ResilientBackend;
use crate::schema::ResolverKind;
use crate::trace::TraceContext;

/// A node's terminal outcome. `Err` means the node failed and its error is
/// already recorded at the failing path; callers decide whether that nulls
/// the field or bubbles to the nearest nullable ancestor.
type Resolved = Result<Value, ()>;

/// Executes validated plans: dispatches backend calls through the
/// resiliency wrapper, enforces per-field authorization, coalesces
/// batchable sibling calls, and merges results in document order.
pub struct Executor {
    backend: Arc<ResilientBackend>,
    deadlines: HashMap<String, Duration>,
}

impl Executor {
    pub fn new(backend: Arc<ResilientBackend>, services: &HashMap<String, ServiceConfig>) -> Self {
        let deadlines = services
            .iter()
            .map(|(name, service)| (name.clone(), Duration::from_millis(service.deadline_ms)))
            .collect();
        Executor { backend, deadlines }
    }

    /// Runs the plan to completion and merges the partial results. Query
    /// branches run concurrently; mutations run serially in document order.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        auth: &AuthContext,
        trace: &TraceContext,
    ) -> (Value, Vec<GraphQLError>) {
        let errors = Mutex::new(Vec::new());
        let ctx = ExecCtx {
            exec: self,
            auth,
            trace,
            errors: &errors,
        };

        let invocations: Vec<Invocation<'_>> = plan
            .roots
            .iter()
            .map(|node| Invocation {
                node,
                path: ResponsePath::root().field(&node.response_key),
                prepared: prepare_call(node, None, auth),
            })
            .collect();

        let outcomes = match plan.operation {
            OperationKind::Query => ctx.resolve_nodes(invocations).await,
            OperationKind::Mutation => {
                let mut outcomes = Vec::with_capacity(invocations.len());
                for invocation in invocations {
                    outcomes.push(ctx.resolve_nodes(vec![invocation]).await.remove(0));
                }
                outcomes
            }
        };

        // Merge in document order, independent of completion order.
        let mut data = Map::new();
        let mut bubbled_to_root = false;
        for (node, outcome) in plan.roots.iter().zip(outcomes) {
            match outcome {
                Ok(value) => {
                    data.insert(node.response_key.clone(), value);
                }
                Err(()) if node.ty.non_null => bubbled_to_root = true,
                Err(()) => {
                    data.insert(node.response_key.clone(), Value::Null);
                }
            }
        }

        let data = if bubbled_to_root {
            Value::Null
        } else {
            Value::Object(data)
        };
        let errors = errors
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(FieldError::to_graphql_error)
            .collect();
        (data, errors)
    }
}

/// One requested resolution of a node: its path in the response and the
/// prepared request payload (args, key from the parent, subject).
struct Invocation<'p> {
    node: &'p ResolutionNode,
    path: ResponsePath,
    prepared: Result<(Map<String, Value>, Option<Value>), FieldError>,
}

/// A dispatchable backend call, after authorization passed.
struct DispatchItem<'p> {
    index: usize,
    node: &'p ResolutionNode,
    path: ResponsePath,
    payload: Map<String, Value>,
    key: Option<Value>,
}

struct ExecCtx<'e> {
    exec: &'e Executor,
    auth: &'e AuthContext,
    trace: &'e TraceContext,
    errors: &'e Mutex<Vec<FieldError>>,
}

impl<'e> ExecCtx<'e> {
    fn record(&self, error: FieldError) {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(error);
    }

    /// Resolves a set of sibling node invocations. Calls that share a
    /// binding with a batch method and differ only in key are coalesced
    /// into one backend call; everything else fans out concurrently.
    fn resolve_nodes<'a>(&'a self, invocations: Vec<Invocation<'e>>) -> BoxFuture<'a, Vec<Resolved>>
    where
        'e: 'a,
    {
        async move {
            let mut outcomes: Vec<Option<Resolved>> = Vec::new();
            outcomes.resize_with(invocations.len(), || None);
            let mut local: Vec<(usize, &'e ResolutionNode, ResponsePath)> = Vec::new();
            let mut dispatch: Vec<DispatchItem<'e>> = Vec::new();

            for (index, invocation) in invocations.into_iter().enumerate() {
                let binding = &invocation.node.binding;

                // Per-field capability check; failures never reach the backend.
                let requires_auth = binding.authenticated || requires_subject(invocation.node);
                if let Err(auth_error) = self
                    .auth
                    .check_field(requires_auth, binding.scope.as_deref())
                {
                    self.record(FieldError::new(
                        auth_error.code(),
                        auth_error.to_string(),
                        invocation.path,
                    ));
                    outcomes[index] = Some(Err(()));
                    continue;
                }

                match &binding.kind {
                    ResolverKind::CurrentUser => {
                        local.push((index, invocation.node, invocation.path));
                    }
                    ResolverKind::Backend { .. } => match invocation.prepared {
                        Ok((payload, key)) => dispatch.push(DispatchItem {
                            index,
                            node: invocation.node,
                            path: invocation.path,
                            payload,
                            key,
                        }),
                        Err(error) => {
                            // Preparation errors surface at the field they
                            // were resolving, not at the response root.
                            self.record(FieldError::new(
                                error.code,
                                error.message,
                                invocation.path,
                            ));
                            outcomes[index] = Some(Err(()));
                        }
                    },
                }
            }

            for (index, node, path) in local {
                let value = current_user_value(self.auth);
                outcomes[index] = Some(self.apply_node_value(node, value, path).await);
            }

            // The per-plan coalescing window: group batch-capable calls by
            // binding and by their non-key payload.
            let mut groups: Vec<Vec<DispatchItem<'e>>> = Vec::new();
            let mut group_index: HashMap<(usize, String), usize> = HashMap::new();
            for item in dispatch {
                let batch_capable = item.key.is_some() && batch_method(item.node).is_some();
                if !batch_capable {
                    groups.push(vec![item]);
                    continue;
                }
                let group_key = (
                    Arc::as_ptr(&item.node.binding) as usize,
                    non_key_payload_fingerprint(item.node, &item.payload),
                );
                match group_index.get(&group_key) {
                    Some(&slot) => groups[slot].push(item),
                    None => {
                        group_index.insert(group_key, groups.len());
                        groups.push(vec![item]);
                    }
                }
            }

            let group_results =
                join_all(groups.into_iter().map(|group| self.dispatch_group(group))).await;
            for (index, resolved) in group_results.into_iter().flatten() {
                outcomes[index] = Some(resolved);
            }

            outcomes
                .into_iter()
                .map(|outcome| outcome.unwrap_or(Err(())))
                .collect()
        }
        .boxed()
    }

    /// Executes one coalescing group: a single batched call when the group
    /// has several members, an individual call otherwise.
    fn dispatch_group<'a>(
        &'a self,
        group: Vec<DispatchItem<'e>>,
    ) -> BoxFuture<'a, Vec<(usize, Resolved)>>
    where
        'e: 'a,
    {
        async move {
            if group.len() > 1 {
                return self.dispatch_batch(group).await;
            }
            join_all(group.into_iter().map(|item| async move {
                let node = item.node;
                let descriptor = self.descriptor(node, item.payload, method_of(node));
                let index = item.index;
                match self.exec.backend.invoke(&descriptor).await {
                    Ok(value) => {
                        let value = extract_response_field(node, value);
                        (index, self.apply_node_value(node, value, item.path).await)
                    }
                    Err(failure) => (index, self.fail_or_fall_back(node, &failure, item.path)),
                }
            }))
            .await
        }
        .boxed()
    }

    fn dispatch_batch<'a>(
        &'a self,
        group: Vec<DispatchItem<'e>>,
    ) -> BoxFuture<'a, Vec<(usize, Resolved)>>
    where
        'e: 'a,
    {
        async move {
            let node = group[0].node;
            let method = batch_method(node).expect("batch group without batch method");

            // Shared non-key fields plus the collected key set.
            let mut payload = group[0].payload.clone();
            if let Some(key_field) = key_field(node) {
                payload.remove(key_field);
            }
            let keys: Vec<Value> = group
                .iter()
                .filter_map(|item| item.key.clone())
                .collect();
            payload.insert("keys".to_string(), Value::Array(keys));

            let descriptor = self.descriptor(node, payload, method);
            match self.exec.backend.invoke(&descriptor).await {
                Ok(response) => {
                    let items = batch_items(&response);
                    let service = descriptor.service.clone();
                    join_all(group.into_iter().map(|item| {
                        let found = item.key.as_ref().and_then(|key| {
                            items.iter().find(|(k, _)| k == &key).map(|(_, v)| v.clone())
                        });
                        let service = service.clone();
                        async move {
                            let index = item.index;
                            match found {
                                Some(value) => {
                                    let value = extract_response_field(item.node, value);
                                    (
                                        index,
                                        self.apply_node_value(item.node, value, item.path).await,
                                    )
                                }
                                None => {
                                    self.record(FieldError::new(
                                        ErrorCode::BackendError,
                                        format!(
                                            "batch response from '{service}' had no entry for the requested key"
                                        ),
                                        item.path.clone(),
                                    ));
                                    (index, Err(()))
                                }
                            }
                        }
                    }))
                    .await
                }
                Err(failure) => group
                    .into_iter()
                    .map(|item| (item.index, self.fail_or_fall_back(item.node, &failure, item.path)))
                    .collect(),
            }
        }
        .boxed()
    }

    /// Applies the node's selection set to its resolved value, resolving
    /// dependent child nodes along the way.
    fn apply_node_value<'a>(
        &'a self,
        node: &'e ResolutionNode,
        value: Value,
        path: ResponsePath,
    ) -> BoxFuture<'a, Resolved>
    where
        'e: 'a,
    {
        async move {
            if value.is_null() {
                return if node.ty.non_null {
                    self.record(FieldError::new(
                        ErrorCode::BackendError,
                        format!("backend returned no value for non-nullable field '{}'", node.field_name),
                        path,
                    ));
                    Err(())
                } else {
                    Ok(Value::Null)
                };
            }
            if node.selections.is_empty() {
                return Ok(value);
            }

            if node.ty.is_list {
                let Value::Array(elements) = value else {
                    self.record(malformed(&node.field_name, &path));
                    return Err(());
                };
                let objects = match self.element_objects(&node.field_name, elements, &path) {
                    Ok(objects) => objects,
                    Err(()) => return Err(()),
                };
                let projected = self.project_object_set(objects, &node.selections).await;
                self.reassemble_list(projected, node.ty.item_non_null)
            } else {
                let Value::Object(object) = value else {
                    self.record(malformed(&node.field_name, &path));
                    return Err(());
                };
                let mut projected = self
                    .project_object_set(vec![(path, object)], &node.selections)
                    .await;
                projected.remove(0).map(Value::Object)
            }
        }
        .boxed()
    }

    /// Projects a set of same-shaped objects through one selection list.
    /// Working on the whole set at once is what lets dependent child calls
    /// coalesce across list elements.
    fn project_object_set<'a>(
        &'a self,
        objects: Vec<(ResponsePath, Map<String, Value>)>,
        selections: &'e [SelectionItem],
    ) -> BoxFuture<'a, Vec<Result<Map<String, Value>, ()>>>
    where
        'e: 'a,
    {
        async move {
            let mut fields: Vec<Vec<(String, Resolved)>> = Vec::new();
            fields.resize_with(objects.len(), Vec::new);

            for selection in selections {
                match selection {
                    SelectionItem::Scalar {
                        response_key,
                        field_name,
                        ty,
                    } => {
                        for (i, (path, object)) in objects.iter().enumerate() {
                            let value = object.get(field_name).cloned().unwrap_or(Value::Null);
                            let resolved = if value.is_null() && ty.non_null {
                                self.record(FieldError::new(
                                    ErrorCode::BackendError,
                                    format!(
                                        "backend returned no value for non-nullable field '{field_name}'"
                                    ),
                                    path.field(response_key),
                                ));
                                Err(())
                            } else {
                                Ok(value)
                            };
                            fields[i].push((response_key.clone(), resolved));
                        }
                    }

                    SelectionItem::Object {
                        response_key,
                        field_name,
                        ty,
                        selections,
                    } => {
                        // Flatten every parent's child objects into one set,
                        // recurse once, then fold results back per parent.
                        let mut flat: Vec<(ResponsePath, Map<String, Value>)> = Vec::new();
                        let mut shapes: Vec<Result<Option<usize>, ()>> = Vec::new();
                        for (path, object) in &objects {
                            let child_path = path.field(response_key);
                            let raw = object.get(field_name).cloned().unwrap_or(Value::Null);
                            let shape = match raw {
                                Value::Null => {
                                    if ty.non_null {
                                        self.record(FieldError::new(
                                            ErrorCode::BackendError,
                                            format!(
                                                "backend returned no value for non-nullable field '{field_name}'"
                                            ),
                                            child_path,
                                        ));
                                        Err(())
                                    } else {
                                        Ok(None)
                                    }
                                }
                                Value::Array(elements) if ty.is_list => {
                                    match self.element_objects(field_name, elements, &child_path) {
                                        Ok(objects) => {
                                            let count = objects.len();
                                            flat.extend(objects);
                                            Ok(Some(count))
                                        }
                                        Err(()) => Err(()),
                                    }
                                }
                                Value::Object(map) if !ty.is_list => {
                                    flat.push((child_path, map));
                                    Ok(Some(1))
                                }
                                _ => {
                                    self.record(malformed(field_name, &child_path));
                                    Err(())
                                }
                            };
                            shapes.push(shape);
                        }

                        let mut projected = self
                            .project_object_set(flat, selections)
                            .await
                            .into_iter();
                        for (i, shape) in shapes.into_iter().enumerate() {
                            let resolved = match shape {
                                Err(()) => Err(()),
                                Ok(None) => Ok(Value::Null),
                                Ok(Some(count)) => {
                                    let slice: Vec<Result<Map<String, Value>, ()>> =
                                        projected.by_ref().take(count).collect();
                                    if ty.is_list {
                                        self.reassemble_list(slice, ty.item_non_null)
                                    } else {
                                        slice
                                            .into_iter()
                                            .next()
                                            .unwrap_or(Err(()))
                                            .map(Value::Object)
                                    }
                                }
                            };
                            let resolved = match resolved {
                                Err(()) if !ty.non_null => Ok(Value::Null),
                                other => other,
                            };
                            fields[i].push((response_key.clone(), resolved));
                        }
                    }

                    SelectionItem::Bound(node) => {
                        let invocations = objects
                            .iter()
                            .map(|(path, object)| Invocation {
                                node,
                                path: path.field(&node.response_key),
                                prepared: prepare_call(node, Some(object), self.auth),
                            })
                            .collect();
                        let resolved = self.resolve_nodes(invocations).await;
                        for (i, outcome) in resolved.into_iter().enumerate() {
                            let outcome = match outcome {
                                Err(()) if !node.ty.non_null => Ok(Value::Null),
                                other => other,
                            };
                            fields[i].push((node.response_key.clone(), outcome));
                        }
                    }
                }
            }

            fields
                .into_iter()
                .map(|object_fields| {
                    let mut map = Map::new();
                    for (key, resolved) in object_fields {
                        map.insert(key, resolved?);
                    }
                    Ok(map)
                })
                .collect()
        }
        .boxed()
    }

    fn element_objects(
        &self,
        field_name: &str,
        elements: Vec<Value>,
        path: &ResponsePath,
    ) -> Result<Vec<(ResponsePath, Map<String, Value>)>, ()> {
        let mut objects = Vec::with_capacity(elements.len());
        for (i, element) in elements.into_iter().enumerate() {
            let Value::Object(map) = element else {
                self.record(malformed(field_name, &path.index(i)));
                return Err(());
            };
            objects.push((path.index(i), map));
        }
        Ok(objects)
    }

    fn reassemble_list(
        &self,
        projected: Vec<Result<Map<String, Value>, ()>>,
        item_non_null: bool,
    ) -> Resolved {
        let mut items = Vec::with_capacity(projected.len());
        for element in projected {
            match element {
                Ok(map) => items.push(Value::Object(map)),
                Err(()) if item_non_null => return Err(()),
                Err(()) => items.push(Value::Null),
            }
        }
        Ok(Value::Array(items))
    }

    /// Converts a backend failure into the node's outcome: the configured
    /// degraded value for infrastructure failures on fields that opted in,
    /// a recorded error otherwise.
    fn fail_or_fall_back(
        &self,
        node: &ResolutionNode,
        failure: &crate::error::BackendFailure,
        path: ResponsePath,
    ) -> Resolved {
        use crate::error::BackendFailure;
        let infrastructure = matches!(
            failure,
            BackendFailure::Timeout(_)
                | BackendFailure::CircuitOpen { .. }
                | BackendFailure::Unavailable(_)
        );
        if infrastructure {
            if let Some(fallback) = &node.binding.fallback {
                tracing::warn!(
                    field = %node.binding.coordinate,
                    failure = %failure,
                    "substituting configured fallback value"
                );
                return Ok(fallback.clone());
            }
        }
        self.record(FieldError::from_backend(failure, path));
        Err(())
    }

    fn descriptor(
        &self,
        node: &ResolutionNode,
        payload: Map<String, Value>,
        method: &str,
    ) -> CallDescriptor {
        let (service, idempotent) = match &node.binding.kind {
            ResolverKind::Backend {
                service, idempotent, ..
            } => (service.clone(), *idempotent),
            ResolverKind::CurrentUser => unreachable!("local resolvers never dispatch"),
        };
        let deadline = self
            .exec
            .deadlines
            .get(&service)
            .copied()
            .unwrap_or(Duration::from_millis(800));
        CallDescriptor {
            service,
            method: method.to_string(),
            payload: Value::Object(payload),
            deadline,
            trace: self.trace.child(),
            idempotent,
        }
    }
}

/// Builds the request payload for one node: arguments, the key taken from
/// the argument list or the parent payload, and the authenticated subject
/// where the binding asks for it.
fn prepare_call(
    node: &ResolutionNode,
    parent: Option<&Map<String, Value>>,
    auth: &AuthContext,
) -> Result<(Map<String, Value>, Option<Value>), FieldError> {
    let ResolverKind::Backend {
        key_arg,
        parent_key,
        key_field,
        subject_field,
        ..
    } = &node.binding.kind
    else {
        return Ok((Map::new(), None));
    };

    let mut payload = node.args.clone();
    let mut key = None;

    if let (Some(arg), Some(field)) = (key_arg, key_field) {
        if let Some(value) = payload.remove(arg) {
            key = Some(value.clone());
            payload.insert(field.clone(), value);
        }
    }

    if let (Some(parent_field), Some(field)) = (parent_key, key_field) {
        let value = parent
            .and_then(|map| map.get(parent_field))
            .cloned()
            .unwrap_or(Value::Null);
        if value.is_null() {
            return Err(FieldError::new(
                ErrorCode::InternalError,
                format!(
                    "parent result is missing '{parent_field}', required to resolve '{}'",
                    node.binding.coordinate
                ),
                ResponsePath::root(),
            ));
        }
        key = Some(value.clone());
        payload.insert(field.clone(), value);
    }

    if let Some(field) = subject_field {
        if let Some(subject) = &auth.subject {
            payload.insert(field.clone(), Value::String(subject.clone()));
        }
    }

    Ok((payload, key))
}

fn requires_subject(node: &ResolutionNode) -> bool {
    matches!(
        &node.binding.kind,
        ResolverKind::Backend {
            subject_field: Some(_),
            ..
        }
    )
}

fn method_of(node: &ResolutionNode) -> &str {
    match &node.binding.kind {
        ResolverKind::Backend { method, .. } => method,
        ResolverKind::CurrentUser => "",
    }
}

fn batch_method(node: &ResolutionNode) -> Option<&str> {
    match &node.binding.kind {
        ResolverKind::Backend { batch_method, .. } => batch_method.as_deref(),
        ResolverKind::CurrentUser => None,
    }
}

fn key_field(node: &ResolutionNode) -> Option<&str> {
    match &node.binding.kind {
        ResolverKind::Backend { key_field, .. } => key_field.as_deref(),
        ResolverKind::CurrentUser => None,
    }
}

fn extract_response_field(node: &ResolutionNode, value: Value) -> Value {
    match &node.binding.kind {
        ResolverKind::Backend {
            response_field: Some(field),
            ..
        } => value.get(field).cloned().unwrap_or(Value::Null),
        _ => value,
    }
}

/// `{"items": [{"key": k, "value": {...}}]}` from a batch method, as
/// key/value pairs.
fn batch_items(response: &Value) -> Vec<(&Value, Value)> {
    response
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let key = item.get("key")?;
                    let value = item.get("value").cloned().unwrap_or(Value::Null);
                    Some((key, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn current_user_value(auth: &AuthContext) -> Value {
    json!({
        "id": auth.subject.clone().unwrap_or_default(),
        "username": auth.username,
        "email": auth.email,
        "roles": auth.roles,
    })
}

fn malformed(field_name: &str, path: &ResponsePath) -> FieldError {
    FieldError::new(
        ErrorCode::BackendError,
        format!("backend response for '{field_name}' had an unexpected shape"),
        path.clone(),
    )
}

/// The payload minus the key field, serialized; calls only coalesce when
/// everything except the key matches.
fn non_key_payload_fingerprint(node: &ResolutionNode, payload: &Map<String, Value>) -> String {
    let mut rest = payload.clone();
    if let Some(field) = key_field(node) {
        rest.remove(field);
    }
    serde_json::to_string(&Value::Object(rest)).unwrap_or_default()
}
