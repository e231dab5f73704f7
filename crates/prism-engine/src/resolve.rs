// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Driving request trees through the engine.
//!
//! [`Resolver::resolve`] hands back a [`DataPointer`] for any request.
//! Every subtree resolves under its own content identity, so identical
//! subtrees — no matter which tree they appear in — share one record and
//! one computation. Composite requests dispatch a [`ResolveJob`] whose
//! [`ResolutionRecord`] tracks child pointers; the job combines child
//! values once they settle.

use std::collections::BTreeMap;
use std::sync::Arc;

use prism_registry::Registry;
use prism_request::{Request, RequestKind, Value};
use tracing::debug;

use crate::engine::{Engine, RecordState};
use crate::job::{BackgroundJob, FailurePayload, JobContext, JobError, Step};
use crate::pointer::DataPointer;
use crate::queue::{Priority, QueueKind};
use crate::remote::{RemoteBackend, RemoteCall};

/// Resolves request trees against an engine, a function registry, and an
/// optional remote backend. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Resolver {
    engine: Engine,
    registry: Arc<Registry>,
    remote: Option<Arc<dyn RemoteBackend>>,
}

impl Resolver {
    /// Builds a resolver with no remote backend; `RemoteCalculation`
    /// requests will fail until one is attached.
    pub fn new(engine: Engine, registry: Arc<Registry>) -> Resolver {
        Resolver {
            engine,
            registry,
            remote: None,
        }
    }

    /// Attaches the off-process execution backend.
    pub fn with_remote(mut self, backend: Arc<dyn RemoteBackend>) -> Resolver {
        self.remote = Some(backend);
        self
    }

    /// The engine this resolver dispatches into.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns a pointer to `request`'s result, dispatching the resolution
    /// job if no computation exists yet. Never blocks on the result.
    pub fn resolve(&self, request: &Request) -> DataPointer {
        // Compacted inputs are legal everywhere a request is; resolution
        // works on the expanded tree.
        let expanded = request.expand_lets();
        let key = expanded.identity();
        let pointer = self.engine.acquire(key);
        match pointer.state() {
            RecordState::Nowhere | RecordState::Canceled => {}
            _ => return pointer,
        }

        match expanded.kind() {
            RequestKind::Immediate(value) => {
                // No job needed; seed the record directly.
                self.engine.set_result(key, value.clone());
            }
            RequestKind::RemoteCalculation(_) => {
                self.engine.dispatch(
                    key,
                    QueueKind::RemoteCalculation,
                    Box::new(ResolveJob::new(self.clone(), expanded.clone())),
                    Priority::default(),
                );
            }
            _ => {
                self.engine.dispatch(
                    key,
                    QueueKind::Calculation,
                    Box::new(ResolveJob::new(self.clone(), expanded.clone())),
                    Priority::default(),
                );
            }
        }
        debug!(%key, kind = expanded.kind().name(), "request resolution started");
        pointer
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

/// Lifecycle of one request tree's resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Children have not been dispatched yet.
    Uninitialized,
    /// Children are dispatched; waiting for them to settle.
    Resolving,
    /// The request's own value has been produced.
    Resolved,
}

/// Per-request-tree resolution state: the phase plus pointers to the child
/// subrequests that must settle before the parent can produce its value.
#[derive(Debug)]
pub struct ResolutionRecord {
    state: ResolutionState,
    children: Vec<DataPointer>,
}

impl ResolutionRecord {
    /// A fresh record with no children dispatched.
    pub fn new() -> ResolutionRecord {
        ResolutionRecord {
            state: ResolutionState::Uninitialized,
            children: Vec::new(),
        }
    }

    /// Current phase.
    pub fn state(&self) -> ResolutionState {
        self.state
    }

    /// Pointers to the dispatched child subrequests.
    pub fn children(&self) -> &[DataPointer] {
        &self.children
    }

    fn begin(&mut self, children: Vec<DataPointer>) {
        self.children = children;
        self.state = ResolutionState::Resolving;
    }

    /// `true` once no child is still computing.
    fn children_settled(&self) -> bool {
        self.children
            .iter()
            .all(|child| child.state() != RecordState::Computing)
    }
}

impl Default for ResolutionRecord {
    fn default() -> ResolutionRecord {
        ResolutionRecord::new()
    }
}

/// The background job that resolves one (sub)request.
struct ResolveJob {
    resolver: Resolver,
    request: Request,
    record: ResolutionRecord,
    meta_expanded: bool,
}

impl ResolveJob {
    fn new(resolver: Resolver, request: Request) -> ResolveJob {
        ResolveJob {
            resolver,
            request,
            record: ResolutionRecord::new(),
            meta_expanded: false,
        }
    }

    /// Reads child `index`'s settled value, propagating failures.
    fn child_value(&self, index: usize) -> Result<Value, JobError> {
        let Some(child) = self.record.children.get(index) else {
            return Err(JobError::execution("resolution child index out of range"));
        };
        match child.state() {
            RecordState::Ready => child
                .data()
                .cloned()
                .ok_or_else(|| JobError::execution("ready record holds no value")),
            RecordState::Failed => Err(JobError::Failed(child.failure().map_or_else(
                || FailurePayload::new(prism_registry::CODE_EXECUTION, "dependency failed"),
                |failure| failure,
            ))),
            _ => Err(JobError::execution(
                "dependency is unavailable (reset or canceled)",
            )),
        }
    }

    fn child_values(&self) -> Result<Vec<Value>, JobError> {
        (0..self.record.children.len())
            .map(|index| self.child_value(index))
            .collect()
    }
}

impl BackgroundJob for ResolveJob {
    fn gather_inputs(&mut self) {
        if self.record.state() != ResolutionState::Uninitialized {
            return;
        }
        let children = match self.request.kind() {
            RequestKind::Immediate(_)
            | RequestKind::ObjectRef(_)
            | RequestKind::Variable(_)
            | RequestKind::Let { .. } => Vec::new(),
            // The referenced record is attached as a child without
            // dispatching anything; whoever created it drives it.
            RequestKind::ImmutableRef(id) => vec![self.resolver.engine.acquire(*id)],
            RequestKind::FunctionCall { args, .. } => {
                args.iter().map(|arg| self.resolver.resolve(arg)).collect()
            }
            RequestKind::Array(items) => {
                items.iter().map(|item| self.resolver.resolve(item)).collect()
            }
            RequestKind::Structure(fields) => fields
                .values()
                .map(|value| self.resolver.resolve(value))
                .collect(),
            RequestKind::Property { base, .. } => vec![self.resolver.resolve(base)],
            RequestKind::Union { value, .. } => vec![self.resolver.resolve(value)],
            RequestKind::Optional(child)
            | RequestKind::Required(child)
            | RequestKind::Isolated(child)
            | RequestKind::Meta(child) => vec![self.resolver.resolve(child)],
            RequestKind::RemoteCalculation(inner) => match inner.kind() {
                RequestKind::FunctionCall { args, .. } => {
                    args.iter().map(|arg| self.resolver.resolve(arg)).collect()
                }
                _ => Vec::new(),
            },
        };
        self.record.begin(children);
    }

    fn inputs_ready(&self) -> bool {
        self.record.children_settled()
    }

    fn execute(&mut self, ctx: &JobContext) -> Result<Step, JobError> {
        ctx.check_in()?;
        let value = match self.request.kind() {
            RequestKind::Immediate(value) => value.clone(),
            RequestKind::Array(_) => Value::List(self.child_values()?),
            RequestKind::Structure(fields) => {
                let values = self.child_values()?;
                let map: BTreeMap<String, Value> =
                    fields.keys().cloned().zip(values).collect();
                Value::Map(map)
            }
            RequestKind::Property { field, .. } => match self.child_value(0)? {
                Value::Map(map) => map.get(field).cloned().ok_or_else(|| {
                    JobError::execution(format!("no field `{field}` in resolved structure"))
                })?,
                other => {
                    return Err(JobError::execution(format!(
                        "property access on non-structure value ({})",
                        other.kind_name()
                    )))
                }
            },
            RequestKind::Union { member, .. } => {
                let value = self.child_value(0)?;
                Value::Map(BTreeMap::from([(member.clone(), value)]))
            }
            RequestKind::Optional(_) | RequestKind::Isolated(_) => self.child_value(0)?,
            RequestKind::Required(_) => {
                let value = self.child_value(0)?;
                if value.is_null() {
                    return Err(JobError::execution("required value is absent"));
                }
                value
            }
            RequestKind::FunctionCall { name, .. } => {
                let args = self.child_values()?;
                let function = self
                    .resolver
                    .registry
                    .lookup(name)
                    .ok_or_else(|| prism_registry::CalcError::unknown_function(name))?;
                function.call(&ctx.call_context(), &args)?
            }
            RequestKind::Meta(_) => {
                if self.meta_expanded {
                    self.child_value(0)?
                } else {
                    // Phase one settled: decode the generated request and
                    // resolve it as the new (only) child.
                    let encoded = self.child_value(0)?;
                    let Value::Bytes(bytes) = encoded else {
                        return Err(JobError::execution(
                            "meta generator must produce encoded request bytes",
                        ));
                    };
                    let generated = Request::decode_cbor(&bytes)
                        .map_err(|err| JobError::execution(err.to_string()))?;
                    let pointer = self.resolver.resolve(&generated);
                    self.record.begin(vec![pointer]);
                    self.meta_expanded = true;
                    return Ok(Step::Pending);
                }
            }
            RequestKind::ImmutableRef(id) => match self.record.children.first() {
                Some(child) if child.state() == RecordState::Ready => self.child_value(0)?,
                Some(child) if child.state() == RecordState::Failed => self.child_value(0)?,
                _ => {
                    return Err(JobError::execution(format!(
                        "unresolved immutable reference {id}"
                    )))
                }
            },
            RequestKind::ObjectRef(entity) => self
                .resolver
                .engine
                .mutable()
                .get_latest(*entity, None)
                .ok_or_else(|| {
                    JobError::execution(format!("no cached value for entity {entity}"))
                })?,
            RequestKind::RemoteCalculation(inner) => {
                let RequestKind::FunctionCall {
                    account,
                    app,
                    name,
                    level,
                    ..
                } = inner.kind()
                else {
                    return Err(JobError::execution(
                        "remote calculation requires a function call",
                    ));
                };
                let backend = self
                    .resolver
                    .remote
                    .clone()
                    .ok_or_else(|| JobError::execution("no remote backend configured"))?;
                let call = RemoteCall {
                    account: account.clone(),
                    app: app.clone(),
                    name: name.clone(),
                    args: self.child_values()?,
                    level: *level,
                };
                backend.submit(call, ctx)?
            }
            RequestKind::Variable(name) => {
                return Err(JobError::execution(format!("unbound variable `{name}`")))
            }
            RequestKind::Let { .. } => {
                return Err(JobError::execution("unexpected binding in expanded request"))
            }
        };
        self.record.state = ResolutionState::Resolved;
        Ok(Step::Finished(value))
    }

    fn describe(&self) -> String {
        format!("resolve {}", self.request.kind().name())
    }
}
