//! Lazily fetched view of a paused program: stack frames, their scopes and
//! variables.
//!
//! Every handle the tree gives out carries the [`Generation`] it was produced
//! in. A generation spans one pause; any run-state transition starts a new one
//! and drops the whole cache at once, so handles from an earlier pause can never
//! resolve to data from a later one.

use std::{collections::HashMap, fmt, future::Future, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::client::DapConnection;
use crate::dap::types::{
    self, ScopesArguments, ScopesResponseBody, StackTraceArguments, StackTraceResponseBody,
    VariablesArguments, VariablesResponseBody,
};
use crate::error::{DebugError, DebugResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stack frame handle, valid within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRef {
    generation: Generation,
    id: i64,
}

impl FrameRef {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

/// An expandable node (scope or structured variable), valid within one
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    generation: Generation,
    raw: i64,
}

impl VarRef {
    /// Rebuild a handle from a generation and an adapter `variablesReference`,
    /// e.g. one typed in by a user.
    pub fn from_parts(generation: Generation, raw: i64) -> Self {
        Self { generation, raw }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn raw(&self) -> i64 {
        self.raw
    }

    /// DAP uses `0` for "no children".
    fn expandable(generation: Generation, raw: i64) -> Option<Self> {
        (raw > 0).then_some(Self { generation, raw })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub frame: FrameRef,
    pub name: String,
    pub source: Option<PathBuf>,
    pub line: i64,
    pub column: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub variables: Option<VarRef>,
    pub expensive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
    pub children: Option<VarRef>,
}

/// Where the tree fetches from. Implemented by [`DapConnection`]; tests use
/// scripted sources.
pub trait InspectionSource: Send + Sync + 'static {
    fn stack_trace(
        &self,
        thread_id: i64,
    ) -> impl Future<Output = DebugResult<Vec<types::StackFrame>>> + Send;

    fn scopes(&self, frame_id: i64) -> impl Future<Output = DebugResult<Vec<types::Scope>>> + Send;

    fn variables(
        &self,
        reference: i64,
    ) -> impl Future<Output = DebugResult<Vec<types::Variable>>> + Send;
}

impl InspectionSource for DapConnection {
    async fn stack_trace(&self, thread_id: i64) -> DebugResult<Vec<types::StackFrame>> {
        let body: StackTraceResponseBody = self
            .request_body(
                "stackTrace",
                StackTraceArguments {
                    thread_id,
                    start_frame: None,
                    levels: None,
                },
            )
            .await?;
        Ok(body.stack_frames)
    }

    async fn scopes(&self, frame_id: i64) -> DebugResult<Vec<types::Scope>> {
        let body: ScopesResponseBody = self
            .request_body("scopes", ScopesArguments { frame_id })
            .await?;
        Ok(body.scopes)
    }

    async fn variables(&self, reference: i64) -> DebugResult<Vec<types::Variable>> {
        let body: VariablesResponseBody = self
            .request_body(
                "variables",
                VariablesArguments {
                    variables_reference: reference,
                },
            )
            .await?;
        Ok(body.variables)
    }
}

type Slot<T> = Arc<OnceCell<Vec<T>>>;

#[derive(Default)]
struct Arena {
    generation: Generation,
    paused: bool,
    closed: bool,
    stacks: HashMap<i64, Slot<StackFrame>>,
    scopes: HashMap<i64, Slot<Scope>>,
    variables: HashMap<i64, Slot<Variable>>,
}

impl Arena {
    fn reset(&mut self) {
        self.stacks.clear();
        self.scopes.clear();
        self.variables.clear();
    }

    fn check_current(&self, requested: Generation) -> DebugResult<()> {
        if self.closed {
            return Err(DebugError::SessionTerminated);
        }
        if requested != self.generation {
            return Err(DebugError::StaleGeneration {
                requested,
                current: self.generation,
            });
        }
        Ok(())
    }
}

/// Generation-scoped cache over an [`InspectionSource`].
///
/// Concurrent first requests for the same key share a single fetch. A failed
/// fetch leaves its slot empty so the next caller retries.
pub struct InspectionTree<S> {
    source: S,
    arena: Mutex<Arena>,
}

impl<S: InspectionSource> InspectionTree<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            arena: Mutex::new(Arena::default()),
        }
    }

    pub fn generation(&self) -> Generation {
        self.arena.lock().generation
    }

    /// Start a new generation, dropping everything cached so far.
    pub fn advance(&self, paused: bool) -> Generation {
        let mut arena = self.arena.lock();
        arena.generation = arena.generation.next();
        arena.paused = paused;
        arena.reset();
        arena.generation
    }

    /// Drop the cache for good; later calls fail with `SessionTerminated`.
    pub fn close(&self) -> Generation {
        let generation = self.advance(false);
        self.arena.lock().closed = true;
        generation
    }

    pub async fn stack_trace(&self, thread_id: i64) -> DebugResult<Vec<StackFrame>> {
        let (generation, slot) = {
            let mut arena = self.arena.lock();
            if arena.closed {
                return Err(DebugError::SessionTerminated);
            }
            if !arena.paused {
                return Err(DebugError::NotPaused);
            }
            let slot = arena.stacks.entry(thread_id).or_default().clone();
            (arena.generation, slot)
        };

        let frames = slot
            .get_or_try_init(|| async {
                let raw = self.source.stack_trace(thread_id).await?;
                Ok::<_, DebugError>(
                    raw.into_iter()
                        .map(|frame| StackFrame {
                            frame: FrameRef {
                                generation,
                                id: frame.id,
                            },
                            name: frame.name,
                            source: frame.source.and_then(|source| source.path).map(PathBuf::from),
                            line: frame.line,
                            column: frame.column,
                        })
                        .collect(),
                )
            })
            .await?
            .clone();

        self.arena.lock().check_current(generation)?;
        Ok(frames)
    }

    pub async fn scopes(&self, frame: FrameRef) -> DebugResult<Vec<Scope>> {
        let generation = frame.generation;
        let slot = {
            let mut arena = self.arena.lock();
            arena.check_current(generation)?;
            arena.scopes.entry(frame.id).or_default().clone()
        };

        let scopes = slot
            .get_or_try_init(|| async {
                let raw = self.source.scopes(frame.id).await?;
                Ok::<_, DebugError>(
                    raw.into_iter()
                        .map(|scope| Scope {
                            name: scope.name,
                            variables: VarRef::expandable(generation, scope.variables_reference),
                            expensive: scope.expensive,
                        })
                        .collect(),
                )
            })
            .await?
            .clone();

        self.arena.lock().check_current(generation)?;
        Ok(scopes)
    }

    pub async fn variables(&self, reference: VarRef) -> DebugResult<Vec<Variable>> {
        let generation = reference.generation;
        let slot = {
            let mut arena = self.arena.lock();
            arena.check_current(generation)?;
            arena.variables.entry(reference.raw).or_default().clone()
        };

        let variables = slot
            .get_or_try_init(|| async {
                let raw = self.source.variables(reference.raw).await?;
                Ok::<_, DebugError>(
                    raw.into_iter()
                        .map(|variable| Variable {
                            name: variable.name,
                            value: variable.value,
                            type_name: variable.type_,
                            children: VarRef::expandable(generation, variable.variables_reference),
                        })
                        .collect(),
                )
            })
            .await?
            .clone();

        self.arena.lock().check_current(generation)?;
        Ok(variables)
    }
}
