//! Kernel functions and their parameters.

use serde::{Deserialize, Serialize};

use crate::arena::{Arena, Handle};
use crate::buffer::{Buffer, Event, EventState};
use crate::expr::Var;
use crate::stmt::Stmt;

/// A function parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Param {
    /// A scalar or vector value passed by value.
    Scalar(Var),
    /// A pointer to a buffer.
    Buffer(Handle<Buffer>),
}

/// A kernel function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    /// Every buffer the function touches, parameters and scratch alike.
    pub buffers: Arena<Buffer>,
    #[serde(default)]
    pub events: Arena<Event>,
    /// Filled in by event-state initialization.
    #[serde(default)]
    pub event_state: Option<EventState>,
    pub body: Stmt,
}

impl Function {
    /// Creates an empty function with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            buffers: Arena::new(),
            events: Arena::new(),
            event_state: None,
            body: Stmt::empty(),
        }
    }

    /// Adds a buffer and a matching parameter.
    pub fn add_buffer_param(&mut self, buffer: Buffer) -> Handle<Buffer> {
        let handle = self.buffers.append(buffer);
        self.params.push(Param::Buffer(handle));
        handle
    }

    /// Adds a buffer that is not a parameter (on-chip scratch).
    pub fn add_scratch(&mut self, buffer: Buffer) -> Handle<Buffer> {
        self.buffers.append(buffer)
    }

    pub fn is_param_buffer(&self, handle: Handle<Buffer>) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p, Param::Buffer(h) if *h == handle))
    }
}
