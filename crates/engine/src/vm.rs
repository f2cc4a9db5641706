// Sidetrack - side-effect capture for speculative evaluation
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Debugger-side view of the target VM
//!
//! The capture engine never owns heap memory. Everything it knows about the debuggee, and every
//! mutation it performs, goes through the [`Debuggee`] trait implemented by a debugger back-end.
//!
//! # Write semantics
//!
//! Writes issued through [`Debuggee`] are debugger-side writes: they must **not** trigger
//! watchpoints or method-entry events. Only code executed by the target (the candidate being
//! evaluated) produces [`DebugEvent`]s.
//!
//! # Event delivery
//!
//! Events are delivered synchronously to the registered [`EventListener`] on the back-end's
//! dispatch thread, and the target stays suspended until the listener returns. The listener may
//! call back into the [`Debuggee`] (to read old values or register new watchpoints), so
//! implementations must not hold internal locks while dispatching.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sidetrack_common::types::{
    FieldId, ObjectId, ObjectRef, RequestId, ThreadId, TypeId, TypeSignature, Value,
};
use thiserror::Error;

/// Result type of debuggee operations
pub type VmResult<T> = Result<T, VmError>;

/// Failures reported by the debugger back-end
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// A value of the wrong type was written to a location
    #[error("type mismatch: cannot store {value} into {target} of type {expected}")]
    TypeMismatch {
        /// Description of the written location
        target: String,
        /// Declared type of the location
        expected: String,
        /// The rejected value
        value: String,
    },
    /// A type needed for the operation has not been loaded
    #[error("class not loaded: {0}")]
    ClassNotLoaded(String),
    /// The object has been garbage collected
    #[error("object {0} has been collected")]
    ObjectCollected(ObjectId),
    /// Array index outside the array bounds
    #[error("index {index} out of bounds for {array} of length {length}")]
    IndexOutOfBounds {
        /// The array
        array: ObjectId,
        /// Requested index
        index: usize,
        /// Actual length
        length: usize,
    },
    /// Replacing array contents with a sequence of another length
    #[error("cannot write {given} elements into {array} of length {length}")]
    LengthMismatch {
        /// The array
        array: ObjectId,
        /// Number of elements supplied
        given: usize,
        /// Actual length
        length: usize,
    },
    /// The object is not an array
    #[error("{0} is not an array")]
    NotAnArray(ObjectId),
    /// No such field
    #[error("unknown field {0}")]
    UnknownField(FieldId),
    /// No such type
    #[error("unknown type {0}")]
    UnknownType(TypeId),
    /// No such local variable in the thread's current frame
    #[error("no variable `{name}` visible in {thread}")]
    UnknownVariable {
        /// Variable name
        name: String,
        /// Owning thread
        thread: ThreadId,
    },
    /// No such event request
    #[error("unknown event request {0}")]
    UnknownRequest(RequestId),
    /// The connection to the debuggee is gone
    #[error("debuggee disconnected")]
    Disconnected,
    /// Any other back-end failure
    #[error("{0}")]
    Other(String),
}

/// A loaded reference type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    /// Type id
    pub id: TypeId,
    /// Dotted type name
    pub name: String,
    /// Abstract class or interface
    pub is_abstract: bool,
    /// Direct supertypes (superclass and implemented interfaces)
    pub supertypes: Vec<TypeId>,
}

/// A field declared by a loaded type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Field id
    pub id: FieldId,
    /// Declaring type
    pub declaring_type: TypeId,
    /// Simple name of the declaring type, used for display
    pub declaring_type_name: String,
    /// Field name
    pub name: String,
    /// Declared type
    pub signature: TypeSignature,
    /// `static` modifier
    pub is_static: bool,
    /// `final` modifier
    pub is_final: bool,
}

impl FieldInfo {
    /// `Type.field` for display purposes
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.declaring_type_name, self.name)
    }
}

/// A method, as reported by method-entry events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    /// Dotted name of the declaring type
    pub declaring_type: String,
    /// Method name
    pub name: String,
}

/// Event requests the engine registers with the back-end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventRequest {
    /// Fire before the target writes the field
    FieldModification(FieldId),
    /// Fire before the target reads the field
    FieldAccess(FieldId),
    /// Fire after a type has been loaded and prepared
    ClassPrepare,
    /// Fire on entry to any method declared by the named type
    MethodEntry {
        /// Dotted name of the declaring type to match
        class_filter: String,
    },
}

/// Events delivered to the engine's listener
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    /// The target is about to overwrite a field
    FieldModification {
        /// Originating request
        request: RequestId,
        /// Thread performing the write
        thread: ThreadId,
        /// Receiver object, `None` for static fields
        object: Option<ObjectRef>,
        /// The written field
        field: FieldId,
        /// Value before the write
        current: Value,
        /// Value about to be stored
        to_be: Value,
        /// Whether the write happens inside the declaring type's static initializer
        in_static_initializer: bool,
    },
    /// The target is about to read a field
    FieldAccess {
        /// Originating request
        request: RequestId,
        /// Thread performing the read
        thread: ThreadId,
        /// Receiver object, `None` for static fields
        object: Option<ObjectRef>,
        /// The read field
        field: FieldId,
    },
    /// A type has been loaded
    ClassPrepare {
        /// Originating request
        request: RequestId,
        /// Thread that triggered loading
        thread: ThreadId,
        /// The new type
        ty: TypeInfo,
    },
    /// The target entered a method
    MethodEntry {
        /// Originating request
        request: RequestId,
        /// Calling thread
        thread: ThreadId,
        /// The entered method
        method: MethodInfo,
        /// `this`, `None` for static methods
        receiver: Option<ObjectRef>,
        /// Argument values, in declaration order
        arguments: Vec<Value>,
    },
}

/// Receives debugger events on the back-end's dispatch thread
pub trait EventListener: Send + Sync {
    /// Handle one event. The target is suspended until this returns.
    fn on_event(&self, event: &DebugEvent);
}

/// Mirror of the debugged VM
pub trait Debuggee: Send + Sync {
    /// All currently loaded reference types
    fn loaded_types(&self) -> VmResult<Vec<TypeInfo>>;

    /// Fields declared directly by `ty` (not inherited ones)
    fn declared_fields(&self, ty: TypeId) -> VmResult<Vec<FieldInfo>>;

    /// Number of live instances whose exact runtime type is each of `types`
    fn instance_counts(&self, types: &[TypeId]) -> VmResult<Vec<u64>>;

    /// Id of the most recently allocated object. Every object allocated later has a larger id.
    fn allocation_watermark(&self) -> VmResult<ObjectId>;

    /// Read a field; `object` is `None` for static fields
    fn get_field(&self, object: Option<ObjectId>, field: FieldId) -> VmResult<Value>;

    /// Write a field; `object` is `None` for static fields
    fn set_field(&self, object: Option<ObjectId>, field: FieldId, value: Value) -> VmResult<()>;

    /// Read a local variable of the thread's current frame
    fn get_local(&self, thread: ThreadId, name: &str) -> VmResult<Value>;

    /// Write a local variable of the thread's current frame
    fn set_local(&self, thread: ThreadId, name: &str, value: Value) -> VmResult<()>;

    /// All elements of an array
    fn array_values(&self, array: ObjectId) -> VmResult<Vec<Value>>;

    /// Overwrite all elements of an existing array in place. `values` must match its length.
    fn set_array_values(&self, array: ObjectId, values: &[Value]) -> VmResult<()>;

    /// Overwrite one element of an existing array
    fn set_array_value(&self, array: ObjectId, index: usize, value: Value) -> VmResult<()>;

    /// Prevent the object from being collected
    fn disable_collection(&self, object: ObjectId) -> VmResult<()>;

    /// Allow the object to be collected again
    fn enable_collection(&self, object: ObjectId) -> VmResult<()>;

    /// Resolve a reflective field mirror object to the field it denotes
    fn reflected_field(&self, field_object: ObjectId) -> VmResult<FieldInfo>;

    /// Read the primitive value wrapped by a boxed object
    fn unbox(&self, boxed: ObjectId) -> VmResult<Value>;

    /// Register an event request
    fn create_request(&self, request: EventRequest) -> VmResult<RequestId>;

    /// Remove event requests
    fn delete_requests(&self, requests: &[RequestId]) -> VmResult<()>;

    /// Install (or, with `None`, remove) the listener receiving all events
    fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) -> VmResult<()>;
}
