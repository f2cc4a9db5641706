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

//! An in-memory debuggee for tests.
//!
//! [`SimulatedVm`] implements [`Debuggee`] over a small heap of instances, arrays, boxed
//! primitives and reflective field mirrors. Debugger-side writes through the trait never fire
//! events, exactly like a real back-end. Code "running in the target" is simulated through a
//! [`Program`] handle, whose field reads and writes fire the registered watchpoints before
//! taking effect, and whose reflective calls fire method-entry events.
//!
//! Events are dispatched synchronously on the calling thread, with no heap lock held.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;
use sidetrack_common::types::{
    FieldId, ObjectId, ObjectRef, PrimitiveKind, RequestId, ThreadId, TypeId, TypeSignature, Value,
};

use crate::{
    config::DEFAULT_REFLECTION_TYPE, DebugEvent, Debuggee, EventListener, EventRequest, FieldInfo,
    MethodInfo, TypeInfo, VmError, VmResult,
};

/// Thread used for events not triggered through a [`Program`]
pub const MAIN_THREAD: ThreadId = ThreadId(1);

/// Declaration of a type to load into a [`SimulatedVm`]
#[derive(Debug, Clone)]
pub struct TypeSpec {
    name: String,
    is_abstract: bool,
    supertypes: Vec<TypeId>,
    fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    descriptor: String,
    is_static: bool,
    is_final: bool,
    initial: Option<Value>,
}

impl TypeSpec {
    /// A concrete class
    pub fn class(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_abstract: false, supertypes: Vec::new(), fields: Vec::new() }
    }

    /// An abstract class or interface
    pub fn abstract_class(name: impl Into<String>) -> Self {
        Self { is_abstract: true, ..Self::class(name) }
    }

    /// Add a direct supertype
    pub fn extends(mut self, supertype: TypeId) -> Self {
        self.supertypes.push(supertype);
        self
    }

    fn push(mut self, name: &str, descriptor: &str, is_static: bool, is_final: bool) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            is_final,
            initial: None,
        });
        self
    }

    /// Add an instance field
    pub fn field(self, name: &str, descriptor: &str) -> Self {
        self.push(name, descriptor, false, false)
    }

    /// Add a final instance field
    pub fn final_field(self, name: &str, descriptor: &str) -> Self {
        self.push(name, descriptor, false, true)
    }

    /// Add a static field with an initial value
    pub fn static_field(mut self, name: &str, descriptor: &str, initial: Value) -> Self {
        self = self.push(name, descriptor, true, false);
        if let Some(field) = self.fields.last_mut() {
            field.initial = Some(initial);
        }
        self
    }

    /// Add a final static field with an initial value
    pub fn static_final_field(mut self, name: &str, descriptor: &str, initial: Value) -> Self {
        self = self.push(name, descriptor, true, true);
        if let Some(field) = self.fields.last_mut() {
            field.initial = Some(initial);
        }
        self
    }
}

#[derive(Debug, Clone)]
enum HeapObject {
    Instance { ty: TypeId, fields: HashMap<FieldId, Value> },
    Array { component: TypeSignature, elements: Vec<Value> },
    Boxed(Value),
    FieldMirror(FieldId),
}

#[derive(Default)]
struct Heap {
    types: BTreeMap<TypeId, TypeInfo>,
    fields: BTreeMap<FieldId, FieldInfo>,
    objects: HashMap<ObjectId, HeapObject>,
    statics: HashMap<FieldId, Value>,
    locals: HashMap<(ThreadId, String), Value>,
    requests: BTreeMap<RequestId, EventRequest>,
    collection_disabled: HashMap<ObjectId, usize>,
    listener: Option<Arc<dyn EventListener>>,
    last_object: u64,
    last_type: u64,
    last_field: u64,
    last_request: u64,
}

fn zero_value(signature: &TypeSignature) -> Value {
    match signature.primitive() {
        Some(PrimitiveKind::Boolean) => Value::Boolean(false),
        Some(PrimitiveKind::Byte) => Value::Byte(0),
        Some(PrimitiveKind::Char) => Value::Char(0),
        Some(PrimitiveKind::Short) => Value::Short(0),
        Some(PrimitiveKind::Int) => Value::Int(0),
        Some(PrimitiveKind::Long) => Value::Long(0),
        Some(PrimitiveKind::Float) => Value::Float(0.0),
        Some(PrimitiveKind::Double) => Value::Double(0.0),
        None => Value::Null,
    }
}

fn parse_signature(descriptor: &str) -> VmResult<TypeSignature> {
    TypeSignature::parse(descriptor)
        .ok_or_else(|| VmError::Other(format!("invalid type descriptor `{descriptor}`")))
}

impl Heap {
    fn object(&self, id: ObjectId) -> VmResult<&HeapObject> {
        self.objects.get(&id).ok_or(VmError::ObjectCollected(id))
    }

    fn object_mut(&mut self, id: ObjectId) -> VmResult<&mut HeapObject> {
        self.objects.get_mut(&id).ok_or(VmError::ObjectCollected(id))
    }

    fn field(&self, id: FieldId) -> VmResult<&FieldInfo> {
        self.fields.get(&id).ok_or(VmError::UnknownField(id))
    }

    fn allocate(&mut self, object: HeapObject) -> ObjectId {
        self.last_object += 1;
        let id = ObjectId(self.last_object);
        self.objects.insert(id, object);
        id
    }

    /// Reference to `id` with the kind matching its heap representation
    fn reference(&self, id: ObjectId) -> VmResult<ObjectRef> {
        Ok(match self.object(id)? {
            HeapObject::Array { component, .. } => {
                ObjectRef::array(id, component.dimensions().saturating_add(1))
            }
            _ => ObjectRef::instance(id),
        })
    }

    /// Check that `value` may be stored in a location of type `signature`
    fn check_assignable(
        &self,
        target: impl fmt::Display,
        signature: &TypeSignature,
        value: Value,
    ) -> VmResult<()> {
        let ok = match (signature, value) {
            (TypeSignature::Primitive(kind), v) => v.primitive_kind() == Some(*kind),
            (_, Value::Null) => true,
            (TypeSignature::Array(_), Value::Object(obj)) => {
                obj.dimensions() == Some(signature.dimensions())
            }
            (TypeSignature::Reference(_), Value::Object(obj)) => self.objects.contains_key(&obj.id),
            _ => false,
        };
        if ok {
            return Ok(());
        }
        Err(VmError::TypeMismatch {
            target: target.to_string(),
            expected: signature.to_string(),
            value: value.to_string(),
        })
    }

    fn read_field(&self, object: Option<ObjectId>, field: FieldId) -> VmResult<Value> {
        let info = self.field(field)?;
        match object {
            None if info.is_static => {
                self.statics.get(&field).copied().ok_or(VmError::UnknownField(field))
            }
            Some(id) if !info.is_static => match self.object(id)? {
                HeapObject::Instance { fields, .. } => {
                    fields.get(&field).copied().ok_or(VmError::UnknownField(field))
                }
                _ => Err(VmError::UnknownField(field)),
            },
            _ => Err(VmError::UnknownField(field)),
        }
    }

    fn write_field(
        &mut self,
        object: Option<ObjectId>,
        field: FieldId,
        value: Value,
    ) -> VmResult<()> {
        let info = self.field(field)?;
        self.check_assignable(info.qualified_name(), &info.signature, value)?;
        let slot = match object {
            None if info.is_static => self.statics.get_mut(&field),
            Some(id) if !info.is_static => match self.object_mut(id)? {
                HeapObject::Instance { fields, .. } => fields.get_mut(&field),
                _ => None,
            },
            _ => None,
        };
        let slot = slot.ok_or(VmError::UnknownField(field))?;
        *slot = value;
        Ok(())
    }

    fn array(&self, id: ObjectId) -> VmResult<(&TypeSignature, &Vec<Value>)> {
        match self.object(id)? {
            HeapObject::Array { component, elements } => Ok((component, elements)),
            _ => Err(VmError::NotAnArray(id)),
        }
    }

    fn write_element(&mut self, id: ObjectId, index: usize, value: Value) -> VmResult<()> {
        let (component, elements) = self.array(id)?;
        if index >= elements.len() {
            return Err(VmError::IndexOutOfBounds { array: id, index, length: elements.len() });
        }
        self.check_assignable(format!("{id}[{index}]"), &component.clone(), value)?;
        if let HeapObject::Array { elements, .. } = self.object_mut(id)? {
            elements[index] = value;
        }
        Ok(())
    }

    fn matching_requests(&self, matches: impl Fn(&EventRequest) -> bool) -> Vec<RequestId> {
        self.requests.iter().filter(|(_, r)| matches(r)).map(|(id, _)| *id).collect()
    }

    /// Instance fields of `ty`, including inherited ones
    fn instance_fields(&self, ty: TypeId) -> Vec<&FieldInfo> {
        let mut pending = vec![ty];
        let mut seen = Vec::new();
        while let Some(current) = pending.pop() {
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(info) = self.types.get(&current) {
                pending.extend(info.supertypes.iter().copied());
            }
        }
        self.fields.values().filter(|f| !f.is_static && seen.contains(&f.declaring_type)).collect()
    }
}

/// A heap-backed [`Debuggee`]
#[derive(Default)]
pub struct SimulatedVm {
    heap: RwLock<Heap>,
}

impl fmt::Debug for SimulatedVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap.read();
        f.debug_struct("SimulatedVm")
            .field("types", &heap.types.len())
            .field("objects", &heap.objects.len())
            .field("requests", &heap.requests.len())
            .finish()
    }
}

impl SimulatedVm {
    /// An empty VM
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `event` for each request, with no lock held
    fn dispatch(&self, requests: Vec<RequestId>, event: impl Fn(RequestId) -> DebugEvent) {
        let listener = self.heap.read().listener.clone();
        let Some(listener) = listener else {
            return;
        };
        for request in requests {
            listener.on_event(&event(request));
        }
    }

    /// Load a type, firing class-prepare events. Static fields start at their declared initial
    /// value, or the zero value of their type.
    pub fn load_type(&self, spec: TypeSpec) -> VmResult<TypeId> {
        let (info, requests) = {
            let mut heap = self.heap.write();
            let signatures = spec
                .fields
                .iter()
                .map(|f| parse_signature(&f.descriptor))
                .collect::<VmResult<Vec<_>>>()?;
            for supertype in &spec.supertypes {
                if !heap.types.contains_key(supertype) {
                    return Err(VmError::UnknownType(*supertype));
                }
            }

            heap.last_type += 1;
            let id = TypeId(heap.last_type);
            let simple_name = spec.name.rsplit('.').next().unwrap_or(&spec.name).to_string();
            for (field, signature) in spec.fields.into_iter().zip(signatures) {
                heap.last_field += 1;
                let field_id = FieldId(heap.last_field);
                if field.is_static {
                    let initial = field.initial.unwrap_or_else(|| zero_value(&signature));
                    heap.statics.insert(field_id, initial);
                }
                heap.fields.insert(
                    field_id,
                    FieldInfo {
                        id: field_id,
                        declaring_type: id,
                        declaring_type_name: simple_name.clone(),
                        name: field.name,
                        signature,
                        is_static: field.is_static,
                        is_final: field.is_final,
                    },
                );
            }
            let info = TypeInfo {
                id,
                name: spec.name,
                is_abstract: spec.is_abstract,
                supertypes: spec.supertypes,
            };
            heap.types.insert(id, info.clone());
            (info, heap.matching_requests(|r| matches!(r, EventRequest::ClassPrepare)))
        };

        self.dispatch(requests, |request| DebugEvent::ClassPrepare {
            request,
            thread: MAIN_THREAD,
            ty: info.clone(),
        });
        Ok(info.id)
    }

    /// Id of the field `name` declared by `ty`
    pub fn field_id(&self, ty: TypeId, name: &str) -> VmResult<FieldId> {
        self.heap
            .read()
            .fields
            .values()
            .find(|f| f.declaring_type == ty && f.name == name)
            .map(|f| f.id)
            .ok_or_else(|| VmError::Other(format!("{ty} declares no field `{name}`")))
    }

    /// Allocate an instance of `ty` with all instance fields (own and inherited) zeroed
    pub fn new_instance(&self, ty: TypeId) -> VmResult<ObjectRef> {
        let mut heap = self.heap.write();
        match heap.types.get(&ty) {
            Some(info) if info.is_abstract => {
                return Err(VmError::Other(format!("cannot instantiate abstract {}", info.name)))
            }
            Some(_) => {}
            None => return Err(VmError::UnknownType(ty)),
        }
        let fields = heap
            .instance_fields(ty)
            .into_iter()
            .map(|f| (f.id, zero_value(&f.signature)))
            .collect();
        Ok(ObjectRef::instance(heap.allocate(HeapObject::Instance { ty, fields })))
    }

    /// Allocate an array with component type `component` (a descriptor) and the given elements
    pub fn new_array(&self, component: &str, elements: Vec<Value>) -> VmResult<ObjectRef> {
        let component = parse_signature(component)?;
        let mut heap = self.heap.write();
        for (index, value) in elements.iter().enumerate() {
            heap.check_assignable(format!("element {index}"), &component, *value)?;
        }
        let dimensions = component.dimensions().saturating_add(1);
        Ok(ObjectRef::array(heap.allocate(HeapObject::Array { component, elements }), dimensions))
    }

    /// Allocate an `int[]`
    pub fn new_int_array(&self, values: &[i32]) -> VmResult<ObjectRef> {
        self.new_array("I", values.iter().map(|v| Value::Int(*v)).collect())
    }

    /// Allocate a boxed primitive
    pub fn new_boxed(&self, value: Value) -> VmResult<ObjectRef> {
        if value.primitive_kind().is_none() {
            return Err(VmError::Other(format!("cannot box {value}")));
        }
        Ok(ObjectRef::instance(self.heap.write().allocate(HeapObject::Boxed(value))))
    }

    /// Allocate a reflective mirror of `field`
    pub fn reflect_field(&self, field: FieldId) -> VmResult<ObjectRef> {
        let mut heap = self.heap.write();
        heap.field(field)?;
        Ok(ObjectRef::instance(heap.allocate(HeapObject::FieldMirror(field))))
    }

    /// Declare (or overwrite) a local variable of `thread`'s current frame
    pub fn declare_local(&self, thread: ThreadId, name: &str, value: Value) {
        self.heap.write().locals.insert((thread, name.to_string()), value);
    }

    /// Garbage-collect `object`. Fails if its collection is disabled.
    pub fn collect(&self, object: ObjectId) -> VmResult<()> {
        let mut heap = self.heap.write();
        if heap.collection_disabled.contains_key(&object) {
            return Err(VmError::Other(format!("{object} is pinned")));
        }
        heap.objects.remove(&object).map(|_| ()).ok_or(VmError::ObjectCollected(object))
    }

    /// Whether collection of `object` is currently disabled
    pub fn collection_disabled(&self, object: ObjectId) -> bool {
        self.heap.read().collection_disabled.contains_key(&object)
    }

    /// Number of objects whose collection is disabled
    pub fn pinned_count(&self) -> usize {
        self.heap.read().collection_disabled.len()
    }

    /// Number of registered event requests
    pub fn request_count(&self) -> usize {
        self.heap.read().requests.len()
    }

    /// Registered event requests, in creation order
    pub fn requests(&self) -> Vec<EventRequest> {
        self.heap.read().requests.values().cloned().collect()
    }

    /// Whether an event listener is registered
    pub fn has_listener(&self) -> bool {
        self.heap.read().listener.is_some()
    }

    /// Handle for running code in the target on `thread`
    pub fn program(&self, thread: ThreadId) -> Program<'_> {
        Program { vm: self, thread }
    }
}

impl Debuggee for SimulatedVm {
    fn loaded_types(&self) -> VmResult<Vec<TypeInfo>> {
        Ok(self.heap.read().types.values().cloned().collect())
    }

    fn declared_fields(&self, ty: TypeId) -> VmResult<Vec<FieldInfo>> {
        let heap = self.heap.read();
        if !heap.types.contains_key(&ty) {
            return Err(VmError::UnknownType(ty));
        }
        Ok(heap.fields.values().filter(|f| f.declaring_type == ty).cloned().collect())
    }

    fn instance_counts(&self, types: &[TypeId]) -> VmResult<Vec<u64>> {
        let heap = self.heap.read();
        let mut counts: HashMap<TypeId, u64> = HashMap::new();
        for object in heap.objects.values() {
            if let HeapObject::Instance { ty, .. } = object {
                *counts.entry(*ty).or_default() += 1;
            }
        }
        Ok(types.iter().map(|ty| counts.get(ty).copied().unwrap_or(0)).collect())
    }

    fn allocation_watermark(&self) -> VmResult<ObjectId> {
        Ok(ObjectId(self.heap.read().last_object))
    }

    fn get_field(&self, object: Option<ObjectId>, field: FieldId) -> VmResult<Value> {
        self.heap.read().read_field(object, field)
    }

    fn set_field(&self, object: Option<ObjectId>, field: FieldId, value: Value) -> VmResult<()> {
        self.heap.write().write_field(object, field, value)
    }

    fn get_local(&self, thread: ThreadId, name: &str) -> VmResult<Value> {
        self.heap
            .read()
            .locals
            .get(&(thread, name.to_string()))
            .copied()
            .ok_or_else(|| VmError::UnknownVariable { name: name.to_string(), thread })
    }

    fn set_local(&self, thread: ThreadId, name: &str, value: Value) -> VmResult<()> {
        let mut heap = self.heap.write();
        let slot = heap
            .locals
            .get_mut(&(thread, name.to_string()))
            .ok_or_else(|| VmError::UnknownVariable { name: name.to_string(), thread })?;
        *slot = value;
        Ok(())
    }

    fn array_values(&self, array: ObjectId) -> VmResult<Vec<Value>> {
        Ok(self.heap.read().array(array)?.1.clone())
    }

    fn set_array_values(&self, array: ObjectId, values: &[Value]) -> VmResult<()> {
        let mut heap = self.heap.write();
        let length = heap.array(array)?.1.len();
        if values.len() != length {
            return Err(VmError::LengthMismatch { array, given: values.len(), length });
        }
        values.iter().enumerate().try_for_each(|(i, v)| heap.write_element(array, i, *v))
    }

    fn set_array_value(&self, array: ObjectId, index: usize, value: Value) -> VmResult<()> {
        self.heap.write().write_element(array, index, value)
    }

    fn disable_collection(&self, object: ObjectId) -> VmResult<()> {
        let mut heap = self.heap.write();
        heap.object(object)?;
        *heap.collection_disabled.entry(object).or_default() += 1;
        Ok(())
    }

    fn enable_collection(&self, object: ObjectId) -> VmResult<()> {
        let mut heap = self.heap.write();
        let count = heap
            .collection_disabled
            .get_mut(&object)
            .ok_or_else(|| VmError::Other(format!("collection of {object} is not disabled")))?;
        *count -= 1;
        if *count == 0 {
            heap.collection_disabled.remove(&object);
        }
        Ok(())
    }

    fn reflected_field(&self, field_object: ObjectId) -> VmResult<FieldInfo> {
        let heap = self.heap.read();
        match heap.object(field_object)? {
            HeapObject::FieldMirror(field) => heap.field(*field).cloned(),
            _ => Err(VmError::Other(format!("{field_object} is not a field mirror"))),
        }
    }

    fn unbox(&self, boxed: ObjectId) -> VmResult<Value> {
        match self.heap.read().object(boxed)? {
            HeapObject::Boxed(value) => Ok(*value),
            _ => Err(VmError::TypeMismatch {
                target: "unboxing".to_string(),
                expected: "boxed primitive".to_string(),
                value: boxed.to_string(),
            }),
        }
    }

    fn create_request(&self, request: EventRequest) -> VmResult<RequestId> {
        let mut heap = self.heap.write();
        match &request {
            EventRequest::FieldModification(field) | EventRequest::FieldAccess(field) => {
                heap.field(*field)?;
            }
            EventRequest::ClassPrepare | EventRequest::MethodEntry { .. } => {}
        }
        heap.last_request += 1;
        let id = RequestId(heap.last_request);
        heap.requests.insert(id, request);
        Ok(id)
    }

    fn delete_requests(&self, requests: &[RequestId]) -> VmResult<()> {
        let mut heap = self.heap.write();
        if let Some(missing) = requests.iter().find(|id| !heap.requests.contains_key(id)) {
            return Err(VmError::UnknownRequest(*missing));
        }
        for id in requests {
            heap.requests.remove(id);
        }
        Ok(())
    }

    fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) -> VmResult<()> {
        self.heap.write().listener = listener;
        Ok(())
    }
}

/// Code running in the target on one thread.
///
/// Field accesses fire watchpoints first, then take effect. Array element accesses fire nothing.
#[derive(Debug, Clone, Copy)]
pub struct Program<'a> {
    vm: &'a SimulatedVm,
    thread: ThreadId,
}

impl Program<'_> {
    fn read(&self, object: Option<ObjectId>, field: FieldId) -> VmResult<Value> {
        let (receiver, requests) = {
            let heap = self.vm.heap.read();
            heap.read_field(object, field)?;
            let receiver = object.map(|id| heap.reference(id)).transpose()?;
            let requests =
                heap.matching_requests(|r| *r == EventRequest::FieldAccess(field));
            (receiver, requests)
        };
        self.vm.dispatch(requests, |request| DebugEvent::FieldAccess {
            request,
            thread: self.thread,
            object: receiver,
            field,
        });
        self.vm.heap.read().read_field(object, field)
    }

    fn write(
        &self,
        object: Option<ObjectId>,
        field: FieldId,
        value: Value,
        in_static_initializer: bool,
    ) -> VmResult<()> {
        let (receiver, current, requests) = {
            let heap = self.vm.heap.read();
            let current = heap.read_field(object, field)?;
            let info = heap.field(field)?;
            heap.check_assignable(info.qualified_name(), &info.signature, value)?;
            let receiver = object.map(|id| heap.reference(id)).transpose()?;
            let requests =
                heap.matching_requests(|r| *r == EventRequest::FieldModification(field));
            (receiver, current, requests)
        };
        self.vm.dispatch(requests, |request| DebugEvent::FieldModification {
            request,
            thread: self.thread,
            object: receiver,
            field,
            current,
            to_be: value,
            in_static_initializer,
        });
        self.vm.heap.write().write_field(object, field, value)
    }

    /// `object.field`
    pub fn get_field(&self, object: ObjectRef, field: FieldId) -> VmResult<Value> {
        self.read(Some(object.id), field)
    }

    /// `object.field = value`
    pub fn put_field(&self, object: ObjectRef, field: FieldId, value: Value) -> VmResult<()> {
        self.write(Some(object.id), field, value, false)
    }

    /// `Type.field`
    pub fn get_static(&self, field: FieldId) -> VmResult<Value> {
        self.read(None, field)
    }

    /// `Type.field = value`
    pub fn put_static(&self, field: FieldId, value: Value) -> VmResult<()> {
        self.write(None, field, value, false)
    }

    /// `Type.field = value`, executed by the declaring type's static initializer
    pub fn put_static_in_initializer(&self, field: FieldId, value: Value) -> VmResult<()> {
        self.write(None, field, value, true)
    }

    /// `array[index]`
    pub fn array_load(&self, array: ObjectRef, index: usize) -> VmResult<Value> {
        let heap = self.vm.heap.read();
        let (_, elements) = heap.array(array.id)?;
        elements.get(index).copied().ok_or(VmError::IndexOutOfBounds {
            array: array.id,
            index,
            length: elements.len(),
        })
    }

    /// `array[index] = value`
    pub fn array_store(&self, array: ObjectRef, index: usize, value: Value) -> VmResult<()> {
        self.vm.heap.write().write_element(array.id, index, value)
    }

    /// A local variable of this thread
    pub fn local(&self, name: &str) -> VmResult<Value> {
        self.vm.get_local(self.thread, name)
    }

    /// Assign a local variable of this thread
    pub fn set_local(&self, name: &str, value: Value) -> VmResult<()> {
        self.vm.set_local(self.thread, name, value)
    }

    fn enter_reflective(&self, method: &str, mirror: ObjectRef, arguments: Vec<Value>) {
        let requests = self.vm.heap.read().matching_requests(|r| {
            matches!(r, EventRequest::MethodEntry { class_filter }
                if class_filter == DEFAULT_REFLECTION_TYPE)
        });
        let method = MethodInfo {
            declaring_type: DEFAULT_REFLECTION_TYPE.to_string(),
            name: method.to_string(),
        };
        self.vm.dispatch(requests, |request| DebugEvent::MethodEntry {
            request,
            thread: self.thread,
            method: method.clone(),
            receiver: Some(mirror),
            arguments: arguments.clone(),
        });
    }

    /// `mirror.<method>(target, value)` for a member of the reflective setter family (`set`,
    /// `setInt`, ...). `target` is ignored for static fields.
    pub fn reflective_set(
        &self,
        method: &str,
        mirror: ObjectRef,
        target: Value,
        value: Value,
    ) -> VmResult<()> {
        self.enter_reflective(method, mirror, vec![target, value]);

        let field = self.vm.reflected_field(mirror.id)?;
        let object = if field.is_static {
            None
        } else {
            Some(target.object_id().ok_or_else(|| VmError::Other("null target".to_string()))?)
        };
        let value = match (field.signature.primitive(), method, value) {
            (Some(_), "set", Value::Object(boxed)) => self.vm.unbox(boxed.id)?,
            _ => value,
        };
        let value = match field.signature.primitive() {
            Some(kind) => value.widen_to(kind).ok_or_else(|| VmError::TypeMismatch {
                target: field.qualified_name(),
                expected: field.signature.to_string(),
                value: value.to_string(),
            })?,
            None => value,
        };
        self.vm.heap.write().write_field(object, field.id, value)
    }

    /// `mirror.get(target)`
    pub fn reflective_get(&self, mirror: ObjectRef, target: Value) -> VmResult<Value> {
        self.enter_reflective("get", mirror, vec![target]);

        let field = self.vm.reflected_field(mirror.id)?;
        let object = if field.is_static { None } else { target.object_id() };
        self.vm.get_field(object, field.id)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use sidetrack_common::logging::ensure_test_logging;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<DebugEvent>>);

    impl EventListener for Collect {
        fn on_event(&self, event: &DebugEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn test_debugger_writes_fire_no_events() {
        ensure_test_logging(None);

        let vm = SimulatedVm::new();
        let ty = vm
            .load_type(TypeSpec::class("a.Counter").static_field("count", "I", 0.into()))
            .unwrap();
        let count = vm.field_id(ty, "count").unwrap();
        let events = Arc::new(Collect::default());
        vm.set_event_listener(Some(events.clone())).unwrap();
        vm.create_request(EventRequest::FieldModification(count)).unwrap();

        vm.set_field(None, count, Value::Int(5)).unwrap();
        assert!(events.0.lock().is_empty());

        vm.program(MAIN_THREAD).put_static(count, Value::Int(6)).unwrap();
        let events = events.0.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DebugEvent::FieldModification { current: Value::Int(5), to_be: Value::Int(6), .. }
        ));
        assert_eq!(vm.get_field(None, count).unwrap(), Value::Int(6));
    }

    #[test]
    fn test_type_checked_writes() {
        ensure_test_logging(None);

        let vm = SimulatedVm::new();
        let ty = vm.load_type(TypeSpec::class("a.Holder").field("values", "[I")).unwrap();
        let values = vm.field_id(ty, "values").unwrap();
        let holder = vm.new_instance(ty).unwrap();

        let err = vm.set_field(Some(holder.id), values, Value::Int(1)).unwrap_err();
        assert!(matches!(err, VmError::TypeMismatch { .. }));

        let array = vm.new_int_array(&[1, 2]).unwrap();
        vm.set_field(Some(holder.id), values, Value::Object(array)).unwrap();
        let err = vm.set_array_values(array.id, &[Value::Int(1)]).unwrap_err();
        assert_eq!(err, VmError::LengthMismatch { array: array.id, given: 1, length: 2 });
    }

    #[test]
    fn test_pinned_objects_survive_collection() {
        ensure_test_logging(None);

        let vm = SimulatedVm::new();
        let array = vm.new_int_array(&[1]).unwrap();
        vm.disable_collection(array.id).unwrap();
        assert!(vm.collect(array.id).is_err());
        vm.enable_collection(array.id).unwrap();
        vm.collect(array.id).unwrap();
        assert_eq!(vm.array_values(array.id).unwrap_err(), VmError::ObjectCollected(array.id));
    }

    #[test]
    fn test_instances_inherit_fields() {
        ensure_test_logging(None);

        let vm = SimulatedVm::new();
        let base = vm.load_type(TypeSpec::abstract_class("a.Base").field("x", "I")).unwrap();
        let derived = vm.load_type(TypeSpec::class("a.Derived").extends(base)).unwrap();
        let x = vm.field_id(base, "x").unwrap();

        assert!(vm.new_instance(base).is_err());
        let obj = vm.new_instance(derived).unwrap();
        assert_eq!(vm.get_field(Some(obj.id), x).unwrap(), Value::Int(0));
        assert_eq!(vm.instance_counts(&[base, derived]).unwrap(), vec![0, 1]);
    }
}
