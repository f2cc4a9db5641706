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

//! End-to-end tests of the capture engine against the simulated debuggee
//!
//! Every test evaluates candidates through the engine and checks both the reported effects and
//! that the debuggee is left exactly as it was.

use std::sync::Arc;

use sidetrack_common::types::{FieldId, ObjectRef, Value};
use sidetrack_engine::{
    sim::TypeSpec, CaptureConfig, CaptureEngine, CaptureError, Debuggee, Effect, EffectSet,
    EngineState, EvaluationError, EventRequest, FieldInfo, Location, Snapshot, StackFrame,
};
use sidetrack_integration_tests::test_utils::{
    frame, init, ints, logging::with_error_capture, Fixture, EVAL_THREAD,
};
use tracing::info;

type Eval<'a> = Box<dyn Fn(&str, &StackFrame) -> Result<Value, EvaluationError> + 'a>;

fn int(value: Value) -> i32 {
    match value {
        Value::Int(v) => v,
        other => panic!("expected int, got {other}"),
    }
}

fn array(value: Value) -> ObjectRef {
    value.as_array().unwrap_or_else(|| panic!("expected array, got {value}"))
}

/// `Counter.count = Counter.count + 1; Counter.count`
fn increment_counter(fx: &Fixture) -> Eval<'_> {
    Box::new(move |_, frame| {
        let program = fx.vm.program(frame.thread);
        let current = int(program.get_static(fx.count)?);
        program.put_static(fx.count, Value::Int(current + 1))?;
        Ok(program.get_static(fx.count)?)
    })
}

#[test]
fn test_counter_increment_is_captured_and_undone() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let counter = increment_counter(&fx);
    let outcome =
        engine.evaluate_captured(&counter, "count = count + 1", &frame(), &[]).unwrap();

    assert_eq!(outcome.result, Ok(Value::Int(1)));
    assert_eq!(fx.counter(), Value::Int(0));
    assert_eq!(outcome.effects.len(), 1);

    let effect = &outcome.effects[0];
    assert!(matches!(effect.location(), Location::StaticField { field } if field.id == fx.count));
    assert_eq!(effect.before(), &Snapshot::Scalar(Value::Int(0)));
    assert_eq!(effect.after(), &Snapshot::Scalar(Value::Int(1)));
    assert_eq!(effect.to_string(), "static Counter.count: 0 -> 1");
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn test_argument_array_increment_is_captured_in_place() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    // a[0]++ where `a` is passed straight to the evaluated call
    let a = fx.values_array;
    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let v = int(program.array_load(a, 0)?);
        program.array_store(a, 0, Value::Int(v + 1))?;
        Ok(Value::Int(v))
    });
    let outcome =
        engine.evaluate_captured(&candidate, "a[0]++", &frame(), &[Value::Object(a)]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    let effect = &outcome.effects[0];
    assert_eq!(effect.location(), &Location::WholeArray { array: a });
    assert_eq!(effect.before(), &Snapshot::SimpleArray { array: a, elements: ints(&[10]) });
    assert_eq!(effect.after(), &Snapshot::SimpleArray { array: a, elements: ints(&[11]) });
    assert!(effect.is_content_change());

    // Same identity, original contents, visible through every alias
    assert_eq!(fx.elements(a), ints(&[10]));
    assert_eq!(fx.vm.get_local(EVAL_THREAD, "a").unwrap(), Value::Object(a));
    assert_eq!(fx.holder_field(fx.values), Value::Object(a));
}

#[test]
fn test_array_fetched_from_field_is_baselined() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let values = array(program.get_field(fx.holder, fx.values)?);
        program.array_store(values, 0, Value::Int(11))?;
        Ok(Value::Null)
    });
    let outcome =
        engine.evaluate_captured(&candidate, "holder.values[0]++", &frame(), &[]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    let effect = &outcome.effects[0];
    assert!(matches!(effect.location(), Location::InstanceField { object, field }
        if object.id == fx.holder.id && field.id == fx.values));
    assert_eq!(effect.before().to_string(), "[10]");
    assert_eq!(effect.after().to_string(), "[11]");
    assert_eq!(fx.elements(fx.values_array), ints(&[10]));
    assert_eq!(engine.session_stats().array_reads, 1);
}

#[test]
fn test_undo_restores_every_location() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let locations = [
        Location::StaticField { field: field_info(&fx, fx.count) },
        Location::InstanceField { object: fx.holder, field: field_info(&fx, fx.values) },
        Location::InstanceField { object: fx.holder, field: field_info(&fx, fx.matrix) },
        Location::InstanceField { object: fx.holder, field: field_info(&fx, fx.any) },
        Location::InstanceField { object: fx.holder, field: field_info(&fx, fx.total) },
        Location::WholeArray { array: fx.fixed_array },
    ];
    let before: Vec<Snapshot> =
        locations.iter().map(|l| l.snapshot(&*fx.vm).unwrap()).collect();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        program.put_static(fx.count, Value::Int(42))?;
        program.put_field(fx.holder, fx.total, Value::Int(-1))?;
        let fresh = fx.vm.new_int_array(&[1, 2, 3])?;
        program.put_field(fx.holder, fx.any, Value::Object(fresh))?;
        let matrix = array(program.get_field(fx.holder, fx.matrix)?);
        let row = array(program.array_load(matrix, 1)?);
        program.array_store(row, 0, Value::Int(30))?;
        program.array_store(matrix, 0, Value::Null)?;
        let fixed = array(program.get_field(fx.holder, fx.fixed)?);
        program.array_store(fixed, 1, Value::Int(0))?;
        program.put_field(fx.holder, fx.values, Value::Null)?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "mess()", &frame(), &[]).unwrap();
    assert_eq!(outcome.effects.len(), 6);

    let after: Vec<Snapshot> =
        locations.iter().map(|l| l.snapshot(&*fx.vm).unwrap()).collect();
    assert_eq!(before, after);
    assert_eq!(fx.holder_field(fx.matrix), Value::Object(fx.matrix_array));
    assert_eq!(
        fx.elements(fx.matrix_array),
        vec![Value::Object(fx.rows[0]), Value::Object(fx.rows[1])]
    );
    assert_eq!(fx.elements(fx.rows[1]), ints(&[3]));
}

fn field_info(fx: &Fixture, id: FieldId) -> Arc<FieldInfo> {
    let info = fx
        .vm
        .loaded_types()
        .unwrap()
        .into_iter()
        .flat_map(|t| fx.vm.declared_fields(t.id).unwrap())
        .find(|f| f.id == id)
        .unwrap();
    Arc::new(info)
}

#[test]
fn test_round_trips_produce_no_effects() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        program.put_static(fx.count, Value::Int(5))?;
        program.put_static(fx.count, Value::Int(0))?;
        program.put_field(fx.holder, fx.total, Value::Int(0))?;
        let values = array(program.get_field(fx.holder, fx.values)?);
        program.array_store(values, 0, Value::Int(99))?;
        program.array_store(values, 0, Value::Int(10))?;
        Ok(Value::Boolean(true))
    });
    let outcome = engine.evaluate_captured(&candidate, "noop()", &frame(), &[]).unwrap();

    assert!(outcome.is_success());
    assert!(!outcome.has_side_effects());
    let stats = engine.session_stats();
    assert_eq!(stats.round_trips, 1);
    assert_eq!(stats.field_writes, 2);
}

#[test]
fn test_rebound_array_field_is_restored_to_original_array() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    // Mutate the old array through the field, then replace it with a new array
    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let old = array(program.get_field(fx.holder, fx.values)?);
        program.array_store(old, 0, Value::Int(99))?;
        let fresh = fx.vm.new_int_array(&[5])?;
        program.put_field(fx.holder, fx.values, Value::Object(fresh))?;
        Ok(Value::Object(fresh))
    });
    let outcome = engine.evaluate_captured(&candidate, "rebind()", &frame(), &[]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    let effect = &outcome.effects[0];
    assert_eq!(
        effect.before(),
        &Snapshot::SimpleArray { array: fx.values_array, elements: ints(&[10]) }
    );
    assert_eq!(effect.after().to_string(), "[5]");
    assert!(!effect.is_content_change());

    assert_eq!(fx.holder_field(fx.values), Value::Object(fx.values_array));
    assert_eq!(fx.elements(fx.values_array), ints(&[10]));
    assert_eq!(fx.vm.get_local(EVAL_THREAD, "a").unwrap(), Value::Object(fx.values_array));
}

#[test]
fn test_alias_mutation_after_field_round_trip_is_undone() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    // t = holder.values; holder.values = new int[]{5}; holder.values = t; t[0] = 99
    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let t = program.get_field(fx.holder, fx.values)?;
        let fresh = fx.vm.new_int_array(&[5])?;
        program.put_field(fx.holder, fx.values, Value::Object(fresh))?;
        program.put_field(fx.holder, fx.values, t)?;
        program.array_store(array(t), 0, Value::Int(99))?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "swap()", &frame(), &[]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    let effect = &outcome.effects[0];
    assert!(effect.is_content_change());
    assert_eq!(effect.before().to_string(), "[10]");
    assert_eq!(effect.after().to_string(), "[99]");
    assert_eq!(engine.session_stats().round_trips, 1);

    assert_eq!(fx.holder_field(fx.values), Value::Object(fx.values_array));
    assert_eq!(fx.elements(fx.values_array), ints(&[10]));
}

#[test]
fn test_rebinding_to_equal_copy_restores_identity() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let values = array(program.get_field(fx.holder, fx.values)?);
        let copy = fx.vm.new_int_array(&[int(program.array_load(values, 0)?)])?;
        program.put_field(fx.holder, fx.values, Value::Object(copy))?;
        Ok(Value::Object(copy))
    });
    let outcome = engine.evaluate_captured(&candidate, "values.clone()", &frame(), &[]).unwrap();

    // Equal contents: nothing to report, but the field must share the original array again
    assert!(!outcome.has_side_effects());
    assert_ne!(outcome.result, Ok(Value::Object(fx.values_array)));
    assert_eq!(fx.holder_field(fx.values), Value::Object(fx.values_array));
    assert_eq!(fx.vm.get_local(EVAL_THREAD, "a").unwrap(), fx.holder_field(fx.values));
    assert_eq!(fx.elements(fx.values_array), ints(&[10]));
}

#[test]
fn test_argument_alias_restored_through_field() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let a = fx.values_array;
    let candidate: Eval<'_> = Box::new(|_, frame| {
        fx.vm.program(frame.thread).array_store(a, 0, Value::Int(-3))?;
        Ok(Value::Null)
    });
    let outcome =
        engine.evaluate_captured(&candidate, "clear(a)", &frame(), &[Value::Object(a)]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    let values = array(fx.holder_field(fx.values));
    assert_eq!(values.id, a.id);
    assert_eq!(fx.elements(values), ints(&[10]));
}

#[test]
fn test_reflective_writes_match_direct_writes() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();
    let total_mirror = fx.vm.reflect_field(fx.total).unwrap();
    let count_mirror = fx.vm.reflect_field(fx.count).unwrap();
    let target = Value::Object(fx.holder);

    let direct: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        program.put_field(fx.holder, fx.total, Value::Int(7))?;
        program.put_static(fx.count, Value::Int(3))?;
        Ok(Value::Null)
    });
    let typed: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        program.reflective_set("setInt", total_mirror, target, Value::Int(7))?;
        program.reflective_set("setByte", count_mirror, Value::Null, Value::Byte(3))?;
        Ok(Value::Null)
    });
    let boxed: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let seven = fx.vm.new_boxed(Value::Int(7))?;
        let three = fx.vm.new_boxed(Value::Short(3))?;
        program.reflective_set("set", total_mirror, target, Value::Object(seven))?;
        program.reflective_set("set", count_mirror, Value::Null, Value::Object(three))?;
        Ok(Value::Null)
    });

    let expected = engine.evaluate_captured(&direct, "direct", &frame(), &[]).unwrap().effects;
    assert_eq!(expected.len(), 2);
    for candidate in [&typed, &boxed] {
        let outcome = engine.evaluate_captured(candidate, "reflective", &frame(), &[]).unwrap();
        assert_eq!(outcome.effects, expected);
        assert_eq!(engine.session_stats().reflective_calls, 2);
    }
    assert_eq!(fx.holder_field(fx.total), Value::Int(0));
    assert_eq!(fx.counter(), Value::Int(0));
}

#[test]
fn test_reflective_read_baselines_array() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();
    let fixed_mirror = fx.vm.reflect_field(fx.fixed).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let fixed = array(program.reflective_get(fixed_mirror, Value::Object(fx.holder))?);
        program.array_store(fixed, 0, Value::Int(1))?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "reflect", &frame(), &[]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    assert_eq!(outcome.effects[0].after().to_string(), "[1, 7]");
    assert_eq!(fx.elements(fx.fixed_array), ints(&[7, 7]));
}

#[test]
fn test_reflective_final_field_write_is_undone() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();
    let fixed_mirror = fx.vm.reflect_field(fx.fixed).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        fx.vm.program(frame.thread).reflective_set(
            "set",
            fixed_mirror,
            Value::Object(fx.holder),
            Value::Null,
        )?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "fixed = null", &frame(), &[]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    assert_eq!(fx.holder_field(fx.fixed), Value::Object(fx.fixed_array));
}

#[test]
fn test_new_objects_are_exempt() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let fresh = fx.vm.new_instance(fx.holder_type)?;
        let array = fx.vm.new_int_array(&[0, 0])?;
        program.put_field(fresh, fx.values, Value::Object(array))?;
        program.put_field(fresh, fx.total, Value::Int(9))?;
        let read = program.get_field(fresh, fx.values)?;
        program.array_store(self::array(read), 1, Value::Int(4))?;
        Ok(Value::Object(fresh))
    });
    let outcome = engine.evaluate_captured(&candidate, "new Holder()", &frame(), &[]).unwrap();

    assert!(outcome.effects.is_empty());
    assert_eq!(engine.session_stats().skipped_new_objects, 2);
}

#[test]
fn test_pins_are_balanced() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let values = array(program.get_field(fx.holder, fx.values)?);
        program.array_store(values, 0, Value::Int(1))?;
        program.put_field(fx.holder, fx.any, Value::Object(fx.fixed_array))?;
        Ok(Value::Null)
    });

    let kept = engine.evaluate_captured(&candidate, "c", &frame(), &[]).unwrap().effects;
    assert_eq!(kept.len(), 2);
    assert!(fx.vm.collection_disabled(fx.values_array.id));
    assert!(fx.vm.collection_disabled(fx.fixed_array.id));
    assert!(fx.vm.collection_disabled(fx.holder.id));

    // Sessions whose effect sets are dropped leave nothing pinned behind
    for _ in 0..3 {
        drop(engine.evaluate_captured(&candidate, "c", &frame(), &[]).unwrap());
    }
    drop(kept);
    assert_eq!(engine.pin_table().pinned_objects(), 0);
    assert_eq!(fx.vm.pinned_count(), 0);

    // stop() releases pins still owned by live effect sets
    let kept = engine.evaluate_captured(&candidate, "c", &frame(), &[]).unwrap().effects;
    assert!(fx.vm.pinned_count() > 0);
    engine.stop().unwrap();
    assert_eq!(fx.vm.pinned_count(), 0);
    drop(kept);
    assert_eq!(fx.vm.pinned_count(), 0);
    assert_eq!(fx.vm.request_count(), 0);
    assert!(!fx.vm.has_listener());
}

#[test]
fn test_redo_then_close_reverts_to_pre_redo_state() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        let current = int(program.get_static(fx.count)?);
        program.put_static(fx.count, Value::Int(current + 1))?;
        let values = array(program.get_field(fx.holder, fx.values)?);
        let v = int(program.array_load(values, 0)?);
        program.array_store(values, 0, Value::Int(v + 1))?;
        Ok(Value::Null)
    });
    let first = engine.evaluate_captured(&candidate, "step", &frame(), &[]).unwrap().effects;
    assert_eq!(first.len(), 2);

    engine.start_capture().unwrap();
    engine.redo_and_record_effects(&first).unwrap();
    assert_eq!(fx.counter(), Value::Int(1));
    assert_eq!(fx.elements(fx.values_array), ints(&[11]));

    // Peeking shows the redone state without reverting it
    let peek = engine.get_side_effects().unwrap();
    assert_eq!(peek, first);
    assert_eq!(fx.counter(), Value::Int(1));

    candidate("step", &frame()).unwrap();
    assert_eq!(fx.counter(), Value::Int(2));
    let second = engine.stop_capture().unwrap();

    assert_eq!(fx.counter(), Value::Int(0));
    assert_eq!(fx.elements(fx.values_array), ints(&[10]));
    let count_effect = second
        .iter()
        .find(|e| matches!(e.location(), Location::StaticField { .. }))
        .unwrap();
    assert_eq!(count_effect.before(), &Snapshot::Scalar(Value::Int(0)));
    assert_eq!(count_effect.after(), &Snapshot::Scalar(Value::Int(2)));
    let array_effect = second.iter().find(|e| e.after().is_array()).unwrap();
    assert_eq!(array_effect.after().to_string(), "[12]");
}

#[test]
fn test_static_initializer_writes_are_ignored() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        fx.vm.program(frame.thread).put_static_in_initializer(fx.count, Value::Int(8))?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "<clinit>", &frame(), &[]).unwrap();

    assert!(outcome.effects.is_empty());
    assert_eq!(engine.session_stats().skipped_static_init, 1);
    assert_eq!(fx.counter(), Value::Int(8));
}

#[test]
fn test_late_loaded_type_statics_are_watched() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();
    let before = engine.instrumentation_summary().unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        let late = fx.vm.load_type(
            TypeSpec::class("demo.Late").static_field("flag", "Z", Value::Boolean(false)),
        )?;
        let flag = fx.vm.field_id(late, "flag")?;
        fx.vm.program(frame.thread).put_static(flag, Value::Boolean(true))?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "Late.flag = true", &frame(), &[]).unwrap();

    assert_eq!(outcome.effects.len(), 1);
    assert_eq!(outcome.effects[0].to_string(), "static Late.flag: false -> true");
    let after = engine.instrumentation_summary().unwrap();
    assert_eq!(after.late_types, before.late_types + 1);
    assert_eq!(after.modification_watches, before.modification_watches + 1);
}

#[test]
fn test_disabled_engine_is_inert() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default().with_enabled(false)).unwrap();
    assert_eq!(engine.state(), EngineState::Disabled);
    assert!(!engine.is_enabled());
    assert_eq!(fx.vm.request_count(), 0);

    let outcome =
        engine.evaluate_captured(&increment_counter(&fx), "count++", &frame(), &[]).unwrap();
    assert!(outcome.effects.is_empty());
    // Nothing is reverted either
    assert_eq!(fx.counter(), Value::Int(1));
    assert!(engine.get_side_effects().unwrap().is_empty());

    engine.enable(true).unwrap();
    assert_eq!(engine.state(), EngineState::Created);
    engine.start().unwrap();
    assert_eq!(engine.state(), EngineState::Idle);
    let outcome =
        engine.evaluate_captured(&increment_counter(&fx), "count++", &frame(), &[]).unwrap();
    assert_eq!(outcome.effects.len(), 1);
    assert_eq!(fx.counter(), Value::Int(1));
}

#[test]
fn test_state_machine_misuse() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = CaptureEngine::new(fx.debuggee(), CaptureConfig::default());

    let err = engine.start_capture().unwrap_err();
    assert!(matches!(err, CaptureError::InvalidState { state: EngineState::Created, .. }));
    assert!(!err.is_fatal());

    engine.start().unwrap();
    assert!(engine.start().is_err());
    assert!(engine.stop_capture().is_err());
    assert!(engine.check_arguments(&[Value::Object(fx.values_array)]).is_err());

    engine.start_capture().unwrap();
    assert!(engine.start_capture().is_err());
    assert!(engine.enable(false).is_err());
    assert_eq!(engine.state(), EngineState::Recording);

    engine.stop().unwrap();
    assert_eq!(engine.state(), EngineState::Terminal);
    assert!(matches!(
        engine.start_capture(),
        Err(CaptureError::InvalidState { state: EngineState::Terminal, .. })
    ));
    assert!(engine.enable(true).is_err());
    engine.stop().unwrap();
}

#[test]
fn test_stop_while_recording_reverts_open_session() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    engine.start_capture().unwrap();
    increment_counter(&fx)("count++", &frame()).unwrap();
    assert_eq!(fx.counter(), Value::Int(1));

    engine.stop().unwrap();
    assert_eq!(fx.counter(), Value::Int(0));
    assert_eq!(fx.vm.request_count(), 0);
}

#[test]
fn test_write_back_failure_is_fatal() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let location = Location::Variable { name: "gone".into(), thread: EVAL_THREAD };
    let effect = Effect::new(
        location.clone(),
        Snapshot::Scalar(Value::Int(0)),
        Snapshot::Scalar(Value::Int(1)),
    )
    .unwrap();
    let effects = EffectSet::pinned(vec![effect], engine.pin_table()).unwrap();

    engine.start_capture().unwrap();
    let err = engine.redo_and_record_effects(&effects).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CaptureError::WriteBack { location: l, .. } if l == location));
    engine.stop_capture().unwrap();
}

#[test]
fn test_undo_failure_at_close_is_fatal() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    // `before` no longer fits the field's declared type, so it cannot be written back
    let location = Location::InstanceField { object: fx.holder, field: field_info(&fx, fx.total) };
    let effect = Effect::new(
        location.clone(),
        Snapshot::Scalar(Value::Long(5)),
        Snapshot::Scalar(Value::Int(1)),
    )
    .unwrap();
    let effects = EffectSet::pinned(vec![effect], engine.pin_table()).unwrap();

    engine.start_capture().unwrap();
    engine.redo_and_record_effects(&effects).unwrap();
    assert_eq!(fx.holder_field(fx.total), Value::Int(1));

    let err = engine.stop_capture().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, CaptureError::WriteBack { location: l, .. } if l == location));
    assert_eq!(engine.state(), EngineState::Idle);

    drop(effects);
    assert_eq!(engine.pin_table().pinned_objects(), 0);
    assert_eq!(fx.vm.pinned_count(), 0);

    // The next session starts from a clean slate
    engine.start_capture().unwrap();
    assert!(engine.stop_capture().unwrap().is_empty());
}

#[test]
fn test_callback_failure_surfaces_at_close() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    // A method-entry event on the reflective type whose receiver is not a field mirror
    let bogus_mirror = fx.holder;
    let candidate: Eval<'_> = Box::new(|_, frame| {
        let program = fx.vm.program(frame.thread);
        program.put_static(fx.count, Value::Int(3))?;
        program.reflective_set("set", bogus_mirror, Value::Null, Value::Int(1))?;
        Ok(Value::Null)
    });

    let (result, errors) = with_error_capture(|| {
        engine.evaluate_captured(&candidate, "broken", &frame(), &[])
    });
    let err = result.unwrap_err();
    assert!(matches!(err, CaptureError::Callback(_)));
    assert!(err.is_fatal());
    assert!(errors.has_errors());
    assert_eq!(fx.counter(), Value::Int(0));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn test_candidate_exception_still_undone() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default()).unwrap();

    let candidate: Eval<'_> = Box::new(|_, frame| {
        fx.vm.program(frame.thread).put_static(fx.count, Value::Int(4))?;
        Err(EvaluationError::Exception { message: "java.lang.IllegalStateException".into() })
    });
    let outcome = engine.evaluate_captured(&candidate, "fail()", &frame(), &[]).unwrap();

    assert!(!outcome.is_success());
    assert_eq!(outcome.effects.len(), 1);
    assert_eq!(fx.counter(), Value::Int(0));
}

#[test]
fn test_live_type_filter() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let base = fx.vm.load_type(TypeSpec::abstract_class("demo.Base").field("shared", "I")).unwrap();
    let derived = fx.vm.load_type(TypeSpec::class("demo.Derived").extends(base)).unwrap();
    let unused = fx.vm.load_type(TypeSpec::class("demo.Unused").field("x", "I")).unwrap();
    fx.vm.new_instance(derived).unwrap();
    let shared = fx.vm.field_id(base, "shared").unwrap();
    let x = fx.vm.field_id(unused, "x").unwrap();

    let engine = fx.engine(CaptureConfig::default()).unwrap();
    let requests = fx.vm.requests();
    assert!(requests.contains(&EventRequest::FieldModification(shared)));
    assert!(!requests.contains(&EventRequest::FieldModification(x)));
    drop(engine);
    assert_eq!(fx.vm.request_count(), 0);

    let _engine = fx.engine(CaptureConfig::default().with_live_type_filter(false)).unwrap();
    assert!(fx.vm.requests().contains(&EventRequest::FieldModification(x)));
}

#[test]
fn test_reflection_interception_can_be_disabled() {
    init::init_test_environment();
    info!("Running test");
    let fx = Fixture::new().unwrap();
    let mut engine = fx.engine(CaptureConfig::default().with_reflection(false)).unwrap();
    assert!(!fx.vm.requests().iter().any(|r| matches!(r, EventRequest::MethodEntry { .. })));

    let mirror = fx.vm.reflect_field(fx.total).unwrap();
    let candidate: Eval<'_> = Box::new(|_, frame| {
        fx.vm.program(frame.thread).reflective_set(
            "setInt",
            mirror,
            Value::Object(fx.holder),
            Value::Int(2),
        )?;
        Ok(Value::Null)
    });
    let outcome = engine.evaluate_captured(&candidate, "reflect", &frame(), &[]).unwrap();
    assert!(outcome.effects.is_empty());
    assert_eq!(fx.holder_field(fx.total), Value::Int(2));
}
