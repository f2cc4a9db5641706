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

//! Test utilities for integration tests

use std::sync::Arc;

use sidetrack_common::types::{FieldId, ObjectRef, ThreadId, TypeId, Value};
use sidetrack_engine::{
    sim::{SimulatedVm, TypeSpec, MAIN_THREAD},
    CaptureConfig, CaptureEngine, Debuggee, StackFrame,
};

/// Initialization utilities for tests
pub mod init {
    /// Initialize logging for a test
    pub fn init_test_environment() {
        sidetrack_common::logging::ensure_test_logging(None);
    }
}

/// Logging and error capture utilities for tests
pub mod logging {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    /// A tracing layer that captures error logs
    #[derive(Clone, Default)]
    pub struct ErrorCapture {
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl ErrorCapture {
        /// Create a new ErrorCapture instance
        pub fn new() -> Self {
            Self::default()
        }

        /// Retrieve captured error messages
        pub fn get_errors(&self) -> Vec<String> {
            self.errors.lock().clone()
        }

        /// Check if any errors were captured
        pub fn has_errors(&self) -> bool {
            !self.errors.lock().is_empty()
        }
    }

    impl<S> tracing_subscriber::Layer<S> for ErrorCapture
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if event.metadata().level() != &Level::ERROR {
                return;
            }

            struct MessageVisitor {
                message: String,
            }

            impl tracing::field::Visit for MessageVisitor {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.message = format!("{value:?}");
                    }
                }

                fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                    if field.name() == "message" {
                        self.message = value.to_string();
                    }
                }
            }

            let mut visitor = MessageVisitor { message: String::new() };
            event.record(&mut visitor);
            if !visitor.message.is_empty() {
                self.errors.lock().push(visitor.message);
            }
        }
    }

    /// Run `f` with a thread-local subscriber capturing error logs
    pub fn with_error_capture<T>(f: impl FnOnce() -> T) -> (T, ErrorCapture) {
        let capture = ErrorCapture::new();
        let subscriber = tracing_subscriber::registry()
            .with(capture.clone())
            .with(tracing_subscriber::fmt::layer().with_test_writer());
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, capture)
    }
}

/// The thread candidates run on
pub const EVAL_THREAD: ThreadId = MAIN_THREAD;

/// Frame candidates are evaluated in
pub fn frame() -> StackFrame {
    StackFrame::top(EVAL_THREAD)
}

/// A small heap: a static counter and a holder object with array-valued fields.
///
/// ```text
/// class demo.Counter { static int count = 0; }
/// class demo.Holder  { int[] values; int[][] matrix; Object any; int total; final int[] fixed; }
///
/// holder.values = a = {10}
/// holder.matrix = {{1, 2}, {3}}
/// holder.fixed  = {7, 7}
/// local `a` in EVAL_THREAD refers to the same array as holder.values
/// ```
#[derive(Debug)]
pub struct Fixture {
    /// The simulated debuggee
    pub vm: Arc<SimulatedVm>,
    /// `demo.Counter`
    pub counter_type: TypeId,
    /// `Counter.count`
    pub count: FieldId,
    /// `demo.Holder`
    pub holder_type: TypeId,
    /// The one live holder
    pub holder: ObjectRef,
    /// `Holder.values`
    pub values: FieldId,
    /// `Holder.matrix`
    pub matrix: FieldId,
    /// `Holder.any`
    pub any: FieldId,
    /// `Holder.total`
    pub total: FieldId,
    /// `Holder.fixed`
    pub fixed: FieldId,
    /// The array in `holder.values` and local `a`
    pub values_array: ObjectRef,
    /// The array in `holder.matrix`
    pub matrix_array: ObjectRef,
    /// Rows of `holder.matrix`
    pub rows: [ObjectRef; 2],
    /// The array in `holder.fixed`
    pub fixed_array: ObjectRef,
}

impl Fixture {
    /// Build the heap
    pub fn new() -> eyre::Result<Self> {
        let vm = SimulatedVm::new();

        let counter_type =
            vm.load_type(TypeSpec::class("demo.Counter").static_field("count", "I", 0.into()))?;
        let holder_type = vm.load_type(
            TypeSpec::class("demo.Holder")
                .field("values", "[I")
                .field("matrix", "[[I")
                .field("any", "Ljava/lang/Object;")
                .field("total", "I")
                .final_field("fixed", "[I"),
        )?;

        let count = vm.field_id(counter_type, "count")?;
        let values = vm.field_id(holder_type, "values")?;
        let matrix = vm.field_id(holder_type, "matrix")?;
        let any = vm.field_id(holder_type, "any")?;
        let total = vm.field_id(holder_type, "total")?;
        let fixed = vm.field_id(holder_type, "fixed")?;

        let holder = vm.new_instance(holder_type)?;
        let values_array = vm.new_int_array(&[10])?;
        let rows = [vm.new_int_array(&[1, 2])?, vm.new_int_array(&[3])?];
        let matrix_array = vm.new_array("[I", rows.iter().map(|r| Value::Object(*r)).collect())?;
        let fixed_array = vm.new_int_array(&[7, 7])?;

        vm.set_field(Some(holder.id), values, Value::Object(values_array))?;
        vm.set_field(Some(holder.id), matrix, Value::Object(matrix_array))?;
        vm.set_field(Some(holder.id), fixed, Value::Object(fixed_array))?;
        vm.declare_local(EVAL_THREAD, "a", Value::Object(values_array));

        Ok(Self {
            vm,
            counter_type,
            count,
            holder_type,
            holder,
            values,
            matrix,
            any,
            total,
            fixed,
            values_array,
            matrix_array,
            rows,
            fixed_array,
        })
    }

    /// The debuggee as a trait object
    pub fn debuggee(&self) -> Arc<dyn Debuggee> {
        Arc::clone(&self.vm) as Arc<dyn Debuggee>
    }

    /// A started engine over this heap
    pub fn engine(&self, config: CaptureConfig) -> eyre::Result<CaptureEngine> {
        let mut engine = CaptureEngine::new(self.debuggee(), config);
        engine.start()?;
        Ok(engine)
    }

    /// Current elements of `array`
    pub fn elements(&self, array: ObjectRef) -> Vec<Value> {
        self.vm.array_values(array.id).unwrap_or_default()
    }

    /// Current value of `Counter.count`
    pub fn counter(&self) -> Value {
        self.vm.get_field(None, self.count).unwrap_or(Value::Null)
    }

    /// Current value of a holder field
    pub fn holder_field(&self, field: FieldId) -> Value {
        self.vm.get_field(Some(self.holder.id), field).unwrap_or(Value::Null)
    }
}

/// `Value::Int` elements from integers
pub fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().map(|v| Value::Int(*v)).collect()
}
