//! Functions implemented in Rust and exposed to Lox as globals.

use std::time::{SystemTime, UNIX_EPOCH};

use super::Vm;
use crate::value::Value;

pub(super) fn define_all(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
}

/// Seconds since the Unix epoch, with sub-second precision.
fn clock(_args: &[Value]) -> Result<Value, String> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| Value::Number(elapsed.as_secs_f64()))
        .map_err(|e| e.to_string())
}
