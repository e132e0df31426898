use super::object::Native;
use super::value::Value;
use super::vm::Vm;
use rand::prelude::*;

/// Process CPU time in seconds, the C `clock()/CLOCKS_PER_SEC` measure.
#[cfg(unix)]
fn cpu_time_seconds() -> f64 {
    // The `libc` crate doesn't bind C's `clock()`/`CLOCKS_PER_SEC` on this
    // platform, so declare the (standard, POSIX-guaranteed) symbol directly.
    extern "C" {
        fn clock() -> libc::clock_t;
    }
    const CLOCKS_PER_SEC: libc::clock_t = 1_000_000;
    let ticks = unsafe { clock() };
    ticks as f64 / CLOCKS_PER_SEC as f64
}

/// Platforms without the C clock interface fall back to wall-clock
/// seconds from a fixed origin; deltas still measure elapsed time.
#[cfg(not(unix))]
fn cpu_time_seconds() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn clock(_vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(0, argc)?;
    Ok(Value::Number(cpu_time_seconds()))
}

pub fn rand(_vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(0, argc)?;
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen::<f64>()))
}

pub fn str_(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let repr = vm.get_any(1, argc).display(vm.heap());
    Ok(Value::Obj(vm.intern(repr)))
}

pub fn number(vm: &mut Vm, argc: usize) -> Result<Value, String> {
    Vm::check_arity(1, argc)?;
    let chars = vm.get_string(1, argc)?;
    let n: f64 = chars
        .parse()
        .map_err(|_| format!("'{}' is not a number.", chars))?;
    Ok(Value::Number(n))
}

pub const NATIVES: [(&str, Native); 4] = [
    ("clock", clock),
    ("rand", rand),
    ("str", str_),
    ("number", number),
];
