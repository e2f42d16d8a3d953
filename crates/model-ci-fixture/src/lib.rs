// CoBus - Cosimulation Signal Bus
// Copyright (C) 2026 CoBus Team
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! CI fixture model: a counter plus an optional binary message, loaded
//! through the dynamic model interface by loader and CLI tests.

use cobus_core::ModelDesc;

const COUNTER_START: f64 = 42.0;

#[no_mangle]
pub extern "Rust" fn model_create(desc: &mut ModelDesc) -> i32 {
    if let Some(idx) = desc.index("data", Some("counter")) {
        *desc.scalar_mut(&idx).unwrap() = COUNTER_START;
    }
    0
}

#[no_mangle]
pub extern "Rust" fn model_step(desc: &mut ModelDesc, model_time: &mut f64, stop_time: f64) -> i32 {
    let Some(idx) = desc.index("data", Some("counter")) else {
        return -22;
    };
    let value = {
        let scalar = desc.scalar_mut(&idx).unwrap();
        *scalar += 1.0;
        *scalar
    };

    if let Some(bidx) = desc.index("binary", Some("message")) {
        let (vi, si) = (bidx.vector, bidx.signal.unwrap());
        let message = format!("count is {}\0", value as i64);
        desc.sv[vi].reset(si);
        desc.sv[vi].append(si, message.as_bytes());
    }

    *model_time = stop_time;
    0
}

#[no_mangle]
pub extern "Rust" fn model_destroy(_desc: &mut ModelDesc) {}
