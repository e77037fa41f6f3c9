#![no_main]

use libfuzzer_sys::fuzz_target;
use vcd::{ParseOptions, VarRecords, Vcd};

fuzz_target!(|data: &[u8]| {
    // Odd first byte picks lenient `$var` handling.
    let var_records = match data.first() {
        Some(b) if b % 2 == 1 => VarRecords::Lenient,
        _ => VarRecords::Strict,
    };
    let options = ParseOptions {
        max_header_bytes: 64 * 1024,
        var_records,
        ..Default::default()
    };

    if let Ok(vcd) = Vcd::parse(data, &options) {
        vcd.validate().unwrap();
    }
});
