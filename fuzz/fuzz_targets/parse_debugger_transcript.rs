#![no_main]

use libfuzzer_sys::fuzz_target;
use lockstep_drivers::{cdb, gdb};

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 64 * 1024 {
        &data[..64 * 1024]
    } else {
        data
    };
    let Some((&count, rest)) = data.split_first() else {
        return;
    };
    let text = String::from_utf8_lossy(rest);
    let count = usize::from(count % 64);

    let _ = cdb::parse_cdb_registers(&text);
    let _ = cdb::parse_cdb_units(&text, count, 2);
    let _ = cdb::parse_cdb_units(&text, count, 8);
    let _ = cdb::parse_cdb_ln(&text);
    let _ = cdb::parse_cdb_x(&text, "KERNEL32!GetTickCount");
    let _ = cdb::is_cdb_prompt(&text);

    let _ = gdb::parse_gdb_registers(&text);
    let _ = gdb::parse_gdb_bytes(&text, count);
    let _ = gdb::parse_gdb_info_symbol(&text);
    let _ = gdb::parse_gdb_info_address(&text);
    let _ = gdb::gdb_exit_detail(&text);
});
