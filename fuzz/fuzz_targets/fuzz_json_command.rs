//! Fuzz target: `codec::decode_json`
//!
//! cargo fuzz run fuzz_json_command

#![no_main]

use libfuzzer_sys::fuzz_target;
use sensorlink::rpc::codec;

fuzz_target!(|data: &[u8]| {
    if let Ok(cmd) = codec::decode_json(data) {
        if !cmd.is_nop() {
            assert_eq!(cmd.args.len(), cmd.key.args_len());
        }
    }
    // Used for error replies; must cope with anything.
    let _ = codec::json_command_name(data);
});
