//! Fuzz target: `codec::decode_binary`
//!
//! Arbitrary bytes on the binary command topic must decode to a command,
//! the no-op, or a typed error. Never a panic, and never a known command
//! whose argument block has the wrong length.
//!
//! cargo fuzz run fuzz_binary_command

#![no_main]

use libfuzzer_sys::fuzz_target;
use sensorlink::rpc::codec::{self, ReplyFormat};

fuzz_target!(|data: &[u8]| {
    if let Ok(cmd) = codec::decode_binary(data) {
        assert_eq!(cmd.reply_format, ReplyFormat::Binary);
        if !cmd.is_nop() {
            assert_eq!(cmd.args.len(), cmd.key.args_len());
        }
    }
});
