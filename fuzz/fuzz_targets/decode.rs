//! Fuzz the bytecode image decoder: arbitrary bytes must either decode into
//! a program that re-encodes to the same image, or be rejected cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;

use es5run::Program;

fuzz_target!(|data: &[u8]| {
    if let Ok(program) = Program::from_bytes(data) {
        let reencoded = program.to_bytes();
        let decoded_again = Program::from_bytes(&reencoded).expect("re-encoded image decodes");
        assert_eq!(decoded_again, program);
    }
});
