#![no_main]
use helios::registers::{Block, RegisterMap};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Interpret the input as u16 register stream in big-endian pairs
    let regs: Vec<u16> = data
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect();

    let Ok(map) = RegisterMap::standard() else {
        return;
    };
    // Decoding must be total for any length, including short reads
    for block in [Block::ConnectorState, Block::Wattmeter, Block::GlobalConfig] {
        let decoded = map.decode_block(block, &regs);
        let _ = decoded.anomalies();
        let _ = decoded.error_flags();
    }
});
